use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::{
    Client,
    api::{Api, ListParams, ResourceExt},
    runtime::reflector,
};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tracing::*;

use crate::{
    Error, ObjectBucket, ObjectBucketClaim, Result,
    api::Provisioner,
    cluster::{Cluster, KubeCluster},
    config::ControllerConfig,
    queue::WorkQueue,
    resources::{claim_for_key, set_claim_phase, storage_class_for_claim},
    state::{SyncAction, SyncEvent, transition},
};

mod delete;
pub mod informer;
mod provision;
mod update;

pub use delete::handle_delete_claim;
pub use provision::handle_provision_claim;
pub use update::handle_update_claim;

pub static MANAGER_NAME: &str = "bucket-provisioner";

// Context for our sync handler
#[derive(Clone)]
pub struct Context {
    /// Reads and writes of claims, bucket records, secrets and config maps
    pub cluster: Arc<dyn Cluster>,
    /// The storage backend
    pub provisioner: Arc<dyn Provisioner>,
    pub config: Arc<ControllerConfig>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub syncs_succeeded: u64,
    pub syncs_failed: u64,
    /// Bucket records currently in the reflector cache
    pub object_buckets: usize,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            syncs_succeeded: 0,
            syncs_failed: 0,
            object_buckets: 0,
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the workers
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Context that can update State
    pub fn to_context(
        &self,
        cluster: Arc<dyn Cluster>,
        provisioner: Arc<dyn Provisioner>,
        config: ControllerConfig,
    ) -> Arc<Context> {
        Arc::new(Context {
            cluster,
            provisioner,
            config: Arc::new(config),
            diagnostics: self.diagnostics.clone(),
        })
    }
}

/// Bring one claim in line with what its spec and metadata ask for.
///
/// The claim is read fresh from the API server: the key may have waited in the
/// queue long enough for the cached copy to be out of date.
pub async fn sync_handler(ctx: &Context, key: &str) -> Result<()> {
    info!("reconciling claim");
    let cluster = ctx.cluster.as_ref();

    // A claim that vanished before a finalizer was put on it was never provisioned
    let Some(claim) = claim_for_key(cluster, key).await? else {
        info!("claim vanished, assuming it was deleted");
        return Ok(());
    };

    let class = storage_class_for_claim(cluster, &claim).await?;
    if class.provisioner != ctx.config.provisioner_name {
        info!(got = %class.provisioner, "unsupported provisioner");
        return Ok(());
    }

    let event = SyncEvent::classify(&claim);
    let step = transition(claim.phase(), event);
    debug!(?event, ?step, "classified claim");
    match step.action {
        SyncAction::Delete => {
            info!("claim deleted, proceeding with cleanup");
            handle_delete_claim(ctx, key, &claim).await?;
        }
        SyncAction::Update => {
            info!("updating claim");
            handle_update_claim(ctx, key, &claim).await?;
        }
        SyncAction::Provision => {
            // record the phase before anything can fail, so a failed creation is
            // distinguishable from a quiet claim
            let claim = match step.entry_phase {
                Some(phase) => set_claim_phase(cluster, &ctx.config.retry, &claim, phase).await?,
                None => claim,
            };
            handle_provision_claim(ctx, key, claim, &class).await?;
        }
    }
    debug!(phase = %step.next_phase, "claim synced");
    Ok(())
}

/// Pop one key and sync it. Returns false once the queue has shut down.
pub async fn process_next_item(ctx: &Arc<Context>, queue: &WorkQueue) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    // a panic in the handler must not take the worker down with it
    let outcome = {
        let ctx = ctx.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let span = info_span!("sync", key = %key);
            sync_handler(&ctx, &key).instrument(span).await
        })
        .await
    };

    let succeeded = match outcome {
        Ok(Ok(())) => {
            queue.forget(&key).await;
            true
        }
        Ok(Err(Error::InvalidKey(k))) => {
            // retrying cannot fix a malformed key
            queue.forget(&key).await;
            error!("dropping invalid work queue key {k:?}");
            false
        }
        Ok(Err(e)) => {
            queue.add_rate_limited(&key).await;
            error!("error syncing {key:?}: {e}, requeuing");
            false
        }
        Err(join_error) => {
            queue.add_rate_limited(&key).await;
            error!("sync of {key:?} crashed: {join_error}, requeuing");
            false
        }
    };
    queue.done(&key).await;

    let mut diagnostics = ctx.diagnostics.write().await;
    diagnostics.last_event = Utc::now();
    if succeeded {
        diagnostics.syncs_succeeded += 1;
    } else {
        diagnostics.syncs_failed += 1;
    }
    true
}

pub async fn run_worker(ctx: Arc<Context>, queue: WorkQueue) {
    while process_next_item(&ctx, &queue).await {}
}

/// Watches claims and hands them to a pool of workers
pub struct ProvisionController {
    client: Client,
    ctx: Arc<Context>,
    queue: WorkQueue,
}

impl ProvisionController {
    pub fn new(client: Client, provisioner: Arc<dyn Provisioner>, config: ControllerConfig, state: &State) -> Self {
        let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::new(client.clone(), MANAGER_NAME));
        Self {
            client,
            ctx: state.to_context(cluster, provisioner, config),
            queue: WorkQueue::default(),
        }
    }

    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run_until_signal(self) -> Result<()> {
        self.run(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves. Workers start once both caches have synced,
    /// and finish the item they hold before returning.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let claims = Api::<ObjectBucketClaim>::all(self.client.clone());
        let buckets = Api::<ObjectBucket>::all(self.client.clone());
        if let Err(e) = claims.list(&ListParams::default().limit(1)).await {
            error!("ObjectBucketClaim CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen -- --stdout | kubectl apply -f -");
            return Err(Error::KubeError(e));
        }

        let (claims_synced_tx, mut claims_synced) = watch::channel(false);
        let claim_informer = tokio::spawn(informer::watch_claims(claims, self.queue.clone(), claims_synced_tx));
        let (reader, writer) = reflector::store::<ObjectBucket>();
        let bucket_informer = tokio::spawn(informer::watch_buckets(
            buckets,
            writer,
            reader.clone(),
            self.ctx.diagnostics.clone(),
        ));

        tokio::pin!(shutdown);
        let synced = async {
            claims_synced
                .wait_for(|synced| *synced)
                .await
                .map_err(|_| Error::OtherError("claim informer stopped".into()))?;
            reader
                .wait_until_ready()
                .await
                .map_err(|e| Error::OtherError(format!("object bucket informer stopped: {e}")))
        };
        let ready = tokio::select! {
            res = synced => Some(res),
            _ = &mut shutdown => None,
        };
        let workers: Vec<_> = match ready {
            Some(Ok(())) => {
                let threads = self.ctx.config.threads.max(1);
                info!(threads, provisioner = %self.ctx.config.provisioner_name, "caches synced, starting workers");
                (0..threads)
                    .map(|_| tokio::spawn(run_worker(self.ctx.clone(), self.queue.clone())))
                    .collect()
            }
            Some(Err(e)) => {
                claim_informer.abort();
                bucket_informer.abort();
                return Err(e);
            }
            None => Vec::new(),
        };

        if !workers.is_empty() {
            shutdown.await;
        }
        info!("shutting down");
        self.queue.shut_down().await;
        claim_informer.abort();
        bucket_informer.abort();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("worker exited abnormally: {e}");
            }
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `namespace/name`, for messages
pub(crate) fn claim_display(claim: &ObjectBucketClaim) -> String {
    format!("{}/{}", claim.namespace().unwrap_or_default(), claim.name_any())
}

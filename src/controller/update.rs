use std::collections::BTreeMap;

use kube::api::ResourceExt;
use tracing::*;

use super::Context;
use crate::{
    Error, ObjectBucket, ObjectBucketClaim, Result,
    api::Provisioner,
    cluster::Cluster,
    naming::object_bucket_name,
    resources::{get_bucket, update_bucket},
    retry::RetryPolicy,
};

/// Push a changed `additionalConfig` to the backend and onto the bucket record
pub async fn handle_update_claim(ctx: &Context, key: &str, claim: &ObjectBucketClaim) -> Result<()> {
    let cluster = ctx.cluster.as_ref();
    let policy = &ctx.config.retry;
    let ob_name = match claim.spec.object_bucket_name.as_str() {
        "" => object_bucket_name(key)?,
        name => name.to_string(),
    };
    let ob = get_bucket(cluster, policy, &ob_name)
        .await?
        .ok_or_else(|| Error::MissingObjectBucket(format!("object bucket {ob_name:?} not found")))?;

    let desired = claim.spec.additional_config.clone();
    if ob.additional_config() == desired {
        debug!(ob = %ob_name, "additional config unchanged");
        return Ok(());
    }

    info!(ob = %ob_name, "additional config changed, updating bucket");
    let staged = StagedConfig::new(ob, desired);
    staged.apply(ctx.provisioner.as_ref()).await?;
    match staged.commit(cluster, policy).await {
        Ok(_) => Ok(()),
        Err(commit_err) => {
            error!(ob = %ob_name, "error recording new config, rolling back: {commit_err}");
            match staged.rollback(ctx.provisioner.as_ref()).await {
                Ok(()) => Err(commit_err),
                Err(e) => Err(e),
            }
        }
    }
}

/// A config change held between the backend update and the record write, so a
/// failed write can be undone in the backend
struct StagedConfig {
    staged: ObjectBucket,
    previous: BTreeMap<String, String>,
}

impl StagedConfig {
    fn new(mut ob: ObjectBucket, config: BTreeMap<String, String>) -> Self {
        let previous = ob.additional_config();
        ob.spec.endpoint.get_or_insert_with(Default::default).additional_config_data = config;
        Self { staged: ob, previous }
    }

    async fn apply(&self, provisioner: &dyn Provisioner) -> Result<()> {
        provisioner.update(&self.staged).await.map_err(Error::BackendError)
    }

    async fn commit(&self, cluster: &dyn Cluster, policy: &RetryPolicy) -> Result<ObjectBucket> {
        let config = self.staged.additional_config();
        update_bucket(cluster, policy, &self.staged, |b| {
            b.spec.endpoint.get_or_insert_with(Default::default).additional_config_data = config.clone();
        })
        .await
    }

    async fn rollback(&self, provisioner: &dyn Provisioner) -> Result<()> {
        let mut restored = self.staged.clone();
        restored.spec.endpoint.get_or_insert_with(Default::default).additional_config_data = self.previous.clone();
        provisioner.update(&restored).await.map_err(|e| {
            error!(ob = %restored.name_any(), "rollback failed, backend and record disagree: {e}");
            Error::BackendError(e)
        })
    }
}

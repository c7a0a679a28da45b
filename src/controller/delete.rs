use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::ResourceExt;
use tracing::*;

use super::Context;
use crate::{
    BucketPhase, Error, ObjectBucket, ObjectBucketClaim, Result,
    api::ProvisioningMode,
    naming::object_bucket_name,
    resources::{delete_bucket, release_claim, release_config_map, release_secret, set_bucket_phase},
    retry::retry,
};

/// Release the bucket according to its reclaim policy, then every object the
/// claim owns, then the claim itself.
pub async fn handle_delete_claim(ctx: &Context, key: &str, claim: &ObjectBucketClaim) -> Result<()> {
    info!("syncing claim deletion");
    let cluster = ctx.cluster.as_ref();
    let policy = &ctx.config.retry;

    let ob_name = object_bucket_name(key)?;
    let ns = claim.namespace().unwrap_or_default();
    let name = claim.name_any();
    let ob = retry(policy, "getting object bucket", || cluster.get_bucket(&ob_name)).await?;
    let secret = retry(policy, "getting secret", || cluster.get_secret(&ns, &name)).await?;
    let cm = retry(policy, "getting configmap", || cluster.get_config_map(&ns, &name)).await?;

    let Some(ob) = ob else {
        warn!(ob = %ob_name, "object bucket not found, assuming it was already deleted");
        return release_resources(ctx, None, secret.as_ref(), cm.as_ref(), claim).await;
    };
    let Some(reclaim) = ob.spec.reclaim_policy else {
        error!(ob = %ob_name, "object bucket has no reclaim policy, leaving it in place");
        return Ok(());
    };

    // an unreadable class must not turn a dynamic bucket into a revoked one
    let mode = provisioning_mode_of(ctx, &ob).await?;
    let ob = set_bucket_phase(cluster, policy, &ob, BucketPhase::Released).await?;
    let released = if mode.destroys_on_release(reclaim) {
        info!(ob = %ob_name, "deleting bucket");
        ctx.provisioner.delete(&ob).await
    } else {
        info!(ob = %ob_name, ?mode, ?reclaim, "revoking access to bucket");
        ctx.provisioner.revoke(&ob).await
    };
    // keep everything in place so the next attempt can try again
    released.map_err(Error::BackendError)?;

    release_resources(ctx, Some(&ob), secret.as_ref(), cm.as_ref(), claim).await
}

/// The mode recorded at provisioning time, falling back to the storage class for
/// records written without it. Only a class that is gone means static.
async fn provisioning_mode_of(ctx: &Context, ob: &ObjectBucket) -> Result<ProvisioningMode> {
    if let Some(mode) = ProvisioningMode::from_annotation(ob) {
        return Ok(mode);
    }
    let class_name = &ob.spec.storage_class_name;
    let class = retry(&ctx.config.retry, "getting storage class", || {
        ctx.cluster.get_storage_class(class_name)
    })
    .await?;
    match class {
        Some(class) => Ok(ProvisioningMode::for_class(&class)),
        None => {
            warn!(class = %class_name, "storage class gone, treating bucket as static");
            Ok(ProvisioningMode::Static)
        }
    }
}

/// Delete whatever still exists. Every step is attempted; the last error wins.
async fn release_resources(
    ctx: &Context,
    ob: Option<&ObjectBucket>,
    secret: Option<&Secret>,
    cm: Option<&ConfigMap>,
    claim: &ObjectBucketClaim,
) -> Result<()> {
    let cluster = ctx.cluster.as_ref();
    let policy = &ctx.config.retry;
    let mut last_err = None;

    if let Some(ob) = ob {
        if let Err(e) = delete_bucket(cluster, policy, &ob.name_any()).await {
            error!(ob = %ob.name_any(), "error deleting object bucket: {e}");
            last_err = Some(e);
        }
    }
    if let Some(secret) = secret {
        if let Err(e) = release_secret(cluster, policy, secret).await {
            error!(secret = %secret.name_any(), "error deleting secret: {e}");
            last_err = Some(e);
        }
    }
    if let Some(cm) = cm {
        if let Err(e) = release_config_map(cluster, policy, cm).await {
            error!(configmap = %cm.name_any(), "error deleting configmap: {e}");
            last_err = Some(e);
        }
    }
    if let Err(e) = release_claim(cluster, policy, claim).await {
        error!("error releasing claim: {e}");
        last_err = Some(e);
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

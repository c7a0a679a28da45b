use std::collections::BTreeMap;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ResourceExt;
use tracing::*;

use super::{Context, claim_display};
use crate::{
    BucketPhase, ClaimPhase, ClaimReference, Error, FINALIZER, ObjectBucket, ObjectBucketClaim, ReclaimPolicy,
    Result,
    api::{BackendError, BucketOptions, PROVISIONING_MODE_ANNOTATION, ProvisioningMode, static_bucket_name},
    labels::add_finalizer,
    naming::{compose_bucket_name, object_bucket_name},
    resources::{
        create_bucket, create_config_map, create_secret, delete_bucket, delete_existing_secret_and_config_map,
        get_bucket, new_config_map, new_secret, set_bucket_phase, set_claim_phase, update_claim,
    },
};

/// Provision (or grant) a bucket for `claim` and bind it.
///
/// Safe to re-run after a crash at any point: the bucket name is persisted on the
/// claim before the backend is called, and an existing bucket record short-circuits
/// to binding without further backend calls.
pub async fn handle_provision_claim(
    ctx: &Context,
    key: &str,
    claim: ObjectBucketClaim,
    class: &StorageClass,
) -> Result<()> {
    info!("syncing claim creation");
    let cluster = ctx.cluster.as_ref();
    let policy = &ctx.config.retry;

    let claim = claim_meta_fields(ctx, &claim).await?;

    let mode = ProvisioningMode::for_class(class);
    let bucket_name = match mode {
        ProvisioningMode::Dynamic => compose_bucket_name(&claim)?,
        ProvisioningMode::Static => static_bucket_name(class).unwrap_or_default().to_string(),
    };
    if bucket_name.is_empty() {
        return Err(Error::MissingBucketName(format!(
            "no bucket name for claim {}",
            claim_display(&claim)
        )));
    }

    // a generated name must survive a crash, or the next attempt makes a second bucket
    let claim = if claim.spec.bucket_name.is_empty() {
        update_claim(cluster, policy, &claim, |c| c.spec.bucket_name = bucket_name.clone()).await?
    } else {
        claim
    };

    let ob_name = object_bucket_name(key)?;
    if let Some(ob) = get_bucket(cluster, policy, &ob_name).await? {
        info!(ob = %ob_name, "object bucket exists, binding");
        bind(ctx, &ob, &claim, &bucket_name).await?;
        return Ok(());
    }

    let options = BucketOptions {
        reclaim_policy: ReclaimPolicy::from_class(class.reclaim_policy.as_deref()),
        bucket_name: bucket_name.clone(),
        object_bucket_claim: claim.clone(),
        parameters: class.parameters.clone().unwrap_or_default(),
    };

    let mut acquired = None;
    let res = acquire_and_bind(ctx, key, &claim, &options, mode, &mut acquired).await;
    if let Err(e) = &res {
        if let Some(ob) = &acquired {
            cleanup(ctx, &claim, mode, ob, e).await;
        }
    }
    res?;
    info!(bucket = %bucket_name, ob = %ob_name, "claim bound");
    Ok(())
}

/// Finalizer and provisioner labels on the claim itself
async fn claim_meta_fields(ctx: &Context, claim: &ObjectBucketClaim) -> Result<ObjectBucketClaim> {
    let labels = ctx.config.labels.as_map();
    let labelled = labels
        .iter()
        .all(|(k, v)| claim.labels().get(k) == Some(v));
    let finalized = claim.finalizers().iter().any(|f| f == FINALIZER);
    if labelled && finalized {
        return Ok(claim.clone());
    }
    update_claim(ctx.cluster.as_ref(), &ctx.config.retry, claim, |c| {
        ctx.config.labels.apply(&mut c.metadata);
        add_finalizer(&mut c.metadata, FINALIZER);
    })
    .await
}

async fn acquire_and_bind(
    ctx: &Context,
    key: &str,
    claim: &ObjectBucketClaim,
    options: &BucketOptions,
    mode: ProvisioningMode,
    acquired: &mut Option<ObjectBucket>,
) -> Result<()> {
    let cluster = ctx.cluster.as_ref();
    let policy = &ctx.config.retry;

    info!(bucket = %options.bucket_name, "{} bucket", mode.verb());
    let ob = match mode.acquire(ctx.provisioner.as_ref(), options).await {
        Ok(ob) if ob.is_empty() => return Err(Error::EmptyBucket),
        Ok(ob) => ob,
        Err(e) => {
            if let Some(partial) = e.partial_bucket() {
                *acquired = Some(decorate(ctx, key, claim, options, mode, partial.clone())?);
            }
            return Err(Error::BackendError(e));
        }
    };
    let ob = decorate(ctx, key, claim, options, mode, ob)?;
    *acquired = Some(ob.clone());

    delete_existing_secret_and_config_map(cluster, policy, claim).await?;
    let secret = new_secret(claim, ob.spec.authentication.as_ref(), &ctx.config.labels)?;
    create_secret(cluster, policy, &secret).await?;
    let cm = new_config_map(claim, ob.spec.endpoint.as_ref(), &ctx.config.labels)?;
    create_config_map(cluster, policy, &cm).await?;

    let created = create_bucket(cluster, policy, &ob).await?;
    bind(ctx, &created, claim, &options.bucket_name).await
}

/// Fill in what the backend does not know about: naming, ownership and bookkeeping
fn decorate(
    ctx: &Context,
    key: &str,
    claim: &ObjectBucketClaim,
    options: &BucketOptions,
    mode: ProvisioningMode,
    mut ob: ObjectBucket,
) -> Result<ObjectBucket> {
    ob.metadata.name = Some(object_bucket_name(key)?);
    ob.spec.storage_class_name = claim.spec.storage_class_name.clone();
    if ob.spec.reclaim_policy.is_none() {
        ob.spec.reclaim_policy = options.reclaim_policy;
    }
    ob.spec.claim_ref = Some(ClaimReference {
        name: claim.name_any(),
        namespace: claim.namespace().unwrap_or_default(),
        uid: claim.uid(),
    });
    ctx.config.labels.apply(&mut ob.metadata);
    add_finalizer(&mut ob.metadata, FINALIZER);
    ob.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(PROVISIONING_MODE_ANNOTATION.to_string(), mode.as_str().to_string());
    Ok(ob)
}

/// Mark bucket record and claim bound to each other
async fn bind(ctx: &Context, ob: &ObjectBucket, claim: &ObjectBucketClaim, bucket_name: &str) -> Result<()> {
    let cluster = ctx.cluster.as_ref();
    let policy = &ctx.config.retry;
    let ob = if ob.phase() == Some(BucketPhase::Bound) {
        ob.clone()
    } else {
        set_bucket_phase(cluster, policy, ob, BucketPhase::Bound).await?
    };
    let ob_name = ob.name_any();
    let claim = if claim.spec.object_bucket_name == ob_name && claim.spec.bucket_name == bucket_name {
        claim.clone()
    } else {
        update_claim(cluster, policy, claim, |c| {
            c.spec.object_bucket_name = ob_name.clone();
            c.spec.bucket_name = bucket_name.to_string();
        })
        .await?
    };
    set_claim_phase(cluster, policy, &claim, ClaimPhase::Bound).await?;
    Ok(())
}

/// Best effort undo of a provisioning attempt that failed after the backend was reached
async fn cleanup(ctx: &Context, claim: &ObjectBucketClaim, mode: ProvisioningMode, ob: &ObjectBucket, cause: &Error) {
    let cluster = ctx.cluster.as_ref();
    let policy = &ctx.config.retry;
    warn!(ob = %ob.name_any(), "cleaning up after failed provisioning: {cause}");

    let backend_cause: Option<&BackendError> = match cause {
        Error::BackendError(e) => Some(e),
        _ => None,
    };
    if let Err(e) = mode.abandon(ctx.provisioner.as_ref(), ob, backend_cause).await {
        error!(ob = %ob.name_any(), "error releasing bucket in backend: {e}");
    }
    if let Err(e) = delete_bucket(cluster, policy, &ob.name_any()).await {
        error!(ob = %ob.name_any(), "error deleting object bucket: {e}");
    }
    if let Err(e) = delete_existing_secret_and_config_map(cluster, policy, claim).await {
        error!("error deleting secret and configmap: {e}");
    }
}

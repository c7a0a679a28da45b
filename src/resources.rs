//! Idempotent helpers for the objects a claim owns: its bucket record, Secret and ConfigMap.

use std::collections::BTreeMap;
use std::future::Future;

use k8s_openapi::api::{
    core::v1::{ConfigMap, Secret},
    storage::v1::StorageClass,
};
use kube::{
    Resource,
    api::{ObjectMeta, ResourceExt},
};
use tracing::*;

use crate::{
    Authentication, BucketPhase, ClaimPhase, Endpoint, Error, FINALIZER, ObjectBucket, ObjectBucketClaim,
    ObjectBucketClaimStatus, ObjectBucketStatus, Result,
    cluster::Cluster,
    labels::{ProvisionerLabels, add_finalizer, remove_finalizer},
    naming::split_key,
    retry::{RetryPolicy, retry},
};

pub const ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const BUCKET_HOST: &str = "BUCKET_HOST";
pub const BUCKET_PORT: &str = "BUCKET_PORT";
pub const BUCKET_NAME: &str = "BUCKET_NAME";
pub const BUCKET_REGION: &str = "BUCKET_REGION";
pub const BUCKET_SUBREGION: &str = "BUCKET_SUBREGION";
pub const BUCKET_SSL: &str = "BUCKET_SSL";

/// Compare-and-set update: apply `mutate` to the latest known copy and write it,
/// refetching and reapplying after a conflict.
async fn update_with<K, M, F, FFut, W, WFut>(
    policy: &RetryPolicy,
    what: &str,
    obj: &K,
    mutate: M,
    fetch: F,
    write: W,
) -> Result<K>
where
    K: Clone,
    M: Fn(&mut K),
    F: Fn() -> FFut,
    FFut: Future<Output = Result<Option<K>>>,
    W: Fn(K) -> WFut,
    WFut: Future<Output = Result<K>>,
{
    let mut retrier = policy.start();
    let mut current = obj.clone();
    loop {
        let mut desired = current.clone();
        mutate(&mut desired);
        match write(desired).await {
            Ok(updated) => return Ok(updated),
            Err(e) if retrier.wait(&e).await => {
                if e.is_conflict() {
                    match fetch().await? {
                        Some(latest) => current = latest,
                        None => return Err(e),
                    }
                }
            }
            Err(e) => return Err(retrier.give_up(e, what)),
        }
    }
}

pub async fn claim_for_key(cluster: &dyn Cluster, key: &str) -> Result<Option<ObjectBucketClaim>> {
    let (ns, name) = split_key(key)?;
    cluster.get_claim(ns, name).await
}

pub async fn storage_class_for_claim(cluster: &dyn Cluster, claim: &ObjectBucketClaim) -> Result<StorageClass> {
    let name = &claim.spec.storage_class_name;
    if name.is_empty() {
        return Err(Error::MissingStorageClass(format!(
            "no StorageClass defined for ObjectBucketClaim {:?}",
            claim.name_any()
        )));
    }
    cluster
        .get_storage_class(name)
        .await?
        .ok_or_else(|| Error::MissingStorageClass(format!("StorageClass {name:?} not found")))
}

pub async fn update_claim<M>(
    cluster: &dyn Cluster,
    policy: &RetryPolicy,
    claim: &ObjectBucketClaim,
    mutate: M,
) -> Result<ObjectBucketClaim>
where
    M: Fn(&mut ObjectBucketClaim),
{
    let ns = claim.namespace().unwrap_or_default();
    let name = claim.name_any();
    update_with(
        policy,
        "updating claim",
        claim,
        mutate,
        || cluster.get_claim(&ns, &name),
        move |c| async move { cluster.update_claim(&c).await },
    )
    .await
}

pub async fn set_claim_phase(
    cluster: &dyn Cluster,
    policy: &RetryPolicy,
    claim: &ObjectBucketClaim,
    phase: ClaimPhase,
) -> Result<ObjectBucketClaim> {
    debug!(claim = %claim.name_any(), %phase, "updating claim phase");
    let ns = claim.namespace().unwrap_or_default();
    let name = claim.name_any();
    update_with(
        policy,
        "updating claim status",
        claim,
        |c| c.status = Some(ObjectBucketClaimStatus { phase: Some(phase) }),
        || cluster.get_claim(&ns, &name),
        move |c| async move { cluster.update_claim_status(&c).await },
    )
    .await
}

/// Drop our finalizer from the claim so it can be garbage collected
pub async fn release_claim(cluster: &dyn Cluster, policy: &RetryPolicy, claim: &ObjectBucketClaim) -> Result<()> {
    if !claim.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    match update_claim(cluster, policy, claim, |c| {
        remove_finalizer(&mut c.metadata, FINALIZER);
    })
    .await
    {
        Err(e) if e.is_not_found() => Ok(()),
        res => res.map(|_| ()),
    }
}

pub async fn get_bucket(cluster: &dyn Cluster, policy: &RetryPolicy, name: &str) -> Result<Option<ObjectBucket>> {
    retry(policy, "getting object bucket", || cluster.get_bucket(name)).await
}

pub async fn create_bucket(cluster: &dyn Cluster, policy: &RetryPolicy, ob: &ObjectBucket) -> Result<ObjectBucket> {
    info!(ob = %ob.name_any(), "creating object bucket");
    retry(policy, "creating object bucket", || cluster.create_bucket(ob)).await
}

pub async fn update_bucket<M>(
    cluster: &dyn Cluster,
    policy: &RetryPolicy,
    ob: &ObjectBucket,
    mutate: M,
) -> Result<ObjectBucket>
where
    M: Fn(&mut ObjectBucket),
{
    let name = ob.name_any();
    update_with(
        policy,
        "updating object bucket",
        ob,
        mutate,
        || cluster.get_bucket(&name),
        move |b| async move { cluster.update_bucket(&b).await },
    )
    .await
}

pub async fn set_bucket_phase(
    cluster: &dyn Cluster,
    policy: &RetryPolicy,
    ob: &ObjectBucket,
    phase: BucketPhase,
) -> Result<ObjectBucket> {
    debug!(ob = %ob.name_any(), %phase, "updating object bucket phase");
    let name = ob.name_any();
    update_with(
        policy,
        "updating object bucket status",
        ob,
        |b| b.status = Some(ObjectBucketStatus { phase: Some(phase) }),
        || cluster.get_bucket(&name),
        move |b| async move { cluster.update_bucket_status(&b).await },
    )
    .await
}

/// Cluster-scoped records have no owner to be collected with, so they are deleted explicitly
pub async fn delete_bucket(cluster: &dyn Cluster, policy: &RetryPolicy, name: &str) -> Result<()> {
    if let Some(ob) = cluster.get_bucket(name).await? {
        if ob.finalizers().iter().any(|f| f == FINALIZER) {
            update_bucket(cluster, policy, &ob, |b| {
                remove_finalizer(&mut b.metadata, FINALIZER);
            })
            .await?;
        }
    }
    retry(policy, "deleting object bucket", || cluster.delete_bucket(name)).await
}

fn owned_meta(claim: &ObjectBucketClaim, labels: &ProvisionerLabels) -> Result<ObjectMeta> {
    let oref = claim
        .controller_owner_ref(&())
        .ok_or_else(|| Error::OtherError(format!("claim {:?} has no uid", claim.name_any())))?;
    let mut meta = ObjectMeta {
        name: Some(claim.name_any()),
        namespace: claim.namespace(),
        owner_references: Some(vec![oref]),
        ..ObjectMeta::default()
    };
    labels.apply(&mut meta);
    add_finalizer(&mut meta, FINALIZER);
    Ok(meta)
}

pub fn new_secret(
    claim: &ObjectBucketClaim,
    auth: Option<&Authentication>,
    labels: &ProvisionerLabels,
) -> Result<Secret> {
    let auth = auth.ok_or_else(|| Error::OtherError("object bucket carries no authentication".into()))?;
    let mut data = BTreeMap::new();
    if let Some(keys) = &auth.access_keys {
        data.insert(ACCESS_KEY_ID.to_string(), keys.access_key_id.clone());
        data.insert(SECRET_ACCESS_KEY.to_string(), keys.secret_access_key.clone());
    }
    data.extend(auth.additional_secret_config.clone());
    Ok(Secret {
        metadata: owned_meta(claim, labels)?,
        string_data: Some(data),
        ..Secret::default()
    })
}

pub fn new_config_map(
    claim: &ObjectBucketClaim,
    endpoint: Option<&Endpoint>,
    labels: &ProvisionerLabels,
) -> Result<ConfigMap> {
    let ep = endpoint.ok_or_else(|| Error::OtherError("object bucket carries no endpoint".into()))?;
    let mut data = BTreeMap::from([
        (BUCKET_HOST.to_string(), ep.bucket_host.clone()),
        (BUCKET_PORT.to_string(), ep.bucket_port.to_string()),
        (BUCKET_NAME.to_string(), ep.bucket_name.clone()),
        (BUCKET_REGION.to_string(), ep.region.clone()),
        (BUCKET_SUBREGION.to_string(), ep.sub_region.clone()),
        (BUCKET_SSL.to_string(), ep.ssl.to_string()),
    ]);
    data.extend(ep.additional_config_data.clone());
    Ok(ConfigMap {
        metadata: owned_meta(claim, labels)?,
        data: Some(data),
        ..ConfigMap::default()
    })
}

pub async fn create_secret(cluster: &dyn Cluster, policy: &RetryPolicy, secret: &Secret) -> Result<Secret> {
    info!(secret = %secret.name_any(), "creating secret");
    retry(policy, "creating secret", || cluster.create_secret(secret)).await
}

pub async fn create_config_map(cluster: &dyn Cluster, policy: &RetryPolicy, cm: &ConfigMap) -> Result<ConfigMap> {
    info!(configmap = %cm.name_any(), "creating configmap");
    retry(policy, "creating configmap", || cluster.create_config_map(cm)).await
}

/// Strip our finalizer and delete the secret
pub async fn release_secret(cluster: &dyn Cluster, policy: &RetryPolicy, secret: &Secret) -> Result<()> {
    let ns = secret.namespace().unwrap_or_default();
    let name = secret.name_any();
    if secret.finalizers().iter().any(|f| f == FINALIZER) {
        let stripped = update_with(
            policy,
            "releasing secret",
            secret,
            |s| {
                remove_finalizer(&mut s.metadata, FINALIZER);
            },
            || cluster.get_secret(&ns, &name),
            move |s| async move { cluster.update_secret(&s).await },
        )
        .await;
        match stripped {
            Err(e) if e.is_not_found() => return Ok(()),
            res => res.map(|_| ())?,
        }
    }
    retry(policy, "deleting secret", || cluster.delete_secret(&ns, &name)).await
}

/// Strip our finalizer and delete the config map
pub async fn release_config_map(cluster: &dyn Cluster, policy: &RetryPolicy, cm: &ConfigMap) -> Result<()> {
    let ns = cm.namespace().unwrap_or_default();
    let name = cm.name_any();
    if cm.finalizers().iter().any(|f| f == FINALIZER) {
        let stripped = update_with(
            policy,
            "releasing configmap",
            cm,
            |c| {
                remove_finalizer(&mut c.metadata, FINALIZER);
            },
            || cluster.get_config_map(&ns, &name),
            move |c| async move { cluster.update_config_map(&c).await },
        )
        .await;
        match stripped {
            Err(e) if e.is_not_found() => return Ok(()),
            res => res.map(|_| ())?,
        }
    }
    retry(policy, "deleting configmap", || cluster.delete_config_map(&ns, &name)).await
}

/// A crashed attempt may have left credentials behind that no longer match what
/// the backend hands out now, so they are always recreated.
pub async fn delete_existing_secret_and_config_map(
    cluster: &dyn Cluster,
    policy: &RetryPolicy,
    claim: &ObjectBucketClaim,
) -> Result<()> {
    let ns = claim.namespace().unwrap_or_default();
    let name = claim.name_any();
    if let Some(secret) = retry(policy, "getting secret", || cluster.get_secret(&ns, &name)).await? {
        info!(secret = %name, "deleting secret left by a previous attempt");
        release_secret(cluster, policy, &secret).await?;
    }
    if let Some(cm) = retry(policy, "getting configmap", || cluster.get_config_map(&ns, &name)).await? {
        info!(configmap = %name, "deleting configmap left by a previous attempt");
        release_config_map(cluster, policy, &cm).await?;
    }
    Ok(())
}

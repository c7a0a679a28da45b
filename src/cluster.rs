use async_trait::async_trait;
use k8s_openapi::api::{
    core::v1::{ConfigMap, Secret},
    storage::v1::StorageClass,
};
use kube::{
    Client,
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, ResourceExt},
};
use serde_json::json;

use crate::{Error, ObjectBucket, ObjectBucketClaim, Result};

/// Reads and writes of the objects the controller owns or consumes.
///
/// `get_*` map "not found" to `None`, `delete_*` treat it as success. Updates
/// carry the object's resource version, so writes against a stale copy fail
/// with a conflict.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ObjectBucketClaim>>;
    async fn update_claim(&self, claim: &ObjectBucketClaim) -> Result<ObjectBucketClaim>;
    async fn update_claim_status(&self, claim: &ObjectBucketClaim) -> Result<ObjectBucketClaim>;

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    async fn get_bucket(&self, name: &str) -> Result<Option<ObjectBucket>>;
    async fn create_bucket(&self, ob: &ObjectBucket) -> Result<ObjectBucket>;
    async fn update_bucket(&self, ob: &ObjectBucket) -> Result<ObjectBucket>;
    async fn update_bucket_status(&self, ob: &ObjectBucket) -> Result<ObjectBucket>;
    async fn delete_bucket(&self, name: &str) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;
    async fn update_secret(&self, secret: &Secret) -> Result<Secret>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap>;
    async fn update_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`Cluster`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    manager: String,
}

impl KubeCluster {
    pub fn new(client: Client, manager: &str) -> Self {
        Self {
            client,
            manager: manager.to_string(),
        }
    }

    fn claims(&self, ns: &str) -> Api<ObjectBucketClaim> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn buckets(&self) -> Api<ObjectBucket> {
        Api::all(self.client.clone())
    }

    fn secrets(&self, ns: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn config_maps(&self, ns: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.manager.clone()),
            ..PostParams::default()
        }
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or_else(|| Error::OtherError(format!("{} has no namespace", obj.name_any())))
}

/// Deleting something that is already gone is fine
fn ignore_not_found<T>(res: std::result::Result<T, kube::Error>) -> Result<()> {
    match res.map_err(Error::KubeError) {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ObjectBucketClaim>> {
        self.claims(namespace).get_opt(name).await.map_err(Error::KubeError)
    }

    async fn update_claim(&self, claim: &ObjectBucketClaim) -> Result<ObjectBucketClaim> {
        self.claims(&namespace_of(claim)?)
            .replace(&claim.name_any(), &self.post_params(), claim)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_claim_status(&self, claim: &ObjectBucketClaim) -> Result<ObjectBucketClaim> {
        // the resource version makes the merge patch a compare-and-set
        let patch = json!({
            "metadata": { "resourceVersion": claim.resource_version() },
            "status": claim.status,
        });
        self.claims(&namespace_of(claim)?)
            .patch_status(&claim.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Api::<StorageClass>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn get_bucket(&self, name: &str) -> Result<Option<ObjectBucket>> {
        self.buckets().get_opt(name).await.map_err(Error::KubeError)
    }

    async fn create_bucket(&self, ob: &ObjectBucket) -> Result<ObjectBucket> {
        self.buckets()
            .create(&self.post_params(), ob)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_bucket(&self, ob: &ObjectBucket) -> Result<ObjectBucket> {
        self.buckets()
            .replace(&ob.name_any(), &self.post_params(), ob)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_bucket_status(&self, ob: &ObjectBucket) -> Result<ObjectBucket> {
        let patch = json!({
            "metadata": { "resourceVersion": ob.resource_version() },
            "status": ob.status,
        });
        self.buckets()
            .patch_status(&ob.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        ignore_not_found(self.buckets().delete(name, &DeleteParams::default()).await)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.secrets(namespace).get_opt(name).await.map_err(Error::KubeError)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.secrets(&namespace_of(secret)?)
            .create(&self.post_params(), secret)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret> {
        self.secrets(&namespace_of(secret)?)
            .replace(&secret.name_any(), &self.post_params(), secret)
            .await
            .map_err(Error::KubeError)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(self.secrets(namespace).delete(name, &DeleteParams::default()).await)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.config_maps(namespace).get_opt(name).await.map_err(Error::KubeError)
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        self.config_maps(&namespace_of(cm)?)
            .create(&self.post_params(), cm)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        self.config_maps(&namespace_of(cm)?)
            .replace(&cm.name_any(), &self.post_params(), cm)
            .await
            .map_err(Error::KubeError)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(self.config_maps(namespace).delete(name, &DeleteParams::default()).await)
    }
}

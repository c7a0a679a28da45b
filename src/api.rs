use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use thiserror::Error;

use crate::{ObjectBucket, ObjectBucketClaim, ReclaimPolicy, STORAGE_CLASS_BUCKET};

/// Annotation recording how a bucket record came to be, read back at delete time
pub static PROVISIONING_MODE_ANNOTATION: &str = "objectbucket.io/provisioning-mode";

/// Everything the backend needs to provision or grant a bucket
#[derive(Clone, Debug)]
pub struct BucketOptions {
    pub reclaim_policy: Option<ReclaimPolicy>,
    pub bucket_name: String,
    /// Deep copy of the originating claim
    pub object_bucket_claim: ObjectBucketClaim,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("bucket {0:?} already exists")]
    BucketExists(String),

    #[error("{0}")]
    Failed(String),

    /// The backend got part of the way and hands back what needs cleaning up
    #[error("{source} (partially provisioned bucket {:?})", .bucket.metadata.name)]
    Partial {
        bucket: Box<ObjectBucket>,
        #[source]
        source: Box<BackendError>,
    },
}

impl BackendError {
    pub fn is_bucket_exists(&self) -> bool {
        match self {
            BackendError::BucketExists(_) => true,
            BackendError::Partial { source, .. } => source.is_bucket_exists(),
            BackendError::Failed(_) => false,
        }
    }

    pub fn partial_bucket(&self) -> Option<&ObjectBucket> {
        match self {
            BackendError::Partial { bucket, .. } => Some(bucket),
            _ => None,
        }
    }
}

/// The storage specific side of the controller.
///
/// `provision` must be idempotent for a given bucket name: after a crash the
/// controller calls it again with the name it already recorded on the claim.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a brand new bucket
    async fn provision(&self, options: &BucketOptions) -> Result<ObjectBucket, BackendError>;
    /// Hand out access to an existing bucket
    async fn grant(&self, options: &BucketOptions) -> Result<ObjectBucket, BackendError>;
    /// Destroy a dynamically provisioned bucket
    async fn delete(&self, ob: &ObjectBucket) -> Result<(), BackendError>;
    /// Withdraw access without destroying the bucket
    async fn revoke(&self, ob: &ObjectBucket) -> Result<(), BackendError>;
    /// Apply a configuration change to an existing bucket
    async fn update(&self, ob: &ObjectBucket) -> Result<(), BackendError>;
}

/// Dynamic ("greenfield") creates a new bucket, static ("brownfield") grants
/// access to the one named by the storage class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisioningMode {
    Dynamic,
    Static,
}

impl ProvisioningMode {
    pub fn for_class(class: &StorageClass) -> Self {
        match static_bucket_name(class) {
            Some(_) => ProvisioningMode::Static,
            None => ProvisioningMode::Dynamic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningMode::Dynamic => "dynamic",
            ProvisioningMode::Static => "static",
        }
    }

    pub fn from_annotation(ob: &ObjectBucket) -> Option<Self> {
        match ob.metadata.annotations.as_ref()?.get(PROVISIONING_MODE_ANNOTATION)?.as_str() {
            "dynamic" => Some(ProvisioningMode::Dynamic),
            "static" => Some(ProvisioningMode::Static),
            _ => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ProvisioningMode::Dynamic => "provisioning",
            ProvisioningMode::Static => "granting access to",
        }
    }

    pub async fn acquire(
        &self,
        provisioner: &dyn Provisioner,
        options: &BucketOptions,
    ) -> Result<ObjectBucket, BackendError> {
        match self {
            ProvisioningMode::Dynamic => provisioner.provision(options).await,
            ProvisioningMode::Static => provisioner.grant(options).await,
        }
    }

    /// Whether giving the bucket up destroys it. Static buckets are never destroyed,
    /// neither are dynamic ones with a `Retain` policy.
    pub fn destroys_on_release(&self, policy: ReclaimPolicy) -> bool {
        *self == ProvisioningMode::Dynamic && policy == ReclaimPolicy::Delete
    }

    /// Undo a provision or grant that could not be completed
    pub async fn abandon(
        &self,
        provisioner: &dyn Provisioner,
        ob: &ObjectBucket,
        cause: Option<&BackendError>,
    ) -> Result<(), BackendError> {
        let exists = cause.is_some_and(BackendError::is_bucket_exists);
        if *self == ProvisioningMode::Dynamic && !exists {
            provisioner.delete(ob).await
        } else {
            provisioner.revoke(ob).await
        }
    }
}

pub fn static_bucket_name(class: &StorageClass) -> Option<&str> {
    class
        .parameters
        .as_ref()
        .and_then(|p| p.get(STORAGE_CLASS_BUCKET))
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}

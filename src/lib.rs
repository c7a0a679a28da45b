use thiserror::Error;

use crate::api::BackendError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("IO Error: {0}")]
    IoError(std::io::Error),

    #[error("Backend Error: {0}")]
    BackendError(#[source] BackendError),

    /// The backend reported success but handed back an empty bucket record
    #[error("provisioner returned empty object bucket")]
    EmptyBucket,

    #[error("Invalid Key: {0}")]
    InvalidKey(String),

    #[error("Missing Storage Class: {0}")]
    MissingStorageClass(String),

    #[error("Missing Bucket Name: {0}")]
    MissingBucketName(String),

    #[error("Missing Object Bucket: {0}")]
    MissingObjectBucket(String),

    #[error("Timed out after {0:?}: {1}")]
    Timeout(std::time::Duration, String),

    /// NB: this is a catch-all for any other errors
    #[error("Other Error: {0}")]
    OtherError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409) && !self.is_already_exists()
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.reason == "AlreadyExists")
    }

    /// Errors worth absorbing with a local retry instead of escalating to the work queue
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                (resp.code == 409 && resp.reason != "AlreadyExists")
                    || resp.code == 429
                    || resp.code >= 500
            }
            Error::KubeError(kube::Error::HyperError(_)) | Error::KubeError(kube::Error::Service(_)) => true,
            _ => false,
        }
    }
}

pub mod api;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod labels;
pub mod naming;
pub mod queue;
pub mod resources;
pub mod retry;
pub mod server;
pub mod state;

/// Log and trace integrations
pub mod telemetry;

pub use crate::api::{BucketOptions, Provisioner, ProvisioningMode};
pub use crate::config::ControllerConfig;
pub use crate::controller::ProvisionController;
pub use crate::crd::*;

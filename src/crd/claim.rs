use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "objectbucket.io",
    version = "v1alpha1",
    kind = "ObjectBucketClaim",
    derive = "Default",
    derive = "PartialEq",
    namespaced,
    shortname = "obc",
    doc = "ObjectBucketClaim is a user request for an object storage bucket",
    printcolumn = r#"{"name":"Storage-Class","jsonPath":".spec.storageClassName","type":"string"}"#,
    printcolumn = r#"{"name":"Phase","jsonPath":".status.phase","type":"string"}"#,
    status = "ObjectBucketClaimStatus"
)]
pub struct ObjectBucketClaimSpec {
    #[serde(default)]
    pub storage_class_name: String,
    /// Explicit bucket name; takes precedence over `generateBucketName`
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub generate_bucket_name: String,
    /// Name of the bound ObjectBucket, written by the controller
    #[serde(default)]
    pub object_bucket_name: String,
    #[serde(default)]
    pub additional_config: BTreeMap<String, String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectBucketClaimStatus {
    pub phase: Option<ClaimPhase>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Released,
    Failed,
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClaimPhase::Pending => "Pending",
            ClaimPhase::Bound => "Bound",
            ClaimPhase::Released => "Released",
            ClaimPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

impl ObjectBucketClaim {
    pub fn phase(&self) -> Option<ClaimPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

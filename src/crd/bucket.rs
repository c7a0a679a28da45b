use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "objectbucket.io",
    version = "v1alpha1",
    kind = "ObjectBucket",
    derive = "Default",
    derive = "PartialEq",
    shortname = "ob",
    doc = "ObjectBucket is the cluster-scoped record of a provisioned or granted bucket",
    printcolumn = r#"{"name":"Storage-Class","jsonPath":".spec.storageClassName","type":"string"}"#,
    printcolumn = r#"{"name":"Claim-Namespace","jsonPath":".spec.claimRef.namespace","type":"string"}"#,
    printcolumn = r#"{"name":"Claim-Name","jsonPath":".spec.claimRef.name","type":"string"}"#,
    printcolumn = r#"{"name":"Reclaim-Policy","jsonPath":".spec.reclaimPolicy","type":"string"}"#,
    printcolumn = r#"{"name":"Phase","jsonPath":".status.phase","type":"string"}"#,
    status = "ObjectBucketStatus"
)]
pub struct ObjectBucketSpec {
    #[serde(default)]
    pub storage_class_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclaim_policy: Option<ReclaimPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ClaimReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub additional_state: BTreeMap<String, String>,
    /// Credentials returned by the backend. Never persisted: they only live
    /// between the backend call and the creation of the claim's Secret.
    #[serde(skip)]
    #[schemars(skip)]
    pub authentication: Option<Authentication>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ReclaimPolicy {
    Delete,
    Retain,
}

impl ReclaimPolicy {
    /// Parse a StorageClass `reclaimPolicy`; the API server defaults it to `Delete`
    pub fn from_class(value: Option<&str>) -> Option<ReclaimPolicy> {
        match value {
            None | Some("") | Some("Delete") => Some(ReclaimPolicy::Delete),
            Some("Retain") => Some(ReclaimPolicy::Retain),
            Some(_) => None,
        }
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReference {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub bucket_host: String,
    #[serde(default)]
    pub bucket_port: i32,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub sub_region: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub additional_config_data: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Authentication {
    pub access_keys: Option<AccessKeys>,
    pub additional_secret_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccessKeys {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectBucketStatus {
    pub phase: Option<BucketPhase>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BucketPhase {
    Bound,
    Released,
    Failed,
}

impl std::fmt::Display for BucketPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BucketPhase::Bound => "Bound",
            BucketPhase::Released => "Released",
            BucketPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

impl ObjectBucket {
    pub fn phase(&self) -> Option<BucketPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// True when the backend handed back a record with nothing filled in
    pub fn is_empty(&self) -> bool {
        self.metadata == ObjectMeta::default() && self.spec == ObjectBucketSpec::default() && self.status.is_none()
    }

    pub fn additional_config(&self) -> BTreeMap<String, String> {
        self.spec
            .endpoint
            .as_ref()
            .map(|e| e.additional_config_data.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_is_dropped_on_serialization() {
        let mut ob = ObjectBucket::new("obc-ns-b1", ObjectBucketSpec::default());
        ob.spec.authentication = Some(Authentication {
            access_keys: Some(AccessKeys {
                access_key_id: "id".into(),
                secret_access_key: "secret".into(),
            }),
            additional_secret_config: BTreeMap::new(),
        });
        let text = serde_json::to_string(&ob).unwrap();
        assert!(!text.contains("secret"));
        let back: ObjectBucket = serde_json::from_str(&text).unwrap();
        assert!(back.spec.authentication.is_none());
    }

    #[test]
    fn empty_bucket_detection() {
        assert!(ObjectBucket::default().is_empty());
        let ob = ObjectBucket::new("x", ObjectBucketSpec::default());
        assert!(!ob.is_empty());
    }

    #[test]
    fn reclaim_policy_defaults_to_delete() {
        assert_eq!(ReclaimPolicy::from_class(None), Some(ReclaimPolicy::Delete));
        assert_eq!(ReclaimPolicy::from_class(Some("Retain")), Some(ReclaimPolicy::Retain));
        assert_eq!(ReclaimPolicy::from_class(Some("Recycle")), None);
    }
}

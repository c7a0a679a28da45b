use std::collections::BTreeMap;

use kube::api::ObjectMeta;

pub static PROVISIONER_LABEL_KEY: &str = "bucket-provisioner";

/// Labels stamped on every claim, bucket record, secret and config map.
///
/// Built once at startup; `merge` returns a new value instead of mutating a shared map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionerLabels(BTreeMap<String, String>);

impl ProvisionerLabels {
    pub fn new(provisioner_name: &str) -> Self {
        Self(BTreeMap::from([(
            PROVISIONER_LABEL_KEY.to_string(),
            label_value(provisioner_name),
        )]))
    }

    /// Overlay caller supplied labels. The provisioner identity label cannot be overridden.
    pub fn merge(&self, extra: &BTreeMap<String, String>) -> Self {
        let mut labels = extra.clone();
        labels.extend(self.0.clone());
        Self(labels)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Add the labels to an object's metadata, keeping whatever it already carries
    pub fn apply(&self, meta: &mut ObjectMeta) {
        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .extend(self.0.clone());
    }
}

/// Label values may not contain '/', which provisioner names usually do
pub fn label_value(v: &str) -> String {
    v.replace('/', "-")
}

pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) {
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
}

/// Returns true when the finalizer was present
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    match meta.finalizers.as_mut() {
        Some(finalizers) => {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            before != finalizers.len()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioner_label_is_sanitized() {
        let labels = ProvisionerLabels::new("example.com/s3");
        assert_eq!(
            labels.as_map().get(PROVISIONER_LABEL_KEY).map(String::as_str),
            Some("example.com-s3")
        );
    }

    #[test]
    fn merge_keeps_identity_label() {
        let base = ProvisionerLabels::new("p");
        let merged = base.merge(&BTreeMap::from([
            ("team".to_string(), "storage".to_string()),
            (PROVISIONER_LABEL_KEY.to_string(), "hijack".to_string()),
        ]));
        assert_eq!(merged.as_map().get("team").map(String::as_str), Some("storage"));
        assert_eq!(merged.as_map().get(PROVISIONER_LABEL_KEY).map(String::as_str), Some("p"));
        // original untouched
        assert_eq!(base.as_map().len(), 1);
    }

    #[test]
    fn finalizers_are_idempotent() {
        let mut meta = ObjectMeta::default();
        add_finalizer(&mut meta, "a/b");
        add_finalizer(&mut meta, "a/b");
        assert_eq!(meta.finalizers.as_ref().unwrap().len(), 1);
        assert!(remove_finalizer(&mut meta, "a/b"));
        assert!(!remove_finalizer(&mut meta, "a/b"));
    }
}

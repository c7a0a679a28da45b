use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use provisioner::{
    ClaimPhase, ObjectBucketClaim, ObjectBucketClaimSpec, ObjectBucketClaimStatus,
    controller::informer::should_enqueue_update,
    naming::{claim_key, object_bucket_name},
    state::{SyncAction, SyncEvent, transition},
};
use std::collections::BTreeMap;

fn test_claim(rv: &str, phase: Option<ClaimPhase>) -> ObjectBucketClaim {
    let mut claim = ObjectBucketClaim::new(
        "b1",
        ObjectBucketClaimSpec {
            storage_class_name: "s3-buckets".into(),
            generate_bucket_name: "b1".into(),
            ..ObjectBucketClaimSpec::default()
        },
    );
    claim.metadata = ObjectMeta {
        name: Some("b1".into()),
        namespace: Some("ns".into()),
        resource_version: Some(rv.into()),
        ..ObjectMeta::default()
    };
    claim.status = Some(ObjectBucketClaimStatus { phase });
    claim
}

#[test]
fn new_claim_provisions_into_its_own_record() {
    let claim = test_claim("1", None);
    let key = claim_key(&claim).unwrap();
    assert_eq!(key, "ns/b1");
    assert_eq!(object_bucket_name(&key).unwrap(), "obc-ns-b1");

    let step = transition(claim.phase(), SyncEvent::classify(&claim));
    assert_eq!(step.action, SyncAction::Provision);
    assert_eq!(step.entry_phase, Some(ClaimPhase::Pending));
}

#[test]
fn bound_claim_config_edit_flows_to_update() {
    let mut old = test_claim("5", Some(ClaimPhase::Bound));
    old.spec.bucket_name = "b1-1234".into();
    old.spec.object_bucket_name = "obc-ns-b1".into();
    let mut new = old.clone();
    new.metadata.resource_version = Some("6".into());
    new.spec.additional_config = BTreeMap::from([("maxSize".to_string(), "2G".to_string())]);

    assert!(should_enqueue_update(&old, &new));
    assert_eq!(transition(new.phase(), SyncEvent::classify(&new)).action, SyncAction::Update);
}

#[test]
fn deletion_flows_to_delete_from_any_phase() {
    let old = test_claim("5", Some(ClaimPhase::Pending));
    let mut new = old.clone();
    new.metadata.resource_version = Some("6".into());
    new.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

    assert!(should_enqueue_update(&old, &new));
    let step = transition(new.phase(), SyncEvent::classify(&new));
    assert_eq!(step.action, SyncAction::Delete);
    assert_eq!(step.next_phase, ClaimPhase::Released);
}

//! The claim lifecycle as an explicit state machine.
//!
//! The sync handler classifies what it observes on a claim into a [`SyncEvent`],
//! then [`transition`] decides which handler runs and which phase the claim is
//! headed to. Nothing in here touches the cluster.

use crate::{ClaimPhase, ObjectBucketClaim};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// The claim carries a deletion timestamp
    DeletionRequested,
    /// The claim is bound and only its additional configuration may have moved
    BoundSpecChanged,
    /// Nothing has been bound yet, or a previous attempt stopped before the claim reached `Bound`
    ProvisionRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    Provision,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Phase written on the claim before the handler runs, if any
    pub entry_phase: Option<ClaimPhase>,
    pub action: SyncAction,
    /// Phase the claim holds once the handler succeeds
    pub next_phase: ClaimPhase,
}

impl SyncEvent {
    pub fn classify(claim: &ObjectBucketClaim) -> SyncEvent {
        if claim.is_deleting() {
            SyncEvent::DeletionRequested
        } else if !claim.spec.object_bucket_name.is_empty() && claim.phase() == Some(ClaimPhase::Bound) {
            SyncEvent::BoundSpecChanged
        } else {
            SyncEvent::ProvisionRequested
        }
    }
}

/// Total over every (phase, event) pair
pub fn transition(phase: Option<ClaimPhase>, event: SyncEvent) -> Transition {
    match (phase, event) {
        (_, SyncEvent::DeletionRequested) => Transition {
            entry_phase: None,
            action: SyncAction::Delete,
            next_phase: ClaimPhase::Released,
        },
        (Some(ClaimPhase::Bound), SyncEvent::BoundSpecChanged) => Transition {
            entry_phase: None,
            action: SyncAction::Update,
            next_phase: ClaimPhase::Bound,
        },
        // classification only yields BoundSpecChanged for bound claims; anything else
        // is treated as an interrupted provisioning and resumed
        (_, SyncEvent::BoundSpecChanged) | (_, SyncEvent::ProvisionRequested) => Transition {
            entry_phase: Some(ClaimPhase::Pending),
            action: SyncAction::Provision,
            next_phase: ClaimPhase::Bound,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectBucketClaimSpec, ObjectBucketClaimStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const PHASES: [Option<ClaimPhase>; 5] = [
        None,
        Some(ClaimPhase::Pending),
        Some(ClaimPhase::Bound),
        Some(ClaimPhase::Released),
        Some(ClaimPhase::Failed),
    ];

    fn claim(ob_name: &str, phase: Option<ClaimPhase>) -> ObjectBucketClaim {
        let mut c = ObjectBucketClaim::new(
            "b1",
            ObjectBucketClaimSpec {
                object_bucket_name: ob_name.into(),
                ..Default::default()
            },
        );
        c.status = Some(ObjectBucketClaimStatus { phase });
        c
    }

    #[test]
    fn deletion_wins_over_everything() {
        let mut c = claim("obc-ns-b1", Some(ClaimPhase::Bound));
        c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(SyncEvent::classify(&c), SyncEvent::DeletionRequested);
        for phase in PHASES {
            let t = transition(phase, SyncEvent::DeletionRequested);
            assert_eq!(t.action, SyncAction::Delete);
            assert_eq!(t.entry_phase, None);
        }
    }

    #[test]
    fn bound_claims_update() {
        let c = claim("obc-ns-b1", Some(ClaimPhase::Bound));
        let event = SyncEvent::classify(&c);
        assert_eq!(event, SyncEvent::BoundSpecChanged);
        let t = transition(c.phase(), event);
        assert_eq!(t.action, SyncAction::Update);
        assert_eq!(t.next_phase, ClaimPhase::Bound);
    }

    #[test]
    fn referenced_but_unbound_claims_resume_provisioning() {
        let c = claim("obc-ns-b1", Some(ClaimPhase::Pending));
        let event = SyncEvent::classify(&c);
        assert_eq!(event, SyncEvent::ProvisionRequested);
        assert_eq!(transition(c.phase(), event).action, SyncAction::Provision);
    }

    #[test]
    fn provisioning_always_enters_pending() {
        for phase in PHASES {
            let t = transition(phase, SyncEvent::ProvisionRequested);
            assert_eq!(t.entry_phase, Some(ClaimPhase::Pending));
            assert_eq!(t.action, SyncAction::Provision);
            assert_eq!(t.next_phase, ClaimPhase::Bound);
        }
    }
}

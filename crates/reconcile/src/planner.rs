//! Reconciliation planner - turns candidates into an ordered plan

use crate::config::{DriftMode, ReconcileMode};
use crate::diff::{Candidate, DriftReason};
use crate::types::{Fingerprint, ObservedResource, ResourceDefinition, ResourceKey};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of an action, used as the metrics key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Disable,
    Delete,
    #[serde(rename = "flag")]
    FlagDrift,
    Noop,
}

impl ActionKind {
    pub const ALL: [Self; 6] = [
        Self::Create,
        Self::Update,
        Self::Disable,
        Self::Delete,
        Self::FlagDrift,
        Self::Noop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Disable => "disable",
            Self::Delete => "delete",
            Self::FlagDrift => "flag",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an action needs no remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoopReason {
    /// Deployed exactly as declared
    Unchanged,
    /// Orphan already soft-deleted
    AlreadyDisabled,
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create {
        desired: ResourceDefinition,
    },
    Update {
        desired: ResourceDefinition,
        before: Fingerprint,
        reason: DriftReason,
    },
    Disable {
        observed: ObservedResource,
    },
    Delete {
        observed: ObservedResource,
    },
    /// Drift that is reported but left in place
    FlagDrift {
        key: ResourceKey,
        before: Fingerprint,
        after: Fingerprint,
        reason: DriftReason,
    },
    Noop {
        key: ResourceKey,
        fingerprint: Fingerprint,
        reason: NoopReason,
    },
}

/// Execution phases. Every action of a phase settles before the next
/// phase starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Space creates and updates
    SpaceWrites,
    /// Object creates and updates
    ObjectWrites,
    /// Actions without a remote call
    LocalOnly,
    /// Object disables and deletes
    ObjectRemovals,
    /// Space disables and deletes
    SpaceRemovals,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Create { .. } => ActionKind::Create,
            Self::Update { .. } => ActionKind::Update,
            Self::Disable { .. } => ActionKind::Disable,
            Self::Delete { .. } => ActionKind::Delete,
            Self::FlagDrift { .. } => ActionKind::FlagDrift,
            Self::Noop { .. } => ActionKind::Noop,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        match self {
            Self::Create { desired } | Self::Update { desired, .. } => &desired.key,
            Self::Disable { observed } | Self::Delete { observed } => &observed.key,
            Self::FlagDrift { key, .. } | Self::Noop { key, .. } => key,
        }
    }

    /// Human-readable cause, for logs.
    pub fn reason(&self) -> String {
        match self {
            Self::Create { .. } => "not deployed".to_string(),
            Self::Update { reason, .. } | Self::FlagDrift { reason, .. } => reason.to_string(),
            Self::Disable { .. } | Self::Delete { .. } => "no longer declared".to_string(),
            Self::Noop {
                reason: NoopReason::Unchanged,
                ..
            } => "unchanged".to_string(),
            Self::Noop {
                reason: NoopReason::AlreadyDisabled,
                ..
            } => "already disabled".to_string(),
        }
    }

    /// Fingerprint of the deployed copy, if there is one.
    pub fn before(&self) -> Option<&Fingerprint> {
        match self {
            Self::Create { .. } => None,
            Self::Update { before, .. } | Self::FlagDrift { before, .. } => Some(before),
            Self::Disable { observed } | Self::Delete { observed } => Some(&observed.fingerprint),
            Self::Noop { fingerprint, .. } => Some(fingerprint),
        }
    }

    /// Fingerprint the resource will have afterwards, if it stays deployed.
    pub fn after(&self) -> Option<&Fingerprint> {
        match self {
            Self::Create { desired } | Self::Update { desired, .. } => Some(&desired.fingerprint),
            Self::FlagDrift { after, .. } => Some(after),
            Self::Disable { observed } => Some(&observed.fingerprint),
            Self::Delete { .. } => None,
            Self::Noop { fingerprint, .. } => Some(fingerprint),
        }
    }

    /// Whether executing the action requires a remote call.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::FlagDrift { .. } | Self::Noop { .. })
    }

    pub fn phase(&self) -> Phase {
        let space = self.key().is_space();
        match self.kind() {
            ActionKind::Create | ActionKind::Update if space => Phase::SpaceWrites,
            ActionKind::Create | ActionKind::Update => Phase::ObjectWrites,
            ActionKind::FlagDrift | ActionKind::Noop => Phase::LocalOnly,
            ActionKind::Disable | ActionKind::Delete if space => Phase::SpaceRemovals,
            ActionKind::Disable | ActionKind::Delete => Phase::ObjectRemovals,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind(), self.key(), self.reason())?;
        match (self.before(), self.after()) {
            (Some(before), Some(after)) if before != after => write!(f, " {before} -> {after}"),
            (None, Some(after)) => write!(f, " -> {after}"),
            _ => Ok(()),
        }
    }
}

/// Policy applied to candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Policy {
    pub reconcile_mode: ReconcileMode,
    pub drift_mode: DriftMode,
    pub dry_run: bool,
}

/// An action together with its dry-run gate.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub action: Action,
    /// Record the outcome without making the remote call
    pub simulate: bool,
}

/// Ordered actions for one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub environment: String,
    pub dry_run: bool,
    /// Sorted by phase, then key
    pub actions: Vec<PlannedAction>,
}

impl Plan {
    /// Consecutive runs of actions sharing a phase, in execution order.
    pub fn phases(&self) -> impl Iterator<Item = (Phase, &[PlannedAction])> {
        self.actions
            .chunk_by(|a, b| a.action.phase() == b.action.phase())
            .filter_map(|chunk| chunk.first().map(|first| (first.action.phase(), chunk)))
    }

    /// Number of actions per kind.
    pub fn counts(&self) -> BTreeMap<ActionKind, usize> {
        let mut counts = BTreeMap::new();
        for planned in &self.actions {
            *counts.entry(planned.action.kind()).or_insert(0) += 1;
        }
        counts
    }

    /// Whether nothing needs to change.
    pub fn is_converged(&self) -> bool {
        self.actions
            .iter()
            .all(|p| p.action.kind() == ActionKind::Noop)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Apply `policy` to `candidates` and order the result.
pub fn plan(environment: &str, candidates: Vec<Candidate>, policy: &Policy) -> Plan {
    let mut actions: Vec<PlannedAction> = candidates
        .into_iter()
        .map(|candidate| {
            let action = decide(candidate, policy);
            PlannedAction {
                simulate: policy.dry_run && action.is_mutating(),
                action,
            }
        })
        .collect();

    actions.sort_by(|a, b| compare(&a.action, &b.action));

    Plan {
        environment: environment.to_string(),
        dry_run: policy.dry_run,
        actions,
    }
}

fn compare(a: &Action, b: &Action) -> Ordering {
    a.phase().cmp(&b.phase()).then_with(|| a.key().cmp(b.key()))
}

fn decide(candidate: Candidate, policy: &Policy) -> Action {
    match candidate {
        Candidate::Create { desired } => Action::Create { desired },
        Candidate::Noop { desired, .. } => Action::Noop {
            key: desired.key,
            fingerprint: desired.fingerprint,
            reason: NoopReason::Unchanged,
        },
        Candidate::Drift {
            desired,
            observed,
            reason,
        } => match policy.drift_mode {
            DriftMode::Overwrite => Action::Update {
                desired,
                before: observed.fingerprint,
                reason,
            },
            DriftMode::Flag => Action::FlagDrift {
                key: desired.key,
                before: observed.fingerprint,
                after: desired.fingerprint,
                reason,
            },
        },
        Candidate::Orphan { observed } => match policy.reconcile_mode {
            ReconcileMode::Delete => Action::Delete { observed },
            ReconcileMode::Disable if observed.disabled => Action::Noop {
                key: observed.key,
                fingerprint: observed.fingerprint,
                reason: NoopReason::AlreadyDisabled,
            },
            ReconcileMode::Disable => Action::Disable { observed },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ManagementTags, Payload};
    use kibanakit::SavedObject;
    use serde_json::json;

    fn tags() -> ManagementTags {
        ManagementTags {
            marker: "managed".to_string(),
            disabled: "disabled".to_string(),
        }
    }

    fn desired(resource_type: &str, id: &str, version: u32) -> ResourceDefinition {
        ResourceDefinition::new(
            ResourceKey::new(resource_type, id, "default"),
            Payload::new(json!({ "version": version })),
            &tags(),
        )
    }

    fn observed(resource_type: &str, id: &str, version: u32, disabled: bool) -> ObservedResource {
        let mut object = SavedObject::new("default", resource_type, id, json!({ "version": version }))
            .with_tag("managed");
        if disabled {
            object = object.with_tag("disabled");
        }
        ObservedResource::from_saved_object(object, &tags())
    }

    fn policy(reconcile_mode: ReconcileMode, drift_mode: DriftMode) -> Policy {
        Policy {
            reconcile_mode,
            drift_mode,
            dry_run: false,
        }
    }

    fn kinds(plan: &Plan) -> Vec<ActionKind> {
        plan.actions.iter().map(|p| p.action.kind()).collect()
    }

    #[test]
    fn test_orphan_mode_exhaustive() {
        for mode in [ReconcileMode::Delete, ReconcileMode::Disable] {
            let candidates = vec![Candidate::Orphan {
                observed: observed("dashboard", "B", 1, false),
            }];
            let plan = plan("test", candidates, &policy(mode, DriftMode::Overwrite));
            let expected = match mode {
                ReconcileMode::Delete => ActionKind::Delete,
                ReconcileMode::Disable => ActionKind::Disable,
            };
            assert_eq!(kinds(&plan), vec![expected]);
        }
    }

    #[test]
    fn test_already_disabled_orphan() {
        let orphan = || {
            vec![Candidate::Orphan {
                observed: observed("dashboard", "B", 1, true),
            }]
        };
        let disable = plan(
            "test",
            orphan(),
            &policy(ReconcileMode::Disable, DriftMode::Overwrite),
        );
        assert_eq!(kinds(&disable), vec![ActionKind::Noop]);
        assert!(disable.is_converged());

        let delete = plan(
            "test",
            orphan(),
            &policy(ReconcileMode::Delete, DriftMode::Overwrite),
        );
        assert_eq!(kinds(&delete), vec![ActionKind::Delete]);
    }

    #[test]
    fn test_drift_modes() {
        let drift = || {
            vec![Candidate::Drift {
                desired: desired("dashboard", "A", 1),
                observed: observed("dashboard", "A", 2, false),
                reason: DriftReason::Content,
            }]
        };
        let overwrite = plan(
            "test",
            drift(),
            &policy(ReconcileMode::Delete, DriftMode::Overwrite),
        );
        assert_eq!(kinds(&overwrite), vec![ActionKind::Update]);

        let flag = plan(
            "test",
            drift(),
            &policy(ReconcileMode::Delete, DriftMode::Flag),
        );
        assert_eq!(kinds(&flag), vec![ActionKind::FlagDrift]);
        assert!(!flag.actions[0].action.is_mutating());
        assert_ne!(flag.actions[0].action.before(), flag.actions[0].action.after());
    }

    #[test]
    fn test_ordering_writes_before_removals() {
        let candidates = vec![
            Candidate::Orphan {
                observed: observed("space", "old", 1, false),
            },
            Candidate::Orphan {
                observed: observed("dashboard", "Z", 1, false),
            },
            Candidate::Noop {
                desired: desired("dashboard", "N", 1),
                observed: observed("dashboard", "N", 1, false),
            },
            Candidate::Create {
                desired: desired("dashboard", "B", 1),
            },
            Candidate::Create {
                desired: desired("dashboard", "A", 1),
            },
            Candidate::Create {
                desired: desired("space", "ops", 1),
            },
        ];
        let plan = plan(
            "test",
            candidates,
            &policy(ReconcileMode::Delete, DriftMode::Overwrite),
        );

        let order: Vec<String> = plan.actions.iter().map(|p| p.action.key().to_string()).collect();
        assert_eq!(
            order,
            vec![
                "space/ops",
                "dashboard/A@default",
                "dashboard/B@default",
                "dashboard/N@default",
                "dashboard/Z@default",
                "space/old",
            ]
        );

        let phases: Vec<Phase> = plan.phases().map(|(phase, _)| phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::SpaceWrites,
                Phase::ObjectWrites,
                Phase::LocalOnly,
                Phase::ObjectRemovals,
                Phase::SpaceRemovals,
            ]
        );
    }

    #[test]
    fn test_dry_run_keeps_every_action() {
        let candidates = vec![
            Candidate::Create {
                desired: desired("dashboard", "A", 1),
            },
            Candidate::Noop {
                desired: desired("dashboard", "N", 1),
                observed: observed("dashboard", "N", 1, false),
            },
        ];
        let plan = plan(
            "test",
            candidates,
            &Policy {
                dry_run: true,
                ..Policy::default()
            },
        );
        assert!(plan.dry_run);
        assert_eq!(plan.len(), 2);
        assert!(plan.actions[0].simulate);
        assert!(!plan.actions[1].simulate);
        assert_eq!(plan.counts()[&ActionKind::Create], 1);
    }

    #[test]
    fn test_action_display() {
        let action = Action::Create {
            desired: desired("dashboard", "A", 1),
        };
        let text = action.to_string();
        assert!(text.starts_with("create dashboard/A@default (not deployed) -> "));
    }
}

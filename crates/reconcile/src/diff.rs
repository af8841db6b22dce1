//! Diff computation - pairs desired and observed resources by key

use crate::error::{Error, Result};
use crate::types::{ObservedResource, ResourceDefinition, ResourceKey};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Why a desired resource no longer matches what is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftReason {
    /// Fingerprints differ
    Content,
    /// The deployed copy carries the disabled tag
    Disabled,
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content => f.write_str("content changed"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

/// Classification of one resource before policy is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    /// Declared but not deployed
    Create { desired: ResourceDefinition },
    /// Deployed exactly as declared
    Noop {
        desired: ResourceDefinition,
        observed: ObservedResource,
    },
    /// Deployed, but not as declared
    Drift {
        desired: ResourceDefinition,
        observed: ObservedResource,
        reason: DriftReason,
    },
    /// Managed and deployed, but no longer declared
    Orphan { observed: ObservedResource },
}

impl Candidate {
    pub fn key(&self) -> &ResourceKey {
        match self {
            Self::Create { desired } | Self::Noop { desired, .. } | Self::Drift { desired, .. } => {
                &desired.key
            }
            Self::Orphan { observed } => &observed.key,
        }
    }
}

/// Compare a desired inventory with an observed one.
///
/// Observed resources without the management marker are ignored: they never
/// match a desired resource and never become orphans.
///
/// # Errors
///
/// Returns [`Error::DuplicateKey`] if the desired set declares a key twice.
pub fn compute(desired: &[ResourceDefinition], observed: &[ObservedResource]) -> Result<Vec<Candidate>> {
    let mut seen = HashSet::with_capacity(desired.len());
    for definition in desired {
        if !seen.insert(&definition.key) {
            return Err(Error::DuplicateKey {
                key: definition.key.clone(),
            });
        }
    }

    let mut managed: BTreeMap<&ResourceKey, &ObservedResource> = observed
        .iter()
        .filter(|o| o.managed)
        .map(|o| (&o.key, o))
        .collect();

    let mut candidates = Vec::with_capacity(desired.len() + managed.len());
    for definition in desired {
        let candidate = match managed.remove(&definition.key) {
            None => Candidate::Create {
                desired: definition.clone(),
            },
            Some(current) if current.disabled => Candidate::Drift {
                desired: definition.clone(),
                observed: current.clone(),
                reason: DriftReason::Disabled,
            },
            Some(current) if current.fingerprint != definition.fingerprint => Candidate::Drift {
                desired: definition.clone(),
                observed: current.clone(),
                reason: DriftReason::Content,
            },
            Some(current) => Candidate::Noop {
                desired: definition.clone(),
                observed: current.clone(),
            },
        };
        candidates.push(candidate);
    }

    // whatever is left is managed but undeclared
    candidates.extend(managed.into_values().map(|o| Candidate::Orphan {
        observed: o.clone(),
    }));

    Ok(candidates)
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Resources to create
    pub creates: usize,
    /// Resources that drifted
    pub drifts: usize,
    /// Managed resources no longer declared
    pub orphans: usize,
    /// Resources already converged
    pub unchanged: usize,
}

impl DiffSummary {
    /// Create a summary from a list of candidates
    pub fn from_candidates(candidates: &[Candidate]) -> Self {
        let mut summary = Self::default();
        for candidate in candidates {
            match candidate {
                Candidate::Create { .. } => summary.creates += 1,
                Candidate::Drift { .. } => summary.drifts += 1,
                Candidate::Orphan { .. } => summary.orphans += 1,
                Candidate::Noop { .. } => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Number of resources that are not converged
    pub fn changes(&self) -> usize {
        self.creates + self.drifts + self.orphans
    }

    pub fn has_changes(&self) -> bool {
        self.changes() > 0
    }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} drifted, {} orphaned, {} unchanged",
            self.creates, self.drifts, self.orphans, self.unchanged
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ManagementTags, Payload};
    use kibanakit::SavedObject;
    use serde_json::{Value, json};

    fn tags() -> ManagementTags {
        ManagementTags {
            marker: "managed".to_string(),
            disabled: "disabled".to_string(),
        }
    }

    fn desired(id: &str, attributes: Value) -> ResourceDefinition {
        ResourceDefinition::new(
            ResourceKey::new("dashboard", id, "default"),
            Payload::new(attributes),
            &tags(),
        )
    }

    fn observed(id: &str, attributes: Value, extra_tags: &[&str]) -> ObservedResource {
        let mut object = SavedObject::new("default", "dashboard", id, attributes);
        for tag in extra_tags {
            object = object.with_tag(tag);
        }
        ObservedResource::from_saved_object(object, &tags())
    }

    #[test]
    fn test_absent_is_create() {
        let candidates = compute(&[desired("A", json!({"v": 1}))], &[]).unwrap();
        assert!(matches!(candidates.as_slice(), [Candidate::Create { .. }]));
    }

    #[test]
    fn test_equal_fingerprint_is_noop() {
        let candidates = compute(
            &[desired("A", json!({"v": 1}))],
            &[observed("A", json!({"v": 1}), &["managed"])],
        )
        .unwrap();
        assert!(matches!(candidates.as_slice(), [Candidate::Noop { .. }]));
    }

    #[test]
    fn test_different_fingerprint_is_drift() {
        let candidates = compute(
            &[desired("A", json!({"v": 1}))],
            &[observed("A", json!({"v": 2}), &["managed"])],
        )
        .unwrap();
        assert!(matches!(
            candidates.as_slice(),
            [Candidate::Drift {
                reason: DriftReason::Content,
                ..
            }]
        ));
    }

    #[test]
    fn test_disabled_copy_is_drift() {
        let candidates = compute(
            &[desired("A", json!({"v": 1}))],
            &[observed("A", json!({"v": 1}), &["managed", "disabled"])],
        )
        .unwrap();
        assert!(matches!(
            candidates.as_slice(),
            [Candidate::Drift {
                reason: DriftReason::Disabled,
                ..
            }]
        ));
    }

    #[test]
    fn test_managed_undeclared_is_orphan() {
        let candidates = compute(&[], &[observed("B", json!({}), &["managed"])]).unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(matches!(&candidates[0], Candidate::Orphan { observed } if observed.key.id == "B"));
    }

    #[test]
    fn test_unmanaged_never_produce_candidates() {
        let candidates = compute(&[], &[observed("user", json!({}), &[])]).unwrap();
        assert!(candidates.is_empty());

        // an unmanaged object with a declared key does not count as deployed
        let candidates =
            compute(&[desired("A", json!({}))], &[observed("A", json!({}), &[])]).unwrap();
        assert!(matches!(candidates.as_slice(), [Candidate::Create { .. }]));
    }

    #[test]
    fn test_duplicate_desired_key_fails() {
        let err = compute(
            &[desired("A", json!({"v": 1})), desired("A", json!({"v": 2}))],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { key } if key.id == "A"));
    }

    #[test]
    fn test_summary() {
        let candidates = compute(
            &[desired("A", json!({})), desired("B", json!({"v": 1}))],
            &[
                observed("B", json!({"v": 2}), &["managed"]),
                observed("C", json!({}), &["managed"]),
            ],
        )
        .unwrap();
        let summary = DiffSummary::from_candidates(&candidates);
        assert_eq!(
            summary,
            DiffSummary {
                creates: 1,
                drifts: 1,
                orphans: 1,
                unchanged: 0
            }
        );
        assert_eq!(summary.changes(), 3);
        assert!(summary.has_changes());
    }
}

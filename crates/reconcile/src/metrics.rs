//! Outcome tallies for one environment and for a whole run

use crate::planner::ActionKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// How an action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Performed (or needed no remote call)
    Applied,
    /// Dry run: counted as a success, no remote call
    Simulated,
    /// Remote call failed after retries
    Failed,
    /// Not dispatched because the run was cancelled
    Skipped,
}

/// Result of one action, as fed to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub kind: ActionKind,
    pub status: OutcomeStatus,
}

impl Outcome {
    pub fn new(kind: ActionKind, status: OutcomeStatus) -> Self {
        Self { kind, status }
    }
}

/// Counters for one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentMetrics {
    /// Successful (or simulated) actions per kind
    pub actions: BTreeMap<ActionKind, u64>,
    /// Failed actions
    pub errors: u64,
    /// Actions abandoned on cancellation
    pub skipped: u64,
    /// Successes that were only simulated
    pub simulated: u64,
}

impl EnvironmentMetrics {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome.status {
            OutcomeStatus::Applied => *self.actions.entry(outcome.kind).or_insert(0) += 1,
            OutcomeStatus::Simulated => {
                *self.actions.entry(outcome.kind).or_insert(0) += 1;
                self.simulated += 1;
            }
            OutcomeStatus::Failed => self.errors += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
        }
    }

    /// Successful count for one kind.
    pub fn count(&self, kind: ActionKind) -> u64 {
        self.actions.get(&kind).copied().unwrap_or(0)
    }

    /// Successful actions of every kind.
    pub fn succeeded(&self) -> u64 {
        self.actions.values().sum()
    }
}

/// Fold a batch of outcomes into counters.
pub fn aggregate<'a>(outcomes: impl IntoIterator<Item = &'a Outcome>) -> EnvironmentMetrics {
    let mut metrics = EnvironmentMetrics::default();
    for outcome in outcomes {
        metrics.record(*outcome);
    }
    metrics
}

/// Thread-safe accumulation of outcomes from concurrent workers.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    inner: Mutex<EnvironmentMetrics>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(outcome);
    }

    pub fn snapshot(&self) -> EnvironmentMetrics {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn into_inner(self) -> EnvironmentMetrics {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Summary of a whole run, handed to the caller once `run` returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunMetrics {
    /// Successful (or simulated) actions per kind, all environments
    pub actions: BTreeMap<ActionKind, u64>,
    /// Per-environment breakdown
    pub environments: BTreeMap<String, EnvironmentMetrics>,
    /// Failed actions, all environments
    pub errors: u64,
    /// Actions abandoned on cancellation, all environments
    pub skipped: u64,
    /// Environments that did not converge
    pub failed_environments: Vec<String>,
    pub dry_run: bool,
    pub duration: Duration,
}

impl RunMetrics {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Fold one environment's counters into the run totals.
    pub fn add_environment(&mut self, environment: &str, metrics: EnvironmentMetrics) {
        for (kind, count) in &metrics.actions {
            *self.actions.entry(*kind).or_insert(0) += count;
        }
        self.errors += metrics.errors;
        self.skipped += metrics.skipped;

        let entry = self.environments.entry(environment.to_string()).or_default();
        for (kind, count) in metrics.actions {
            *entry.actions.entry(kind).or_insert(0) += count;
        }
        entry.errors += metrics.errors;
        entry.skipped += metrics.skipped;
        entry.simulated += metrics.simulated;
    }

    pub fn fail_environment(&mut self, environment: &str) {
        self.environments.entry(environment.to_string()).or_default();
        if !self.failed_environments.iter().any(|e| e == environment) {
            self.failed_environments.push(environment.to_string());
        }
    }

    /// Successful count for one kind across all environments.
    pub fn count(&self, kind: ActionKind) -> u64 {
        self.actions.get(&kind).copied().unwrap_or(0)
    }

    /// Non-zero counters as `kind -> count`.
    pub fn counts(&self) -> BTreeMap<&'static str, u64> {
        self.actions
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(kind, count)| (kind.as_str(), *count))
            .collect()
    }

    pub fn succeeded(&self) -> u64 {
        self.actions.values().sum()
    }
}

impl fmt::Display for RunMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for kind in ActionKind::ALL {
            write!(f, "{}={} ", kind, self.count(kind))?;
        }
        write!(
            f,
            "errors={} skipped={} environments={} failed={} dry_run={} duration={:.3}s",
            self.errors,
            self.skipped,
            self.environments.len(),
            self.failed_environments.len(),
            self.dry_run,
            self.duration.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_aggregate_counts_by_kind() {
        let outcomes = [
            Outcome::new(ActionKind::Create, OutcomeStatus::Applied),
            Outcome::new(ActionKind::Create, OutcomeStatus::Applied),
            Outcome::new(ActionKind::Delete, OutcomeStatus::Failed),
            Outcome::new(ActionKind::Update, OutcomeStatus::Skipped),
        ];
        let metrics = aggregate(&outcomes);
        assert_eq!(metrics.count(ActionKind::Create), 2);
        assert_eq!(metrics.count(ActionKind::Delete), 0);
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.skipped, 1);
        assert_eq!(metrics.succeeded(), 2);
    }

    #[test]
    fn test_simulated_counts_as_success() {
        let real = aggregate(&[Outcome::new(ActionKind::Create, OutcomeStatus::Applied)]);
        let simulated = aggregate(&[Outcome::new(ActionKind::Create, OutcomeStatus::Simulated)]);
        assert_eq!(real.actions, simulated.actions);
        assert_eq!(simulated.simulated, 1);
    }

    #[test]
    fn test_concurrent_recording() {
        let aggregator = Arc::new(MetricsAggregator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let aggregator = Arc::clone(&aggregator);
                thread::spawn(move || {
                    for _ in 0..100 {
                        aggregator.record(Outcome::new(ActionKind::Update, OutcomeStatus::Applied));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(aggregator.snapshot().count(ActionKind::Update), 800);
    }

    #[test]
    fn test_run_metrics_merges_environments() {
        let mut run = RunMetrics::new(false);
        run.add_environment(
            "staging",
            aggregate(&[Outcome::new(ActionKind::Create, OutcomeStatus::Applied)]),
        );
        run.add_environment(
            "prod",
            aggregate(&[
                Outcome::new(ActionKind::Create, OutcomeStatus::Applied),
                Outcome::new(ActionKind::Delete, OutcomeStatus::Failed),
            ]),
        );
        run.fail_environment("prod");
        run.fail_environment("prod");

        assert_eq!(run.count(ActionKind::Create), 2);
        assert_eq!(run.errors, 1);
        assert_eq!(run.failed_environments, vec!["prod"]);
        assert_eq!(run.environments["prod"].errors, 1);
        assert_eq!(run.counts(), BTreeMap::from([("create", 2)]));
    }

    #[test]
    fn test_serialize_uses_kind_names() {
        let mut run = RunMetrics::new(true);
        run.add_environment(
            "default",
            aggregate(&[Outcome::new(ActionKind::FlagDrift, OutcomeStatus::Applied)]),
        );
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["actions"]["flag"], 1);
        assert_eq!(json["dry_run"], true);
    }

    #[test]
    fn test_display() {
        let run = RunMetrics::new(false);
        let text = run.to_string();
        assert!(text.starts_with("create=0 update=0 disable=0 delete=0 flag=0 noop=0 "));
        assert!(text.contains("errors=0"));
    }
}

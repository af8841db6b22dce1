//! Execution engine - runs a plan phase by phase on a bounded worker pool

use crate::connector::TargetConnector;
use crate::error::{Error, Result};
use crate::metrics::{EnvironmentMetrics, MetricsAggregator, Outcome, OutcomeStatus};
use crate::planner::{Action, Plan, PlannedAction};
use kibanakit::CancelToken;
use rayon::prelude::*;

/// Applies plans for one environment.
pub struct Executor<'a> {
    connector: &'a TargetConnector,
    concurrency: usize,
}

impl<'a> Executor<'a> {
    /// `concurrency` bounds the number of actions in flight at once.
    pub fn new(connector: &'a TargetConnector, concurrency: usize) -> Self {
        Self {
            connector,
            concurrency: concurrency.max(1),
        }
    }

    /// Execute `plan`, returning the counters of everything that settled.
    ///
    /// Phases run in order and each one completes before the next starts.
    /// Within a phase actions are dispatched concurrently. A failed action
    /// is counted and the rest of the plan still runs. Once `cancel` fires
    /// no further action is dispatched; actions already in flight finish.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if any action was abandoned,
    /// [`Error::ActionsFailed`] if any action failed.
    pub fn execute(&self, plan: &Plan, cancel: &CancelToken) -> (EnvironmentMetrics, Result<()>) {
        let environment = self.connector.environment();
        if plan.is_empty() {
            return (EnvironmentMetrics::default(), Ok(()));
        }

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .thread_name({
                let environment = environment.to_string();
                move |i| format!("{environment}-worker-{i}")
            })
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                return (
                    EnvironmentMetrics::default(),
                    Err(Error::Executor {
                        environment: environment.to_string(),
                        message: e.to_string(),
                    }),
                );
            }
        };

        let aggregator = MetricsAggregator::new();
        for (phase, actions) in plan.phases() {
            if cancel.is_cancelled() {
                for planned in actions {
                    aggregator.record(Outcome::new(planned.action.kind(), OutcomeStatus::Skipped));
                }
                continue;
            }

            log::debug!("{environment}: {phase:?} ({} actions)", actions.len());
            pool.install(|| {
                actions.par_iter().with_max_len(1).for_each(|planned| {
                    aggregator.record(self.run_action(planned, cancel));
                });
            });
            let settled = aggregator.snapshot();
            log::debug!(
                "{environment}: {phase:?} done ({} succeeded, {} failed so far)",
                settled.succeeded(),
                settled.errors
            );
        }

        let metrics = aggregator.into_inner();
        let result = if metrics.skipped > 0 {
            Err(Error::Cancelled)
        } else if metrics.errors > 0 {
            Err(Error::ActionsFailed {
                environment: environment.to_string(),
                failed: metrics.errors,
            })
        } else {
            Ok(())
        };
        (metrics, result)
    }

    fn run_action(&self, planned: &PlannedAction, cancel: &CancelToken) -> Outcome {
        let environment = self.connector.environment();
        let action = &planned.action;
        let kind = action.kind();

        if cancel.is_cancelled() {
            return Outcome::new(kind, OutcomeStatus::Skipped);
        }

        if !action.is_mutating() {
            if let Action::FlagDrift { .. } = action {
                log::warn!("{environment}: drift left in place: {action}");
            }
            return Outcome::new(kind, OutcomeStatus::Applied);
        }

        if planned.simulate {
            log::info!("{environment}: [dry-run] {action}");
            return Outcome::new(kind, OutcomeStatus::Simulated);
        }

        match self.connector.execute(action, cancel) {
            Ok(()) => {
                log::info!("{environment}: {action}");
                Outcome::new(kind, OutcomeStatus::Applied)
            }
            Err(kibanakit::Error::Cancelled) => Outcome::new(kind, OutcomeStatus::Skipped),
            Err(e) => {
                log::error!(
                    "{environment}: {kind} {} failed ({}): {e}",
                    action.key(),
                    e.category().description()
                );
                Outcome::new(kind, OutcomeStatus::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriftMode, ReconcileMode};
    use crate::diff::Candidate;
    use crate::planner::{ActionKind, Policy, plan};
    use crate::types::{ManagementTags, ObservedResource, Payload, ResourceDefinition, ResourceKey};
    use kibanakit::{MockBackend, RetryPolicy, SavedObject, Sleeper};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _: Duration, cancel: &CancelToken) -> bool {
            !cancel.is_cancelled()
        }
    }

    fn tags() -> ManagementTags {
        ManagementTags {
            marker: "managed".to_string(),
            disabled: "disabled".to_string(),
        }
    }

    fn connector(backend: Arc<dyn kibanakit::Backend>) -> TargetConnector {
        TargetConnector::new(
            "test",
            backend,
            RetryPolicy {
                jitter: 0.0,
                ..RetryPolicy::new(2, Duration::from_millis(1), 2.0)
            },
            Arc::new(NoSleep),
            tags(),
        )
    }

    fn create(id: &str) -> Candidate {
        Candidate::Create {
            desired: ResourceDefinition::new(
                ResourceKey::new("dashboard", id, "default"),
                Payload::new(json!({"title": id})),
                &tags(),
            ),
        }
    }

    fn orphan(id: &str) -> Candidate {
        let object = SavedObject::new("default", "dashboard", id, json!({})).with_tag("managed");
        Candidate::Orphan {
            observed: ObservedResource::from_saved_object(object, &tags()),
        }
    }

    fn policy(dry_run: bool) -> Policy {
        Policy {
            reconcile_mode: ReconcileMode::Delete,
            drift_mode: DriftMode::Overwrite,
            dry_run,
        }
    }

    #[test]
    fn test_execute_empty_plan() {
        let mock = MockBackend::new();
        let connector = connector(Arc::new(mock));
        let plan = plan("test", Vec::new(), &policy(false));
        let (metrics, result) = Executor::new(&connector, 2).execute(&plan, &CancelToken::new());
        assert!(result.is_ok());
        assert_eq!(metrics, EnvironmentMetrics::default());
    }

    #[test]
    fn test_partial_failure_isolated() {
        let mock = MockBackend::new();
        let server_error = || kibanakit::Error::Server {
            status: 502,
            url: "mock".to_string(),
            body: String::new(),
        };
        // transient, then permanent
        mock.fail_next(
            "C",
            [
                server_error(),
                kibanakit::Error::Client {
                    status: 400,
                    url: "mock".to_string(),
                    body: String::new(),
                },
            ],
        );
        let connector = connector(Arc::new(mock.clone()));
        let candidates = ["A", "B", "C", "D", "E"].map(create).to_vec();
        let plan = plan("test", candidates, &policy(false));

        let (metrics, result) = Executor::new(&connector, 3).execute(&plan, &CancelToken::new());
        assert_eq!(metrics.count(ActionKind::Create), 4);
        assert_eq!(metrics.errors, 1);
        assert!(matches!(result, Err(Error::ActionsFailed { failed: 1, .. })));
        assert_eq!(mock.objects().len(), 4);
    }

    #[test]
    fn test_dry_run_makes_no_mutating_calls() {
        let mock = MockBackend::new();
        mock.insert(SavedObject::new("default", "dashboard", "old", json!({})).with_tag("managed"));
        let connector = connector(Arc::new(mock.clone()));
        let plan = plan("test", vec![create("A"), orphan("old")], &policy(true));

        let (metrics, result) = Executor::new(&connector, 2).execute(&plan, &CancelToken::new());
        result.unwrap();
        assert!(mock.mutating_calls().is_empty());
        assert_eq!(metrics.count(ActionKind::Create), 1);
        assert_eq!(metrics.count(ActionKind::Delete), 1);
        assert_eq!(metrics.simulated, 2);
    }

    #[test]
    fn test_cancelled_before_start_skips_everything() {
        let mock = MockBackend::new();
        let connector = connector(Arc::new(mock.clone()));
        let plan = plan("test", vec![create("A"), orphan("B")], &policy(false));
        let cancel = CancelToken::new();
        cancel.cancel();

        let (metrics, result) = Executor::new(&connector, 2).execute(&plan, &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(metrics.skipped, 2);
        assert_eq!(metrics.succeeded(), 0);
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_failed_create_does_not_block_later_phases() {
        let mock = MockBackend::new();
        mock.insert(SavedObject::new("default", "dashboard", "old", json!({})).with_tag("managed"));
        mock.fail_next(
            "B",
            [kibanakit::Error::Client {
                status: 400,
                url: "mock".to_string(),
                body: String::new(),
            }],
        );
        let connector = connector(Arc::new(mock.clone()));
        let plan = plan(
            "test",
            vec![create("A"), create("B"), create("C"), orphan("old")],
            &policy(false),
        );

        let (metrics, result) = Executor::new(&connector, 2).execute(&plan, &CancelToken::new());
        assert!(matches!(result, Err(Error::ActionsFailed { failed: 1, .. })));
        assert_eq!(metrics.count(ActionKind::Create), 2);
        assert_eq!(metrics.count(ActionKind::Delete), 1);
        assert!(mock.object("default", "dashboard", "old").is_none());
    }

    /// Backend that cancels the run from inside the first create, then
    /// lets that create complete.
    struct CancellingBackend {
        inner: MockBackend,
        cancel: CancelToken,
    }

    impl kibanakit::Backend for CancellingBackend {
        fn find(&self, space: &str, types: &[String], tag: &str) -> kibanakit::Result<Vec<SavedObject>> {
            self.inner.find(space, types, tag)
        }

        fn find_all(&self, space: &str, types: &[String]) -> kibanakit::Result<Vec<SavedObject>> {
            self.inner.find_all(space, types)
        }

        fn get(&self, space: &str, object_type: &str, id: &str) -> kibanakit::Result<Option<SavedObject>> {
            self.inner.get(space, object_type, id)
        }

        fn create(&self, object: &SavedObject) -> kibanakit::Result<()> {
            self.cancel.cancel();
            self.inner.create(object)
        }

        fn upsert(&self, object: &SavedObject) -> kibanakit::Result<()> {
            self.inner.upsert(object)
        }

        fn delete(&self, space: &str, object_type: &str, id: &str) -> kibanakit::Result<()> {
            self.inner.delete(space, object_type, id)
        }
    }

    #[test]
    fn test_cancel_mid_run_lets_in_flight_finish() {
        let mock = MockBackend::new();
        mock.insert(SavedObject::new("default", "dashboard", "old", json!({})).with_tag("managed"));
        let cancel = CancelToken::new();
        let connector = connector(Arc::new(CancellingBackend {
            inner: mock.clone(),
            cancel: cancel.clone(),
        }));
        let plan = plan(
            "test",
            vec![create("A"), create("B"), create("C"), orphan("old")],
            &policy(false),
        );

        let (metrics, result) = Executor::new(&connector, 1).execute(&plan, &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));

        // the create that observed the cancellation still completed
        assert_eq!(metrics.count(ActionKind::Create), 1);
        assert_eq!(metrics.skipped, 3);
        assert_eq!(metrics.errors, 0);
        assert_eq!(mock.mutating_calls().len(), 1);
        assert_eq!(mock.objects().len(), 2);
        assert!(mock.object("default", "dashboard", "old").is_some());
    }

    /// Backend that tracks how many calls overlap.
    struct CountingBackend {
        inner: MockBackend,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl kibanakit::Backend for CountingBackend {
        fn find(&self, space: &str, types: &[String], tag: &str) -> kibanakit::Result<Vec<SavedObject>> {
            self.inner.find(space, types, tag)
        }

        fn find_all(&self, space: &str, types: &[String]) -> kibanakit::Result<Vec<SavedObject>> {
            self.inner.find_all(space, types)
        }

        fn get(&self, space: &str, object_type: &str, id: &str) -> kibanakit::Result<Option<SavedObject>> {
            self.inner.get(space, object_type, id)
        }

        fn create(&self, object: &SavedObject) -> kibanakit::Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            let result = self.inner.create(object);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn upsert(&self, object: &SavedObject) -> kibanakit::Result<()> {
            self.inner.upsert(object)
        }

        fn delete(&self, space: &str, object_type: &str, id: &str) -> kibanakit::Result<()> {
            self.inner.delete(space, object_type, id)
        }
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let backend = Arc::new(CountingBackend {
            inner: MockBackend::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let connector = connector(backend.clone());
        let ids: Vec<String> = (0..20).map(|i| format!("d{i}")).collect();
        let candidates = ids.iter().map(|id| create(id)).collect();
        let plan = plan("test", candidates, &policy(false));

        let (metrics, result) = Executor::new(&connector, 3).execute(&plan, &CancelToken::new());
        result.unwrap();
        assert_eq!(metrics.count(ActionKind::Create), 20);
        assert!(backend.peak.load(Ordering::SeqCst) <= 3);
    }
}

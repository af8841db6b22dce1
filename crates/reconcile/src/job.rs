//! Job - one reconciliation run across every configured environment

use crate::config::{Config, EnvironmentTarget};
use crate::connector::TargetConnector;
use crate::diff::{self, DiffSummary};
use crate::error::{EnvironmentFailure, Error, Result};
use crate::executor::Executor;
use crate::inventory::{Resolver, load_source};
use crate::metrics::{EnvironmentMetrics, RunMetrics};
use crate::planner::{self, Plan, Policy};
use kibanakit::{Backend, CancelToken, HttpBackend, Sleeper, ThreadSleeper};
use std::sync::Arc;
use std::time::Instant;

/// Options chosen per invocation rather than per configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Plan and count everything, write nothing
    pub dry_run: bool,
}

/// Builds the backend for an environment.
pub type BackendFactory = Box<dyn Fn(&EnvironmentTarget) -> Arc<dyn Backend> + Send + Sync>;

/// A single reconciliation run.
///
/// Nothing is cached between runs: source files and remote inventories are
/// read again every time [`Job::run`] is called.
pub struct Job {
    config: Config,
    options: Options,
    backends: BackendFactory,
    sleeper: Arc<dyn Sleeper>,
    metrics: RunMetrics,
}

impl Job {
    /// Create a job talking to Kibana over HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration does not validate.
    pub fn new(config: Config, options: Options) -> Result<Self> {
        Self::with_backend_factory(config, options, |target| {
            let backend = HttpBackend::new(target.url.clone(), target.timeout)
                .with_headers(target.headers.clone());
            log::debug!("{}: connecting to {}", target.name, backend.base_url());
            Arc::new(backend) as Arc<dyn Backend>
        })
    }

    /// Create a job with a custom backend per environment.
    pub fn with_backend_factory(
        config: Config,
        options: Options,
        factory: impl Fn(&EnvironmentTarget) -> Arc<dyn Backend> + Send + Sync + 'static,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            options,
            backends: Box::new(factory),
            sleeper: Arc::new(ThreadSleeper),
            metrics: RunMetrics::new(options.dry_run),
        })
    }

    /// Replace the sleeper used between retries.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> Options {
        self.options
    }

    /// Counters of the last run. Populated even when the run failed.
    pub fn metrics(&self) -> RunMetrics {
        self.metrics.clone()
    }

    /// Reconcile every environment, in configuration order.
    ///
    /// A failing environment does not stop the others. Cancellation stops
    /// before the next environment.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if the run was interrupted, otherwise
    /// [`Error::Failed`] listing every environment that did not converge.
    /// Source loading errors abort the run before any environment.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        let started = Instant::now();
        self.metrics = RunMetrics::new(self.options.dry_run);
        let result = self.run_environments(cancel);
        self.metrics.duration = started.elapsed();
        result
    }

    fn run_environments(&mut self, cancel: &CancelToken) -> Result<()> {
        let source = load_source(&self.config.source.path, &self.config.management)?;
        let resolver = Resolver::new(&source, &self.config.management);
        let policy = Policy {
            reconcile_mode: self.config.reconcile_mode,
            drift_mode: self.config.drift_mode,
            dry_run: self.options.dry_run,
        };

        let mut failures = Vec::new();
        let mut cancelled = false;
        for target in self.config.targets() {
            if cancel.is_cancelled() {
                log::warn!("cancelled before environment {}", target.name);
                cancelled = true;
                break;
            }

            let (metrics, result) = self.run_environment(&resolver, &target, &policy, cancel);
            self.metrics.add_environment(&target.name, metrics);
            match result {
                Ok(()) => log::info!("{}: converged", target.name),
                Err(Error::Cancelled) => {
                    log::warn!("{}: cancelled", target.name);
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    log::error!("{}: {e}", target.name);
                    self.metrics.fail_environment(&target.name);
                    failures.push(EnvironmentFailure {
                        environment: target.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if cancelled {
            Err(Error::Cancelled)
        } else if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Failed(failures))
        }
    }

    fn run_environment(
        &self,
        resolver: &Resolver<'_>,
        target: &EnvironmentTarget,
        policy: &Policy,
        cancel: &CancelToken,
    ) -> (EnvironmentMetrics, Result<()>) {
        let connector = TargetConnector::new(
            target.name.clone(),
            (self.backends)(target),
            self.config.retry.policy(),
            Arc::clone(&self.sleeper),
            self.config.tags(),
        )
        .with_content_types(&self.config.management.types);

        let plan = match Self::prepare(resolver, target, &connector, policy, cancel) {
            Ok(plan) => plan,
            Err(e) => return (EnvironmentMetrics::default(), Err(e)),
        };

        Executor::new(&connector, target.concurrency).execute(&plan, cancel)
    }

    fn prepare(
        resolver: &Resolver<'_>,
        target: &EnvironmentTarget,
        connector: &TargetConnector,
        policy: &Policy,
        cancel: &CancelToken,
    ) -> Result<Plan> {
        let (desired, observed) = resolver.resolve(target, connector, cancel)?;
        let candidates = diff::compute(&desired, &observed)?;
        let summary = DiffSummary::from_candidates(&candidates);
        if summary.has_changes() {
            log::info!("{}: {summary}", target.name);
        } else {
            log::info!("{}: no differences ({summary})", target.name);
        }

        let plan = planner::plan(&target.name, candidates, policy);
        for planned in &plan.actions {
            log::debug!("{}: planned {}", target.name, planned.action);
        }
        if plan.is_converged() {
            log::debug!("{}: {} resource(s), nothing to write", target.name, plan.len());
        }
        Ok(plan)
    }
}

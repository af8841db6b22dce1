//! # Reconcile
//!
//! Converges Kibana saved objects and spaces toward a declared inventory.
//!
//! ## Core Concepts
//!
//! - **Management marker**: a tag proving an object is owned by this tool.
//!   Objects without it are never updated, disabled or deleted.
//! - **Drift**: a managed object whose content differs from its declaration
//! - **Orphan**: a managed object that is no longer declared
//! - **Plan**: the ordered actions for one environment
//!
//! ## Pipeline
//!
//! ```text
//! source files ─► Resolver ─► desired ┐
//!                                     ├─► diff::compute ─► planner::plan ─► Executor ─► RunMetrics
//! Kibana ───────► Resolver ─► observed┘                                      │
//!                                                                  TargetConnector (retry)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use kibanakit::CancelToken;
//! use reconcile::{Config, Job, Options};
//!
//! let config: Config = toml::from_str(&std::fs::read_to_string("sync.toml")?)?;
//! let mut job = Job::new(config, Options { dry_run: true })?;
//! let result = job.run(&CancelToken::new());
//! println!("{}", job.metrics());
//! result?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod connector;
pub mod diff;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod job;
pub mod metrics;
pub mod planner;
pub mod types;

pub use config::{Config, DriftMode, EnvironmentTarget, ReconcileMode};
pub use connector::TargetConnector;
pub use diff::{Candidate, DiffSummary, DriftReason};
pub use error::{EnvironmentFailure, Error, Result};
pub use executor::Executor;
pub use inventory::{Resolver, SourceObject, load_source};
pub use job::{BackendFactory, Job, Options};
pub use metrics::{EnvironmentMetrics, MetricsAggregator, Outcome, OutcomeStatus, RunMetrics, aggregate};
pub use planner::{Action, ActionKind, Phase, Plan, PlannedAction, Policy};
pub use types::{
    Fingerprint, ManagementTags, ObservedResource, Payload, ResourceDefinition, ResourceKey,
};

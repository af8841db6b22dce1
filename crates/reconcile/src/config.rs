//! Engine configuration: modes, source of truth, ownership tags, targets

use crate::error::{Error, Result};
use crate::types::ManagementTags;
use kibanakit::{Error as ApiError, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Workers per environment when the target does not say otherwise.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Per-request timeout when the target does not say otherwise.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Name of the implicit target built from a single `[kibana]` section.
pub const DEFAULT_ENVIRONMENT: &str = "default";

/// What to do with managed resources that are no longer declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum ReconcileMode {
    /// Remove orphans
    #[default]
    Delete,
    /// Keep orphans but tag them as disabled
    Disable,
}

impl ReconcileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Disable => "disable",
        }
    }
}

impl FromStr for ReconcileMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "delete" => Ok(Self::Delete),
            "disable" => Ok(Self::Disable),
            _ => Err(format!(
                "invalid reconcile mode {s:?}; expected delete or disable"
            )),
        }
    }
}

impl TryFrom<String> for ReconcileMode {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with managed resources whose content differs from the declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum DriftMode {
    /// Write the declared content back
    #[default]
    Overwrite,
    /// Report the mismatch and leave the remote object alone
    Flag,
}

impl DriftMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Flag => "flag",
        }
    }
}

impl FromStr for DriftMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "flag" => Ok(Self::Flag),
            _ => Err(format!(
                "invalid drift mode {s:?}; expected overwrite or flag"
            )),
        }
    }
}

impl TryFrom<String> for DriftMode {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for DriftMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// File schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub reconcile_mode: ReconcileMode,
    #[serde(default)]
    pub drift_mode: DriftMode,
    pub source: SourceConfig,
    #[serde(default)]
    pub management: ManagementConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Single target (mutually exclusive with `environments`)
    #[serde(default)]
    pub kibana: Option<TargetConfig>,
    /// Environment routing
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory holding `*.json` / `*.ndjson` saved object files
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    #[serde(default = "default_marker_tag")]
    pub marker_tag: String,
    #[serde(default = "default_disabled_tag")]
    pub disabled_tag: String,
    /// Saved object types under management
    #[serde(default = "default_types")]
    pub types: Vec<String>,
}

fn default_marker_tag() -> String {
    "kibana-resource-sync".to_string()
}

fn default_disabled_tag() -> String {
    "kibana-resource-sync-disabled".to_string()
}

fn default_types() -> Vec<String> {
    ["dashboard", "visualization", "search", "index-pattern", "lens", "space"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            marker_tag: default_marker_tag(),
            disabled_tag: default_disabled_tag(),
            types: default_types(),
        }
    }
}

impl ManagementConfig {
    pub fn tags(&self) -> ManagementTags {
        ManagementTags {
            marker: self.marker_tag.clone(),
            disabled: self.disabled_tag.clone(),
        }
    }

    /// Whether resources of this type are under management.
    pub fn manages(&self, resource_type: &str) -> bool {
        self.types.iter().any(|t| t == resource_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub max_total_wait_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            max_total_wait_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_total_wait: Duration::from_millis(self.max_total_wait_ms),
            jitter: self.jitter,
            classifier: ApiError::is_retryable,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Spaces always scanned for orphans, in addition to declared ones
    #[serde(default)]
    pub spaces: Vec<String>,
    /// Extra request headers, passed through verbatim
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(flatten)]
    pub target: TargetConfig,
    /// Source space -> target space
    #[serde(default)]
    pub space_map: BTreeMap<String, String>,
    #[serde(default)]
    pub overrides: Vec<AttributeOverride>,
}

/// Attributes merged into one declared resource for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeOverride {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
    /// Source space to match; any space when absent
    #[serde(default)]
    pub space: Option<String>,
    pub attributes: serde_json::Value,
}

/// A fully resolved destination instance.
#[derive(Debug, Clone)]
pub struct EnvironmentTarget {
    pub name: String,
    pub url: String,
    pub concurrency: usize,
    pub timeout: Duration,
    pub spaces: Vec<String>,
    pub headers: Vec<(String, String)>,
    pub space_map: BTreeMap<String, String>,
    pub overrides: Vec<AttributeOverride>,
}

impl EnvironmentTarget {
    fn from_config(
        name: &str,
        target: &TargetConfig,
        space_map: &BTreeMap<String, String>,
        overrides: &[AttributeOverride],
    ) -> Self {
        let spaces = if target.spaces.is_empty() {
            vec![kibanakit::DEFAULT_SPACE.to_string()]
        } else {
            target.spaces.clone()
        };
        Self {
            name: name.to_string(),
            url: target.url.clone(),
            concurrency: target.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            timeout: Duration::from_secs(target.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            spaces,
            headers: target
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            space_map: space_map.clone(),
            overrides: overrides.to_vec(),
        }
    }

    /// Target space for a source space.
    pub fn map_space<'a>(&'a self, space: &'a str) -> &'a str {
        self.space_map.get(space).map_or(space, String::as_str)
    }
}

impl Config {
    /// Whether the run addresses a list of named environments.
    pub fn uses_environment_targets(&self) -> bool {
        !self.environments.is_empty()
    }

    pub fn tags(&self) -> ManagementTags {
        self.management.tags()
    }

    /// Resolved destinations, in configuration order.
    pub fn targets(&self) -> Vec<EnvironmentTarget> {
        if self.uses_environment_targets() {
            self.environments
                .iter()
                .map(|e| EnvironmentTarget::from_config(&e.name, &e.target, &e.space_map, &e.overrides))
                .collect()
        } else {
            self.kibana
                .iter()
                .map(|k| EnvironmentTarget::from_config(DEFAULT_ENVIRONMENT, k, &BTreeMap::new(), &[]))
                .collect()
        }
    }

    /// Check everything the engine relies on before any remote call.
    pub fn validate(&self) -> Result<()> {
        match (&self.kibana, self.environments.is_empty()) {
            (Some(_), false) => {
                return Err(config_error(
                    "set either [kibana] or [[environments]], not both",
                ));
            }
            (None, true) => {
                return Err(config_error(
                    "no target configured; set [kibana] or [[environments]]",
                ));
            }
            _ => {}
        }

        if self.source.path.as_os_str().is_empty() {
            return Err(config_error("source.path must not be empty"));
        }

        let m = &self.management;
        if m.marker_tag.trim().is_empty() || m.disabled_tag.trim().is_empty() {
            return Err(config_error("management tags must not be empty"));
        }
        if m.marker_tag == m.disabled_tag {
            return Err(config_error(
                "management.marker_tag and management.disabled_tag must differ",
            ));
        }
        if m.types.is_empty() {
            return Err(config_error("management.types must list at least one type"));
        }

        if self.retry.max_attempts == 0 {
            return Err(config_error("retry.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(config_error("retry.jitter must be between 0 and 1"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(config_error("retry.backoff_factor must be at least 1"));
        }

        let mut names = HashSet::new();
        for env in &self.environments {
            if env.name.trim().is_empty() {
                return Err(config_error("environment name must not be empty"));
            }
            if !names.insert(env.name.as_str()) {
                return Err(config_error(format!(
                    "duplicate environment name {:?}",
                    env.name
                )));
            }
            validate_target(&env.name, &env.target)?;
        }
        if let Some(kibana) = &self.kibana {
            validate_target(DEFAULT_ENVIRONMENT, kibana)?;
        }

        Ok(())
    }
}

fn validate_target(name: &str, target: &TargetConfig) -> Result<()> {
    let url = target.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(config_error(format!(
            "environment {name}: url must start with http:// or https://"
        )));
    }
    if target.concurrency == Some(0) {
        return Err(config_error(format!(
            "environment {name}: concurrency must be at least 1"
        )));
    }
    Ok(())
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(message.into())
}

//! Push run metrics to a Prometheus push gateway

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use kibanakit::encode_segment;
use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use reconcile::{ActionKind, RunMetrics};
use std::time::Duration;

const DEFAULT_JOB: &str = "kibana-resource-sync";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const PREFIX: &str = "kibana_resource_sync";

/// Push gateway target, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushGateway {
    pub url: String,
    pub job: String,
    pub instance: String,
    pub timeout: Duration,
}

impl PushGateway {
    /// Settings from `PUSHGATEWAY_*` variables. `None` when
    /// `PUSHGATEWAY_URL` is unset or empty.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let Some(url) = non_empty("PUSHGATEWAY_URL") else {
            return Ok(None);
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("PUSHGATEWAY_URL must start with http:// or https://, got {url:?}");
        }

        let timeout = match non_empty("PUSHGATEWAY_TIMEOUT") {
            Some(value) => parse_duration(&value)
                .with_context(|| format!("Invalid PUSHGATEWAY_TIMEOUT {value:?}"))?,
            None => DEFAULT_TIMEOUT,
        };

        let instance = non_empty("PUSHGATEWAY_INSTANCE")
            .or_else(|| non_empty("HOSTNAME"))
            .or_else(hostname)
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Some(Self {
            url: url.trim_end_matches('/').to_string(),
            job: non_empty("PUSHGATEWAY_JOB").unwrap_or_else(|| DEFAULT_JOB.to_string()),
            instance,
            timeout,
        }))
    }

    /// Grouping key URL the metrics are pushed to.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/metrics/job/{}/instance/{}",
            self.url,
            encode_segment(&self.job),
            encode_segment(&self.instance)
        )
    }

    /// Replace the metrics of this job/instance group.
    pub fn push(&self, metrics: &RunMetrics, success: bool) -> Result<()> {
        let body = render(metrics, success, Utc::now())?;
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .build();
        let agent = ureq::Agent::new_with_config(config);

        let endpoint = self.endpoint();
        agent
            .put(&endpoint)
            .header("Content-Type", TextEncoder::new().format_type())
            .send(body.as_str())
            .with_context(|| format!("Failed to push metrics to {endpoint}"))?;
        log::debug!("pushed metrics to {endpoint}");
        Ok(())
    }
}

/// Parse `10s`, `500ms`, `2m` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .with_context(|| format!("expected a number in {value:?}"))?;
    let seconds = match unit.trim() {
        "" | "s" => number,
        "ms" => number / 1000.0,
        "m" => number * 60.0,
        other => bail!("unknown duration unit {other:?}"),
    };
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("duration must be positive");
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Gauges describing one run.
struct RunGauges {
    actions: IntGaugeVec,
    errors: IntGaugeVec,
    errors_total: IntGauge,
    skipped_total: IntGauge,
    duration_seconds: Gauge,
    dry_run: IntGauge,
    success: IntGauge,
    last_run_timestamp_seconds: IntGauge,
}

impl RunGauges {
    fn new(registry: &Registry) -> prometheus::Result<Self> {
        let actions = IntGaugeVec::new(
            Opts::new("actions", "Actions settled in the last run"),
            &["environment", "action"],
        )?;
        registry.register(Box::new(actions.clone()))?;

        let errors = IntGaugeVec::new(
            Opts::new("errors", "Failed actions in the last run"),
            &["environment"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let gauges = Self {
            actions,
            errors,
            errors_total: int_gauge(registry, "errors_total", "Failed actions across environments")?,
            skipped_total: int_gauge(registry, "skipped_total", "Actions abandoned on cancellation")?,
            duration_seconds: {
                let gauge = Gauge::new("duration_seconds", "Wall time of the last run")?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            },
            dry_run: int_gauge(registry, "dry_run", "1 if the last run wrote nothing")?,
            success: int_gauge(registry, "success", "1 if the last run converged")?,
            last_run_timestamp_seconds: int_gauge(
                registry,
                "last_run_timestamp_seconds",
                "Unix time the last run finished",
            )?,
        };
        Ok(gauges)
    }

    fn observe(&self, metrics: &RunMetrics, success: bool, now: DateTime<Utc>) {
        for (environment, env_metrics) in &metrics.environments {
            for kind in ActionKind::ALL {
                self.actions
                    .with_label_values(&[environment.as_str(), kind.as_str()])
                    .set(saturating(env_metrics.count(kind)));
            }
            self.errors
                .with_label_values(&[environment.as_str()])
                .set(saturating(env_metrics.errors));
        }
        self.errors_total.set(saturating(metrics.errors));
        self.skipped_total.set(saturating(metrics.skipped));
        self.duration_seconds.set(metrics.duration.as_secs_f64());
        self.dry_run.set(i64::from(metrics.dry_run));
        self.success.set(i64::from(success));
        self.last_run_timestamp_seconds.set(now.timestamp());
    }
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn saturating(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Prometheus text exposition of a run.
pub fn render(metrics: &RunMetrics, success: bool, now: DateTime<Utc>) -> Result<String> {
    let registry = Registry::new_custom(Some(PREFIX.to_string()), None)?;
    RunGauges::new(&registry)?.observe(metrics, success, now);

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Host name of this machine.
#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];

    // SAFETY: gethostname writes at most buf.len() bytes into a buffer we own.
    // The result is only read up to the first NUL.
    let result = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if result != 0 {
        return None;
    }

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    None
}

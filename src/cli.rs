use clap::{Parser, ValueEnum};
use reconcile::{DriftMode, ReconcileMode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kibana-resource-sync")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Reconcile Kibana saved objects and spaces against a declared inventory", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Plan and report without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Info, ignore_case = true)]
    pub log_level: LogLevel,

    /// Override reconcile_mode from the configuration file
    #[arg(long, value_enum, ignore_case = true)]
    pub reconcile_mode: Option<ReconcileModeArg>,

    /// Override drift_mode from the configuration file
    #[arg(long, value_enum, ignore_case = true)]
    pub drift_mode: Option<DriftModeArg>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::Debug,
            LogLevel::Info => Self::Info,
            LogLevel::Warn => Self::Warn,
            LogLevel::Error => Self::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReconcileModeArg {
    /// Remove managed objects that are no longer declared
    Delete,
    /// Tag managed objects that are no longer declared as disabled
    Disable,
}

impl From<ReconcileModeArg> for ReconcileMode {
    fn from(arg: ReconcileModeArg) -> Self {
        match arg {
            ReconcileModeArg::Delete => Self::Delete,
            ReconcileModeArg::Disable => Self::Disable,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DriftModeArg {
    /// Write the declared content back
    Overwrite,
    /// Report drift and leave the object alone
    Flag,
}

impl From<DriftModeArg> for DriftMode {
    fn from(arg: DriftModeArg) -> Self {
        match arg {
            DriftModeArg::Overwrite => Self::Overwrite,
            DriftModeArg::Flag => Self::Flag,
        }
    }
}

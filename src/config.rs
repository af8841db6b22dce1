//! Configuration file loading

use anyhow::{Context, Result};
use reconcile::{Config, DriftMode, ReconcileMode};
use std::fs;
use std::path::{Path, PathBuf};

/// Expand a leading `~` in a path.
pub fn expand(path: &Path) -> PathBuf {
    let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
    PathBuf::from(expanded)
}

/// Absolute form of `path`, for log lines.
pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Load and validate a configuration file.
///
/// A relative `source.path` is resolved against the directory holding the
/// configuration file.
pub fn load(path: &Path) -> Result<Config> {
    let path = expand(path);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Invalid config file {}", path.display()))?;

    let source = expand(&config.source.path);
    config.source.path = if source.is_relative() {
        path.parent().unwrap_or_else(|| Path::new(".")).join(source)
    } else {
        source
    };

    config
        .validate()
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok(config)
}

/// Apply mode overrides from the command line. Returns whether anything changed.
pub fn apply_overrides(
    config: &mut Config,
    reconcile_mode: Option<ReconcileMode>,
    drift_mode: Option<DriftMode>,
) -> bool {
    let mut overridden = false;
    if let Some(mode) = reconcile_mode
        && mode != config.reconcile_mode
    {
        config.reconcile_mode = mode;
        overridden = true;
    }
    if let Some(mode) = drift_mode
        && mode != config.drift_mode
    {
        config.drift_mode = mode;
        overridden = true;
    }
    overridden
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
reconcile_mode = "disable"

[source]
path = "objects"

[kibana]
url = "http://localhost:5601"
"#;

    #[test]
    fn test_load_resolves_source_against_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.toml");
        fs::write(&path, CONFIG).unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.source.path, dir.path().join("objects"));
        assert_eq!(config.reconcile_mode, ReconcileMode::Disable);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/sync.toml")).unwrap_err();
        assert!(err.to_string().contains("Could not read"));
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.toml");
        fs::write(&path, "[source]\npath = \"objects\"\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("no target configured"));
    }

    #[test]
    fn test_load_rejects_unknown_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.toml");
        fs::write(&path, CONFIG.replace("disable", "archive")).unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sync.toml");
        fs::write(&path, CONFIG).unwrap();
        let mut config = load(&path).unwrap();

        assert!(!apply_overrides(&mut config, Some(ReconcileMode::Disable), None));
        assert!(apply_overrides(&mut config, None, Some(DriftMode::Flag)));
        assert_eq!(config.drift_mode, DriftMode::Flag);
        assert_eq!(config.reconcile_mode, ReconcileMode::Disable);
    }

    #[test]
    fn test_expand_leaves_plain_paths_alone() {
        assert_eq!(expand(Path::new("/srv/objects")), PathBuf::from("/srv/objects"));
        assert_eq!(expand(Path::new("objects")), PathBuf::from("objects"));
    }
}

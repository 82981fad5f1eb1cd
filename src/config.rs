//! Configuration loading.
//!
//! Reads `<config dir>/cefhost/config.json` (or an explicit path) and then
//! applies `CEFHOST_*` environment overrides. Every field has a default, so
//! a missing file or a partial one is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::tunnel::ReconnectPolicy;

/// Config file name inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// A git-backed module kept in sync by the updater.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ModuleMirror {
    /// Checkout location; relative paths are under `plugins_dir`.
    pub path: PathBuf,
    /// Remote URL or local path to clone from.
    pub remote: String,
}

/// Loader configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Host name of the debugger HTTP endpoint.
    pub debugger_host: String,
    /// Executable expected to own the debugger port.
    pub host_executable: String,
    /// Directory scanned for plugins.
    pub plugins_dir: PathBuf,
    /// Modules refreshed before plugins load.
    pub modules: Vec<ModuleMirror>,
    /// Delay between tunnel reconnect attempts, in milliseconds.
    pub reconnect_ms: u64,
    /// When set, reconnect delays double up to this bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_ms: Option<u64>,
    /// Title of the page target used for the shared tunnel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_target_title: Option<String>,
    /// How long `unload` waits for a plugin thread, in milliseconds.
    pub unload_timeout_ms: u64,
    /// How long startup waits for the debugger port to open, in seconds.
    pub endpoint_wait_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let plugins_dir = dirs::data_dir()
            .map(|d| d.join("cefhost").join("plugins"))
            .unwrap_or_else(|| PathBuf::from("plugins"));

        Self {
            debugger_host: "localhost".to_string(),
            host_executable: "steamwebhelper".to_string(),
            plugins_dir,
            modules: Vec::new(),
            reconnect_ms: 50,
            max_reconnect_ms: None,
            shared_target_title: Some("SharedJSContext".to_string()),
            unload_timeout_ms: 2_000,
            endpoint_wait_secs: 30,
        }
    }
}

impl Config {
    /// The configuration directory.
    ///
    /// `CEFHOST_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("CEFHOST_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("cefhost"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::config_dir()?.join(CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    log::debug!("[Config] No config at {}, using defaults", default_path.display());
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `CEFHOST_*` overrides from `lookup`. Unparsable numbers are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn number(key: &str, value: &str) -> Option<u64> {
            match value.trim().parse::<u64>() {
                Ok(n) => Some(n),
                Err(e) => {
                    log::warn!("[Config] Ignoring {key}={value}: {e}");
                    None
                }
            }
        }

        if let Some(dir) = lookup("CEFHOST_PLUGINS_DIR") {
            self.plugins_dir = PathBuf::from(dir);
        }

        if let Some(exe) = lookup("CEFHOST_HOST_EXECUTABLE") {
            self.host_executable = exe;
        }

        if let Some(host) = lookup("CEFHOST_DEBUGGER_HOST") {
            self.debugger_host = host;
        }

        if let Some(ms) = lookup("CEFHOST_RECONNECT_MS").and_then(|v| number("CEFHOST_RECONNECT_MS", &v)) {
            self.reconnect_ms = ms;
        }

        if let Some(ms) = lookup("CEFHOST_MAX_RECONNECT_MS").and_then(|v| number("CEFHOST_MAX_RECONNECT_MS", &v)) {
            self.max_reconnect_ms = Some(ms);
        }

        if let Some(ms) = lookup("CEFHOST_UNLOAD_TIMEOUT_MS").and_then(|v| number("CEFHOST_UNLOAD_TIMEOUT_MS", &v)) {
            self.unload_timeout_ms = ms;
        }

        // Empty string disables the shared tunnel
        if let Some(title) = lookup("CEFHOST_SHARED_TARGET") {
            self.shared_target_title = Some(title).filter(|t| !t.is_empty());
        }
    }

    /// Reconnect policy for the tunnels.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let initial = Duration::from_millis(self.reconnect_ms);
        match self.max_reconnect_ms {
            Some(max) if max > self.reconnect_ms => ReconnectPolicy::Exponential {
                initial,
                max: Duration::from_millis(max),
            },
            _ => ReconnectPolicy::Fixed(initial),
        }
    }

    /// Bound on plugin unload.
    #[must_use]
    pub fn unload_timeout(&self) -> Duration {
        Duration::from_millis(self.unload_timeout_ms)
    }

    /// Bound on waiting for the debugger port at startup.
    #[must_use]
    pub fn endpoint_wait(&self) -> Duration {
        Duration::from_secs(self.endpoint_wait_secs)
    }

    /// Absolute checkout path of `module`.
    #[must_use]
    pub fn module_path(&self, module: &ModuleMirror) -> PathBuf {
        if module.path.is_absolute() {
            module.path.clone()
        } else {
            self.plugins_dir.join(&module.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.debugger_host, "localhost");
        assert_eq!(config.host_executable, "steamwebhelper");
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::Fixed(Duration::from_millis(50)));
        assert_eq!(config.shared_target_title.as_deref(), Some("SharedJSContext"));
        assert_eq!(config.unload_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"plugins_dir": "/opt/plugins", "modules": [{"path": "clock", "remote": "https://example.com/clock.git"}]}"#,
        )
        .unwrap();

        assert_eq!(config.plugins_dir, PathBuf::from("/opt/plugins"));
        assert_eq!(config.reconnect_ms, 50);
        assert_eq!(config.module_path(&config.modules[0]), PathBuf::from("/opt/plugins/clock"));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("CEFHOST_PLUGINS_DIR", "/srv/plugins"),
            ("CEFHOST_HOST_EXECUTABLE", "cefclient"),
            ("CEFHOST_DEBUGGER_HOST", "127.0.0.1"),
            ("CEFHOST_RECONNECT_MS", "100"),
            ("CEFHOST_MAX_RECONNECT_MS", "5000"),
            ("CEFHOST_UNLOAD_TIMEOUT_MS", "250"),
            ("CEFHOST_SHARED_TARGET", ""),
        ]));

        assert_eq!(config.plugins_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.host_executable, "cefclient");
        assert_eq!(config.debugger_host, "127.0.0.1");
        assert_eq!(
            config.reconnect_policy(),
            ReconnectPolicy::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_millis(5000),
            }
        );
        assert_eq!(config.unload_timeout(), Duration::from_millis(250));
        assert_eq!(config.shared_target_title, None);
    }

    #[test]
    fn test_bad_numbers_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[("CEFHOST_RECONNECT_MS", "soon")]));
        assert_eq!(config.reconnect_ms, 50);
    }

    #[test]
    fn test_max_not_above_initial_stays_fixed() {
        let config = Config {
            reconnect_ms: 200,
            max_reconnect_ms: Some(100),
            ..Config::default()
        };
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::Fixed(Duration::from_millis(200)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let config = Config {
            debugger_host: "10.0.0.2".to_string(),
            ..Config::default()
        };
        config.save(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::from_file(&dir.path().join("missing.json")).is_err());
    }
}

//! Plugin discovery on disk.
//!
//! Each subdirectory of the plugins directory is one plugin when it holds
//! a `plugin.json` manifest or, failing that, a `main.lua`:
//!
//! ```text
//! plugins/
//! ├── clock/
//! │   └── main.lua                 name = "clock", entry = main.lua
//! └── bridge/
//!     ├── plugin.json              {"name": "store-bridge", "entry": "init.lua"}
//!     └── init.lua
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::PluginEntry;

/// Manifest file name.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Entry file used when the manifest names none.
pub const DEFAULT_ENTRY: &str = "main.lua";

fn default_entry() -> String {
    DEFAULT_ENTRY.to_string()
}

fn default_enabled() -> bool {
    true
}

/// A plugin found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin name, unique across the plugins directory.
    pub name: String,
    /// Entry file, relative to the plugin directory.
    #[serde(default = "default_entry")]
    pub entry: String,
    /// Disabled plugins are listed but not loaded.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Directory the manifest was read from.
    #[serde(skip)]
    pub dir: PathBuf,
}

impl PluginManifest {
    /// Read the plugin in `dir`, if it is one.
    pub fn from_dir(dir: &Path) -> Result<Option<Self>> {
        let manifest_path = dir.join(MANIFEST_FILE);

        let mut manifest = if manifest_path.is_file() {
            let content = std::fs::read_to_string(&manifest_path)
                .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
            serde_json::from_str::<Self>(&content)
                .with_context(|| format!("Failed to parse {}", manifest_path.display()))?
        } else if dir.join(DEFAULT_ENTRY).is_file() {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("Plugin directory has no name")?;
            Self {
                name,
                entry: default_entry(),
                enabled: true,
                dir: PathBuf::new(),
            }
        } else {
            return Ok(None);
        };

        anyhow::ensure!(
            !manifest.name.trim().is_empty(),
            "{} has an empty plugin name",
            manifest_path.display()
        );

        manifest.dir = dir.to_path_buf();
        Ok(Some(manifest))
    }

    /// Absolute path of the entry file.
    #[must_use]
    pub fn entry_path(&self) -> PathBuf {
        self.dir.join(&self.entry)
    }

    /// Entry to hand to the runtime manager.
    #[must_use]
    pub fn to_entry(&self) -> PluginEntry {
        PluginEntry::File(self.entry_path())
    }
}

/// Find every plugin under `plugins_dir`, sorted by name.
///
/// A missing directory yields no plugins. Broken manifests and duplicate
/// names are logged and skipped so one bad plugin cannot block the rest.
pub fn discover(plugins_dir: &Path) -> Result<Vec<PluginManifest>> {
    if !plugins_dir.is_dir() {
        log::info!("[Plugins] No plugins directory at {}", plugins_dir.display());
        return Ok(Vec::new());
    }

    let mut dirs: Vec<PathBuf> = std::fs::read_dir(plugins_dir)
        .with_context(|| format!("Failed to read plugins directory {}", plugins_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut seen = HashSet::new();
    let mut manifests = Vec::new();

    for dir in dirs {
        match PluginManifest::from_dir(&dir) {
            Ok(Some(manifest)) => {
                if seen.insert(manifest.name.clone()) {
                    manifests.push(manifest);
                } else {
                    log::warn!(
                        "[Plugins] Duplicate plugin name '{}' in {}; skipping",
                        manifest.name,
                        dir.display()
                    );
                }
            }
            Ok(None) => log::debug!("[Plugins] {} is not a plugin", dir.display()),
            Err(e) => log::warn!("[Plugins] Skipping {}: {e:#}", dir.display()),
        }
    }

    manifests.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(manifests)
}

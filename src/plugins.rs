use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};

/// Manifest file written into each plugin directory.
const MANIFEST_FILE: &str = "plugin.json";

/// Errors from plugin store operations.
#[derive(Debug)]
pub enum PluginError {
    /// Name contains characters outside `[A-Za-z0-9_-]` or is empty/too long.
    InvalidName(String),
    /// No installed plugin with that name.
    NotFound(String),
    /// I/O error under the plugin root.
    Io(std::io::Error),
}

impl PluginError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid plugin name: {name}"),
            Self::NotFound(name) => write!(f, "plugin not found: {name}"),
            Self::Io(e) => write!(f, "plugin store error: {e}"),
        }
    }
}

impl std::error::Error for PluginError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Plugin names double as directory names; restrict them accordingly.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Filesystem-backed plugin registry under `<config_dir>/plugins/`.
///
/// Each plugin is a directory holding a `plugin.json` manifest. The store is
/// local management only; the broker never loads plugin code.
pub struct PluginStore {
    root: PathBuf,
}

impl PluginStore {
    #[must_use]
    pub fn new(config_dir: &Path) -> Self {
        Self {
            root: config_dir.join("plugins"),
        }
    }

    /// List installed plugins as their manifests, `name` always present.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::Io` if the plugin root exists but is unreadable.
    pub fn list(&self) -> Result<Vec<Value>, PluginError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PluginError::Io(e)),
        };

        let mut plugins = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let manifest = std::fs::read_to_string(entry.path().join(MANIFEST_FILE))
                .ok()
                .and_then(|contents| serde_json::from_str::<Value>(&contents).ok())
                .unwrap_or_else(|| json!({}));
            let mut record = json!({ "name": name });
            if let (Some(record_map), Some(manifest_map)) =
                (record.as_object_mut(), manifest.as_object())
            {
                for (key, value) in manifest_map {
                    record_map.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            plugins.push(record);
        }
        plugins.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(plugins)
    }

    /// Install (or replace) a plugin's manifest.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::InvalidName` for unsafe names, or
    /// `PluginError::Io` on write failure.
    pub fn install(&self, name: &str, manifest: &Value) -> Result<(), PluginError> {
        if !valid_name(name) {
            return Err(PluginError::InvalidName(name.to_owned()));
        }
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir)?;
        let contents = serde_json::to_string_pretty(manifest)
            .map_err(|e| PluginError::Io(std::io::Error::other(e)))?;
        std::fs::write(dir.join(MANIFEST_FILE), contents)?;
        Ok(())
    }

    /// Remove an installed plugin.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::InvalidName` for unsafe names,
    /// `PluginError::NotFound` if nothing is installed under that name, or
    /// `PluginError::Io` on removal failure.
    pub fn remove(&self, name: &str) -> Result<(), PluginError> {
        if !valid_name(name) {
            return Err(PluginError::InvalidName(name.to_owned()));
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(PluginError::NotFound(name.to_owned()));
        }
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_with_path_separators_rejected() {
        assert!(!valid_name("../escape"));
        assert!(!valid_name("a/b"));
        assert!(!valid_name("a\\b"));
        assert!(!valid_name(""));
        assert!(!valid_name(&"x".repeat(65)));
        assert!(valid_name("tab-recorder_2"));
    }

    #[test]
    fn install_list_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginStore::new(dir.path());

        store
            .install("recorder", &json!({ "version": "1.2.0" }))
            .unwrap();
        let plugins = store.list().unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0]["name"], "recorder");
        assert_eq!(plugins[0]["version"], "1.2.0");

        store.remove("recorder").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn list_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginStore::new(dir.path());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn remove_missing_plugin_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginStore::new(dir.path());
        let err = store.remove("ghost").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn install_traversal_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginStore::new(dir.path());
        let err = store.install("../../etc", &json!({})).unwrap_err();
        assert!(matches!(err, PluginError::InvalidName(_)));
    }

    #[test]
    fn manifest_name_field_does_not_override_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginStore::new(dir.path());
        store
            .install("honest", &json!({ "name": "impostor" }))
            .unwrap();
        let plugins = store.list().unwrap();
        assert_eq!(plugins[0]["name"], "honest");
    }

    #[test]
    fn reinstall_replaces_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginStore::new(dir.path());
        store.install("p", &json!({ "version": "1" })).unwrap();
        store.install("p", &json!({ "version": "2" })).unwrap();
        let plugins = store.list().unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0]["version"], "2");
    }
}

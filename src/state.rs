//! Persisted client state: the discovered workspace file list and the
//! configured companion port.
//!
//! Both live as small JSON documents under `[state] dir`:
//!
//! | File | Contents |
//! |------|----------|
//! | `files.json` | `["src/a.js", ...]` |
//! | `settings.json` | `{ "websocketPort": 49201 }` |
//!
//! With no directory configured, loads return nothing and saves are no-ops.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const FILES_FILE: &str = "files.json";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct StateStore {
    dir: Option<PathBuf>,
}

impl StateStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn load_files(&self) -> Result<Vec<String>> {
        Ok(self.read_json(FILES_FILE)?.unwrap_or_default())
    }

    pub fn save_files(&self, files: &[String]) -> Result<()> {
        self.write_json(FILES_FILE, &files)
    }

    pub fn load_settings(&self) -> Result<Settings> {
        Ok(self.read_json(SETTINGS_FILE)?.unwrap_or_default())
    }

    pub fn load_port(&self) -> Result<Option<u16>> {
        Ok(self.load_settings()?.websocket_port)
    }

    pub fn save_port(&self, port: u16) -> Result<()> {
        let mut settings = self.load_settings()?;
        settings.websocket_port = Some(port);
        self.write_json(SETTINGS_FILE, &settings)
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<Option<T>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    /// Write through a temp file and rename so readers never see a torn file.
    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let path = dir.join(name);
        let tmp = dir.join(format!("{}.tmp", name));
        let body = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_files_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(Some(tmp.path().join("state")));

        assert!(store.load_files().unwrap().is_empty());
        store
            .save_files(&["src/a.js".to_string(), "src/b.js".to_string()])
            .unwrap();
        assert_eq!(store.load_files().unwrap(), vec!["src/a.js", "src/b.js"]);
    }

    #[test]
    fn test_port_setting() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(Some(tmp.path().to_path_buf()));

        assert_eq!(store.load_port().unwrap(), None);
        store.save_port(50123).unwrap();
        assert_eq!(store.load_port().unwrap(), Some(50123));

        let raw = std::fs::read_to_string(tmp.path().join("settings.json")).unwrap();
        assert!(raw.contains("websocketPort"));
    }

    #[test]
    fn test_without_dir_is_inert() {
        let store = StateStore::default();
        store.save_port(1234).unwrap();
        assert_eq!(store.load_port().unwrap(), None);
        assert!(store.load_files().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_reports_path() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("files.json"), "{not json").unwrap();
        let store = StateStore::new(Some(tmp.path().to_path_buf()));
        let err = store.load_files().unwrap_err();
        assert!(format!("{:#}", err).contains("files.json"));
    }
}

//! Runtime overrides persisted by the supervisor and consumed by the child
//! agent at spawn.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CLASS_CATALOG;

/// Default overrides file name, next to the manager's working directory.
pub const OVERRIDES_FILE: &str = "runtime-overrides.json";

/// Operator-set overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Overrides {
    pub classes_filter: Vec<String>,
}

/// Override update errors.
#[derive(Debug, Clone, Error)]
pub enum OverridesError {
    #[error("unknown classes: {0:?}")]
    UnknownClasses(Vec<String>),

    #[error("failed to persist overrides: {0}")]
    Persist(String),
}

/// Persistent override store with atomic writes (temp file + rename).
pub struct OverridesStore {
    path: PathBuf,
    data: Mutex<Option<Overrides>>,
}

impl OverridesStore {
    /// Create a store, loading from disk if the file exists.
    pub fn new(path: PathBuf) -> Self {
        let data = Self::load(&path).unwrap_or_default();
        Self {
            path,
            data: Mutex::new(data),
        }
    }

    /// Load overrides, returning `None` when the file is missing.
    pub fn load(path: &Path) -> Result<Option<Overrides>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| e.to_string())
    }

    /// Current overrides, if any were ever set.
    pub fn current(&self) -> Option<Overrides> {
        self.data.lock().clone()
    }

    /// Effective class filter: overrides when present, else the defaults.
    pub fn effective(&self, defaults: &[String]) -> Vec<String> {
        match self.current() {
            Some(overrides) => overrides.classes_filter,
            None => defaults.to_vec(),
        }
    }

    /// Validate against the class catalog, persist atomically, and store
    /// in-memory. The running child is NOT restarted; the operator applies
    /// the change with an explicit restart.
    pub fn update(&self, classes: Vec<String>) -> Result<Overrides, OverridesError> {
        let unknown: Vec<String> = classes
            .iter()
            .filter(|c| !CLASS_CATALOG.contains(&c.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(OverridesError::UnknownClasses(unknown));
        }

        let overrides = Overrides {
            classes_filter: classes,
        };
        self.save(&overrides)
            .map_err(OverridesError::Persist)?;
        *self.data.lock() = Some(overrides.clone());
        Ok(overrides)
    }

    /// Save to disk atomically (write .tmp then rename).
    fn save(&self, overrides: &Overrides) -> Result<(), String> {
        let json = serde_json::to_string_pretty(overrides).map_err(|e| e.to_string())?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| e.to_string())?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (OverridesStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(OVERRIDES_FILE);
        (OverridesStore::new(path), dir)
    }

    #[test]
    fn load_returns_none_when_file_missing() {
        let dir = TempDir::new().unwrap();
        let result = OverridesStore::load(&dir.path().join("nope.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_returns_error_for_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(OVERRIDES_FILE);
        std::fs::write(&path, "not json").unwrap();
        assert!(OverridesStore::load(&path).is_err());
    }

    #[test]
    fn update_persists_and_round_trips() {
        let (store, dir) = temp_store();
        store
            .update(vec!["person".to_string(), "dog".to_string()])
            .unwrap();

        let path = dir.path().join(OVERRIDES_FILE);
        assert!(path.exists());
        let loaded = OverridesStore::load(&path).unwrap().unwrap();
        assert_eq!(loaded.classes_filter, vec!["person", "dog"]);

        // A fresh store picks the file up
        let store2 = OverridesStore::new(path);
        assert_eq!(store2.current().unwrap().classes_filter, vec!["person", "dog"]);
    }

    #[test]
    fn update_rejects_unknown_classes() {
        let (store, _dir) = temp_store();
        let err = store
            .update(vec!["person".to_string(), "unicorn".to_string()])
            .unwrap_err();
        match err {
            OverridesError::UnknownClasses(unknown) => assert_eq!(unknown, vec!["unicorn"]),
            other => panic!("unexpected error: {other}"),
        }
        // Nothing was stored
        assert!(store.current().is_none());
    }

    #[test]
    fn save_is_atomic() {
        let (store, dir) = temp_store();
        store.update(vec!["car".to_string()]).unwrap();
        let tmp = dir.path().join("runtime-overrides.json.tmp");
        assert!(!tmp.exists(), ".tmp must be cleaned up after rename");
    }

    #[test]
    fn effective_falls_back_to_defaults() {
        let (store, _dir) = temp_store();
        let defaults = vec!["person".to_string(), "car".to_string()];
        assert_eq!(store.effective(&defaults), defaults);

        store.update(vec!["dog".to_string()]).unwrap();
        assert_eq!(store.effective(&defaults), vec!["dog"]);
    }

    #[test]
    fn overrides_serialise_to_camel_case() {
        let overrides = Overrides {
            classes_filter: vec!["person".to_string()],
        };
        let json = serde_json::to_value(&overrides).unwrap();
        assert_eq!(json["classesFilter"][0], "person");
        assert!(json.get("classes_filter").is_none());
    }
}

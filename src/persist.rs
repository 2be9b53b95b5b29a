//! Warm-restart snapshot.
//!
//! A single small JSON record surviving process restarts: enough to come
//! back with the same label and allocated prefix and to re-dial known
//! peers before discovery converges again.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::Label;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmRestartState {
    #[serde(default)]
    pub node_label: Label,
    #[serde(default)]
    pub allocated_prefix: Option<String>,
    #[serde(default)]
    pub last_seen_peers: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PersistentStore {
    path: PathBuf,
}

impl PersistentStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        PersistentStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load the previous state; a missing or corrupt file is a cold start.
    pub fn load(&self) -> WarmRestartState {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(state) => state,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "corrupt warm-restart state, starting cold");
                    WarmRestartState::default()
                }
            },
            Err(_) => WarmRestartState::default(),
        }
    }

    pub fn save(&self, mut state: WarmRestartState) -> Result<()> {
        state.updated_at = Some(Utc::now());
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let text = serde_json::to_string_pretty(&state)
            .map_err(|e| crate::error::Error::SchemaMismatch(e.to_string()))?;
        // write-then-rename so a crash never leaves a torn file
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "warm-restart state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::new(dir.path().join("state.json"));

        let state = WarmRestartState {
            node_label: 4242,
            allocated_prefix: Some("fc00:cafe:babe::/80".to_string()),
            last_seen_peers: vec!["node-2".to_string(), "node-3".to_string()],
            updated_at: None,
        };
        store.save(state).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.node_label, 4242);
        assert_eq!(
            loaded.allocated_prefix.as_deref(),
            Some("fc00:cafe:babe::/80")
        );
        assert_eq!(loaded.last_seen_peers.len(), 2);
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn test_missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::new(dir.path().join("nope.json"));
        let state = store.load();
        assert_eq!(state.node_label, 0);
        assert!(state.allocated_prefix.is_none());
    }

    #[test]
    fn test_corrupt_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let state = PersistentStore::new(&path).load();
        assert!(state.allocated_prefix.is_none());
    }
}

//! JSON file-backed persistence for MoltAgent control-plane state.
//!
//! Provides [`StateFile`], a snapshot store for a single serializable
//! document. Data lives in memory with its owner; this type only knows how to
//! load a snapshot from disk and write one back.

#![forbid(unsafe_code)]

use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A JSON snapshot file for one document.
///
/// Writes go through a sibling temp file followed by a rename, so a crash
/// mid-write leaves the previous snapshot intact.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file or corrupt JSON yields `None`.
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                    None
                }
            },
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                None
            }
        }
    }

    /// Save the document, creating parent directories as needed.
    pub fn save<T: Serialize>(&self, doc: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(doc).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        version: u32,
        entries: HashMap<String, String>,
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateFile::new(dir.path().join("state.json"));

        let doc = Doc {
            version: 1,
            entries: HashMap::from([("k".to_string(), "v".to_string())]),
        };
        store.save(&doc).expect("save");

        let loaded: Doc = store.load().expect("load");
        assert_eq!(loaded, doc);
    }

    #[test]
    fn missing_file_loads_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateFile::new(dir.path().join("nonexistent.json"));
        assert!(store.load::<Doc>().is_none());
    }

    #[test]
    fn corrupt_file_loads_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").expect("write");
        let store = StateFile::new(path);
        assert!(store.load::<Doc>().is_none());
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateFile::new(dir.path().join("a").join("b").join("state.json"));
        let doc = Doc {
            version: 1,
            entries: HashMap::new(),
        };
        store.save(&doc).expect("save with nested dirs");
        assert!(store.load::<Doc>().is_some());
    }

    #[test]
    fn overwrite_keeps_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateFile::new(dir.path().join("state.json"));

        let mut doc = Doc {
            version: 1,
            entries: HashMap::from([("k".to_string(), "first".to_string())]),
        };
        store.save(&doc).expect("save1");
        doc.entries.insert("k".to_string(), "second".to_string());
        store.save(&doc).expect("save2");

        let loaded: Doc = store.load().expect("load");
        assert_eq!(loaded.entries.get("k").map(String::as_str), Some("second"));
    }
}

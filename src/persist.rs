//! Atomic JSON file persistence.
//!
//! The retry queue, the treatment-plan cache and the sync watermark are all
//! small JSON files rewritten in full on every mutation. Writes go to a
//! `.tmp` sibling first and are renamed over the target, so a crash
//! mid-write leaves the previous consistent state on disk.

use std::fs;
use std::io;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a JSON file, returning `None` when it is missing.
///
/// A corrupt or unreadable file is logged and treated as absent rather than
/// aborting startup; the caller starts from an empty state and the next
/// mutation rewrites the file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }

    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Persisted state unreadable, starting fresh");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read persisted state");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct State {
        counter: u32,
        label: String,
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let state = State { counter: 7, label: "hello".into() };
        atomic_write_json(&path, &state).unwrap();

        let loaded: State = load_json(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_missing_file_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let loaded: Option<State> = load_json(&path);
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupt_file_treated_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"{not json").unwrap();

        let loaded: Option<State> = load_json(&path);
        assert!(loaded.is_none());
    }

    #[test]
    fn test_overwrite_replaces_previous_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write_json(&path, &State { counter: 1, label: "a".into() }).unwrap();
        atomic_write_json(&path, &State { counter: 2, label: "b".into() }).unwrap();

        let loaded: State = load_json(&path).unwrap();
        assert_eq!(loaded.counter, 2);
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");

        atomic_write_json(&path, &State { counter: 3, label: "c".into() }).unwrap();
        assert!(path.exists());
    }
}

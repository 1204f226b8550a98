//! Atomic session files.
//!
//! A save writes the JSON document to a temporary file in the destination
//! directory, syncs it to disk and renames it over the target, so a reader
//! sees either the previous file or the complete new one. Loads never
//! modify the file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use tempfile::NamedTempFile;

use crate::error::PersistenceError;
use crate::session::ReconstructionSession;

/// Where sessions are saved and how they are read back.
pub trait SessionStore: Send + Sync {
    /// Persist `session`; returns where it was written.
    fn save(&self, session: &ReconstructionSession) -> Result<PathBuf, PersistenceError>;

    fn load(&self, location: &Path) -> Result<ReconstructionSession, PersistenceError>;
}

/// One JSON file per saved iteration under a directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    directory: PathBuf,
    prefix: String,
}

impl FileSessionStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: "session".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File a session at `iteration` is saved to.
    pub fn location_for(&self, iteration: usize) -> PathBuf {
        self.directory
            .join(format!("{}-{iteration:08}.json", self.prefix))
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, session: &ReconstructionSession) -> Result<PathBuf, PersistenceError> {
        let path = self.location_for(session.iteration());
        save_session(&path, session)?;
        Ok(path)
    }

    fn load(&self, location: &Path) -> Result<ReconstructionSession, PersistenceError> {
        load_session(location)
    }
}

/// Atomically write `session` to `path`.
pub fn save_session(path: &Path, session: &ReconstructionSession) -> Result<(), PersistenceError> {
    let json = session.to_json().map_err(PersistenceError::Serialize)?;
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&directory).map_err(|e| PersistenceError::io(&directory, e))?;

    let mut file = NamedTempFile::new_in(&directory).map_err(|e| PersistenceError::io(&directory, e))?;
    file.write_all(json.as_bytes())
        .map_err(|e| PersistenceError::io(file.path(), e))?;
    file.as_file()
        .sync_all()
        .map_err(|e| PersistenceError::io(file.path(), e))?;
    file.persist(path)
        .map_err(|e| PersistenceError::io(path, e.error))?;
    info!(
        "saved session at iteration {} to {}",
        session.iteration(),
        path.display()
    );
    Ok(())
}

/// Read and validate the session stored at `path`.
pub fn load_session(path: &Path) -> Result<ReconstructionSession, PersistenceError> {
    let json = fs::read_to_string(path).map_err(|e| PersistenceError::io(path, e))?;
    let session =
        ReconstructionSession::from_json(&json).map_err(|source| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(
        "loaded session at iteration {} from {}",
        session.iteration(),
        path.display()
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CorruptSessionError;
    use crate::session::LogEntry;
    use crate::session::tests::sample_session;

    #[test]
    fn save_then_load_reproduces_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("checkpoints")).with_prefix("scan");
        let session = sample_session();

        let location = store.save(&session).unwrap();
        assert_eq!(location, dir.path().join("checkpoints/scan-00000002.json"));
        let loaded = store.load(&location).unwrap();
        assert_eq!(loaded, session);

        // No temporary files are left behind.
        let entries = fs::read_dir(store.directory()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn overwrite_replaces_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let mut session = sample_session();
        save_session(&path, &session).unwrap();
        session
            .log
            .push(LogEntry::success_with_notes("run", "completed"));
        save_session(&path, &session).unwrap();
        assert_eq!(load_session(&path).unwrap().log.len(), 2);
    }

    #[test]
    fn corrupt_file_fails_and_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        let garbage = b"{\"metadata\": {\"schema_version\": 1}, \"state\": [";
        fs::write(&path, garbage).unwrap();

        let err = load_session(&path).unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Corrupt {
                source: CorruptSessionError::Malformed(_),
                ..
            }
        ));
        assert_eq!(fs::read(&path).unwrap(), garbage);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_session(&dir.path().join("absent.json")),
            Err(PersistenceError::Io { .. })
        ));
    }
}

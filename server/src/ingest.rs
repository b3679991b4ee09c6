//! The seam between the upload transport and the arena.
//!
//! The transport (SCP/SFTP over SSH, or the admin HTTP endpoint) does
//! authentication and hands validated `(username, filename, bytes)` tuples
//! to [`Ingest::accept`]. Whose name goes in `username` is the transport's
//! privilege decision; nothing here consults any admin state.

use std::sync::OnceLock;
use std::sync::mpsc::Sender;

use regex::Regex;
use thiserror::Error;
use tracing::{info, instrument};

use crate::artifacts::{ArtifactStore, submission_prefix};
use crate::store::Store;

/// Why an upload was rejected.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The filename does not follow the submission convention.
    #[error("only memory_functions_<name>.cpp files are accepted")]
    InvalidFilename,
    /// The username cannot be used as a path component.
    #[error("invalid username")]
    InvalidUsername,
    /// Storage failed; the upload may be retried.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Accepts uploads: writes the canonical copy, rotates the user's active
/// submission and signals the worker.
pub struct Ingest {
    store: Store,
    artifacts: ArtifactStore,
    wake_worker: Sender<()>,
}

impl Ingest {
    pub fn new(store: Store, artifacts: ArtifactStore, wake_worker: Sender<()>) -> Self {
        Ingest {
            store,
            artifacts,
            wake_worker,
        }
    }

    /// Accept one completed upload. Returns the new submission id.
    ///
    /// On success the user's previous submission is deactivated and all its
    /// matches invalidated, atomically; the new submission is queued as
    /// pending and the worker is woken.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub fn accept(
        &self,
        username: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<i64, IngestError> {
        if !valid_username(username) {
            return Err(IngestError::InvalidUsername);
        }
        if submission_prefix(filename).is_none() {
            return Err(IngestError::InvalidFilename);
        }

        self.artifacts
            .write_canonical(username, filename, bytes)
            .map_err(IngestError::Internal)?;
        let id = self.store.ingest_submission(username, filename)?;
        info!("queued submission {id} for testing ({username}/{filename})");

        // The worker also polls on a tick; a closed channel only means it
        // already stopped.
        let _ = self.wake_worker.send(());
        Ok(id)
    }
}

/// Usernames come from the authenticated transport but still become path
/// components, so only word characters pass.
fn valid_username(username: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\w+$").unwrap());
    re.is_match(username)
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn ingest() -> (Ingest, mpsc::Receiver<()>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let artifacts = ArtifactStore::new(tmp.path().join("uploads"), tmp.path().join("engine"));
        artifacts.ensure_layout().unwrap();
        let (tx, rx) = mpsc::channel();
        (Ingest::new(store, artifacts, tx), rx, tmp)
    }

    #[test]
    fn accepts_conventional_upload_and_wakes_worker() {
        let (ingest, rx, tmp) = ingest();
        let id = ingest
            .accept("alice", "memory_functions_alice.cpp", b"void initMemoryAlice();")
            .unwrap();
        assert!(id > 0);
        assert!(rx.try_recv().is_ok());
        assert!(tmp
            .path()
            .join("uploads/alice/memory_functions_alice.cpp")
            .exists());
    }

    #[test]
    fn rejects_bad_filename_without_state_changes() {
        let (ingest, rx, tmp) = ingest();
        let err = ingest.accept("alice", "main.cpp", b"").unwrap_err();
        assert!(matches!(err, IngestError::InvalidFilename));
        assert!(rx.try_recv().is_err());
        assert!(!tmp.path().join("uploads/alice").exists());
    }

    #[test]
    fn rejects_path_traversal_username() {
        let (ingest, _rx, _tmp) = ingest();
        let err = ingest
            .accept("../evil", "memory_functions_evil.cpp", b"")
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidUsername));
    }

    #[test]
    fn reupload_overwrites_canonical_copy() {
        let (ingest, _rx, tmp) = ingest();
        ingest
            .accept("alice", "memory_functions_alice.cpp", b"first")
            .unwrap();
        ingest
            .accept("alice", "memory_functions_alice.cpp", b"second")
            .unwrap();
        let content =
            std::fs::read(tmp.path().join("uploads/alice/memory_functions_alice.cpp")).unwrap();
        assert_eq!(content, b"second");
    }
}

//! Hand-off of finished sessions to durable storage.
//!
//! The coordinator itself keeps nothing once a session ends; whatever an
//! archive does with a [`FinishedSession`] is its own business.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use strokesync_store::{SessionId, SessionSnapshot};
use strokesync_wire::SessionLogProto;
use tracing::{debug, warn};

use crate::EndReason;

/// Everything known about a session at termination.
#[derive(Debug, Clone)]
pub struct FinishedSession {
    pub snapshot: Arc<SessionSnapshot>,
    pub end_reason: EndReason,
    pub log: SessionLogProto,
}

impl FinishedSession {
    pub fn session_id(&self) -> SessionId {
        self.snapshot.session_id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait SessionArchive: Send + Sync {
    async fn store(&self, finished: FinishedSession) -> Result<(), ArchiveError>;
}

/// Discards finished sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullArchive;

#[async_trait]
impl SessionArchive for NullArchive {
    async fn store(&self, finished: FinishedSession) -> Result<(), ArchiveError> {
        debug!(session_id = finished.session_id(), "archive disabled, dropping session");
        Ok(())
    }
}

/// Keeps finished sessions in memory.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    sessions: Mutex<Vec<FinishedSession>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> Vec<FinishedSession> {
        self.sessions.lock().clone()
    }

    pub fn get(&self, session_id: SessionId) -> Option<FinishedSession> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.session_id() == session_id)
            .cloned()
    }
}

#[async_trait]
impl SessionArchive for MemoryArchive {
    async fn store(&self, finished: FinishedSession) -> Result<(), ArchiveError> {
        self.sessions.lock().push(finished);
        Ok(())
    }
}

/// Writes each session log to `<dir>/session-<id>.sslog`.
#[derive(Debug, Clone)]
pub struct FileArchive {
    dir: PathBuf,
}

impl FileArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: SessionId) -> PathBuf {
        self.dir.join(format!("session-{session_id}.sslog"))
    }
}

#[async_trait]
impl SessionArchive for FileArchive {
    async fn store(&self, finished: FinishedSession) -> Result<(), ArchiveError> {
        let path = self.path_for(finished.session_id());
        let log = finished.log;
        let written = path.clone();
        tokio::task::spawn_blocking(move || strokesync_replay::write_log(&log, &path))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))??;
        debug!(path = %written.display(), "session log archived");
        Ok(())
    }
}

/// Hands each finished session to every inner archive, in order.
///
/// A failing archive does not stop the others; the first error is returned.
pub struct TeeArchive {
    archives: Vec<Arc<dyn SessionArchive>>,
}

impl TeeArchive {
    pub fn new(archives: Vec<Arc<dyn SessionArchive>>) -> Self {
        Self { archives }
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }
}

impl std::fmt::Debug for TeeArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeeArchive")
            .field("archives", &self.archives.len())
            .finish()
    }
}

#[async_trait]
impl SessionArchive for TeeArchive {
    async fn store(&self, finished: FinishedSession) -> Result<(), ArchiveError> {
        let mut first_error = None;
        for archive in &self.archives {
            if let Err(err) = archive.store(finished.clone()).await {
                warn!(session_id = finished.session_id(), error = %err, "archive failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

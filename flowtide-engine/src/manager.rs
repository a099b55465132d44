//! Registry of import sessions, keyed by session id.
//!
//! At most one session per capture id runs at a time. Finished sessions stay
//! listed so their status can still be queried, up to
//! `session.retained_sessions`; older ones are forgotten here and remain in
//! the `sessions` collection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use flowtide_capture::{CaptureFile, PacketSource};
use parking_lot::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::error::EngineError;
use crate::session::status::SessionStatus;
use crate::session::{ImportSession, SessionHandle};

pub struct SessionManager {
    app: Arc<AppContext>,
    retained: usize,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(app: Arc<AppContext>) -> Self {
        Self {
            retained: app.config().session.retained_sessions,
            app,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }

    /// Starts importing `source` with the current settings.
    pub fn start_import<S>(&self, source: S) -> Result<SessionHandle, EngineError>
    where
        S: PacketSource + 'static,
    {
        let context = self.app.context()?;
        let mut sessions = self.sessions.lock();
        let capture_id = source.capture_id().to_string();
        if sessions
            .values()
            .any(|s| s.capture_id() == capture_id && !s.is_finished())
        {
            warn!(%capture_id, "Capture is already being imported");
            return Err(EngineError::AlreadyImporting(capture_id));
        }

        let handle = ImportSession::start(context, source);
        info!(session_id = handle.id(), %capture_id, "Import registered");
        sessions.insert(handle.id().to_string(), handle.clone());
        prune(self.retained, &mut sessions);
        Ok(handle)
    }

    /// Opens a capture file off the async runtime, then imports it.
    pub async fn start_file_import(&self, path: impl Into<PathBuf>) -> Result<SessionHandle, EngineError> {
        self.app.context()?;
        let path = path.into();
        let file = spawn_blocking(move || CaptureFile::open(path)).await??;
        self.start_import(file)
    }

    pub fn cancel(&self, session_id: &str) -> Result<(), EngineError> {
        self.handle(session_id)?.cancel();
        Ok(())
    }

    pub fn status(&self, session_id: &str) -> Result<SessionStatus, EngineError> {
        Ok(self.handle(session_id)?.status())
    }

    pub async fn wait(&self, session_id: &str) -> Result<SessionStatus, EngineError> {
        let handle = self.handle(session_id)?;
        handle.wait().await
    }

    /// Snapshots of every known session, oldest first.
    pub fn list(&self) -> Vec<SessionStatus> {
        let mut all: Vec<SessionStatus> = self.sessions.lock().values().map(SessionHandle::status).collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    fn handle(&self, session_id: &str) -> Result<SessionHandle, EngineError> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }
}

/// Drops the oldest finished sessions beyond `retained`.
fn prune(retained: usize, sessions: &mut HashMap<String, SessionHandle>) {
    let mut finished: Vec<SessionStatus> = sessions
        .values()
        .filter(|s| s.is_finished())
        .map(SessionHandle::status)
        .collect();
    if finished.len() <= retained {
        return;
    }
    finished.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    let excess = finished.len() - retained;
    for status in finished.into_iter().take(excess) {
        debug!(session_id = %status.session_id, "Finished session forgotten");
        sessions.remove(&status.session_id);
    }
}

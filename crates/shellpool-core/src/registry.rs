//! Tracking of the sessions of one conversation scope.
//!
//! The registry lock is never held across backend I/O. Operations copy what
//! they need out as a [`Lease`], talk to the backend, then re-validate before
//! writing results back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use shellpool_sandbox::Sandbox;

use crate::background::BackgroundTracker;
use crate::backend::{AnyBackend, BackendKind, SessionHandle, ShellBackend};
use crate::config::Config;
use crate::error::ShellError;
use crate::event::ShellEventTx;
use crate::session::{Lease, PendingCommand, Session, SessionInfo, SessionState};

pub const DEFAULT_LABEL: &str = "main";
const MAX_LABEL_ATTEMPTS: usize = 32;

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<String, Session>,
    /// Labels whose sessions are being created right now.
    reserved: HashSet<String>,
}

impl RegistryState {
    fn label_taken(&self, label: &str) -> bool {
        self.reserved.contains(label) || self.sessions.values().any(|s| s.label == label)
    }

    /// `label`, or the first free `label-N`.
    fn free_label(&self, label: &str, skipped: &HashSet<String>) -> Option<String> {
        std::iter::once(label.to_owned())
            .chain((2..).map(|n| format!("{label}-{n}")))
            .take(MAX_LABEL_ATTEMPTS)
            .find(|candidate| !self.label_taken(candidate) && !skipped.contains(candidate))
    }
}

type Reaper = Box<dyn Fn(u32) -> bool + Send + Sync>;

/// Sessions of one conversation scope.
///
/// Call [`shutdown`](Self::shutdown) when the scope ends. Dropping the registry
/// instead only kills native shells, best effort; tmux sessions outlive it.
pub struct SessionRegistry<S> {
    scope: String,
    backend: AnyBackend<S>,
    sandbox: Arc<S>,
    state: Mutex<RegistryState>,
    background: BackgroundTracker,
    reap: Reaper,
}

impl<S> std::fmt::Debug for SessionRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("scope", &self.scope)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl<S: Sandbox> SessionRegistry<S> {
    /// # Errors
    ///
    /// Returns an error if the configured backend cannot run on `sandbox`.
    pub fn new(
        scope: impl Into<String>,
        sandbox: Arc<S>,
        config: &Config,
    ) -> Result<Self, ShellError> {
        let backend = AnyBackend::select(Arc::clone(&sandbox), &config.shell, &config.retry)?;
        Ok(Self::with_backend(scope, sandbox, backend))
    }

    #[must_use]
    pub fn with_backend(scope: impl Into<String>, sandbox: Arc<S>, backend: AnyBackend<S>) -> Self {
        let reaper = Arc::clone(&sandbox);
        Self {
            scope: scope.into(),
            backend,
            sandbox,
            state: Mutex::new(RegistryState::default()),
            background: BackgroundTracker::default(),
            reap: Box::new(move |pid| reaper.pty_kill_now(pid)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn backend(&self) -> &AnyBackend<S> {
        &self.backend
    }

    #[must_use]
    pub fn sandbox(&self) -> &Arc<S> {
        &self.sandbox
    }

    #[must_use]
    pub fn background(&self) -> &BackgroundTracker {
        &self.background
    }

    /// Rebase the shell's output and return the new baseline offset.
    async fn baseline(&self, handle: &SessionHandle) -> Result<usize, ShellError> {
        self.backend.rebase(handle).await?;
        let capture = self.backend.capture(handle).await?;
        if capture.ended {
            return Err(ShellError::SessionNotFound {
                session_id: handle.id.clone(),
            });
        }
        Ok(capture.text.len())
    }

    /// Take an idle session labelled `label` for a new command, creating one
    /// if none is free. A busy label gets an auto-suffixed sibling.
    ///
    /// The returned session is busy and in flight; hand it back with
    /// [`Self::release`], [`Self::suspend`] or [`Self::complete`].
    ///
    /// # Errors
    ///
    /// Returns backend errors from creating or rebasing the shell.
    pub async fn acquire(&self, label: &str) -> Result<Lease, ShellError> {
        loop {
            let idle = {
                let mut state = self.lock();
                state
                    .sessions
                    .values_mut()
                    .find(|s| s.label == label && s.is_idle())
                    .map(|session| {
                        session.state = SessionState::Busy;
                        session.in_flight = true;
                        session.handle.clone()
                    })
            };
            let Some(handle) = idle else {
                return self.create(label).await;
            };

            match self.baseline(&handle).await {
                Ok(cursor) => {
                    let mut state = self.lock();
                    if let Some(session) = state.sessions.get_mut(&handle.id) {
                        session.output_cursor = cursor;
                        tracing::debug!(session_id = %handle.id, label, "reusing idle session");
                        return Ok(session.lease());
                    }
                }
                Err(ShellError::SessionNotFound { .. }) => {
                    tracing::warn!(session_id = %handle.id, "idle session vanished, dropping it");
                    self.remove(&handle.id);
                }
                Err(e) => {
                    self.release(&handle.id);
                    return Err(e);
                }
            }
        }
    }

    async fn create(&self, label: &str) -> Result<Lease, ShellError> {
        let mut skipped = HashSet::new();
        loop {
            let candidate = {
                let mut state = self.lock();
                let candidate = state.free_label(label, &skipped).ok_or_else(|| {
                    ShellError::SessionBusy {
                        session_id: label.to_owned(),
                    }
                })?;
                state.reserved.insert(candidate.clone());
                candidate
            };

            let created = self.backend.create(&self.scope, &candidate).await;
            let prepared = match created {
                Ok(handle) => self.baseline(&handle).await.map(|cursor| (handle, cursor)),
                Err(e) => Err(e),
            };

            let mut state = self.lock();
            state.reserved.remove(&candidate);
            match prepared {
                Ok((handle, cursor)) => {
                    tracing::info!(session_id = %handle.id, label = %candidate, "session created");
                    let mut session = Session::new(candidate, handle, cursor);
                    session.state = SessionState::Busy;
                    session.in_flight = true;
                    let lease = session.lease();
                    state.sessions.insert(session.id.clone(), session);
                    return Ok(lease);
                }
                Err(ShellError::SessionBusy { session_id }) => {
                    tracing::debug!(%session_id, "label occupied on the backend, trying next");
                    skipped.insert(candidate);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Make a tracked session available again. Refused while a command is pending.
    pub fn release(&self, session_id: &str) {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(session_id) else {
            return;
        };
        session.in_flight = false;
        session.stream_sink = None;
        if session.pending.is_some() {
            tracing::warn!(session_id, "refusing to release session with a pending command");
            return;
        }
        session.state = SessionState::Idle;
    }

    /// Leave a timed-out command pending; a later wait picks it up.
    pub fn suspend(&self, session_id: &str, pending: PendingCommand, cursor: usize) {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.state = SessionState::Busy;
            session.in_flight = false;
            session.stream_sink = None;
            session.output_cursor = cursor;
            session.pending = Some(pending);
        }
    }

    /// Record that the pending command finished and free the session.
    pub fn complete(&self, session_id: &str, cursor: usize) {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.pending = None;
            session.output_cursor = cursor;
            session.in_flight = false;
            session.stream_sink = None;
            session.state = SessionState::Idle;
        }
    }

    /// Drop the pending command and free the session regardless of what still runs.
    pub fn abandon(&self, session_id: &str) {
        let mut state = self.lock();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.pending = None;
        }
        drop(state);
        self.release(session_id);
    }

    pub fn set_cursor(&self, session_id: &str, cursor: usize) {
        if let Some(session) = self.lock().sessions.get_mut(session_id) {
            session.output_cursor = cursor;
        }
    }

    /// Register the live-output receiver for a session, replacing any previous one.
    pub fn set_stream_sink(&self, session_id: &str, sink: Option<ShellEventTx>) {
        if let Some(session) = self.lock().sessions.get_mut(session_id) {
            session.stream_sink = sink;
        }
    }

    #[must_use]
    pub fn stream_sink(&self, session_id: &str) -> Option<ShellEventTx> {
        self.lock()
            .sessions
            .get(session_id)
            .and_then(|s| s.stream_sink.clone())
    }

    /// Claim a session for polling. Reconnects untracked sessions first.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the session cannot be found or reattached,
    /// `SessionBusy` if another exec or wait is already polling it.
    pub async fn begin_poll(&self, session_id: &str) -> Result<Lease, ShellError> {
        self.ensure_tracked(session_id).await?;
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ShellError::SessionNotFound {
                session_id: session_id.to_owned(),
            })?;
        if session.in_flight {
            return Err(ShellError::SessionBusy {
                session_id: session_id.to_owned(),
            });
        }
        session.in_flight = true;
        Ok(session.lease())
    }

    /// Current state of a session without claiming it. Reconnects untracked sessions.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the session cannot be found or reattached.
    pub async fn lease(&self, session_id: &str) -> Result<Lease, ShellError> {
        self.ensure_tracked(session_id).await?;
        self.lock()
            .sessions
            .get(session_id)
            .map(Session::lease)
            .ok_or_else(|| ShellError::SessionNotFound {
                session_id: session_id.to_owned(),
            })
    }

    async fn ensure_tracked(&self, session_id: &str) -> Result<(), ShellError> {
        if self.reconnect(session_id).await? {
            Ok(())
        } else {
            Err(ShellError::SessionNotFound {
                session_id: session_id.to_owned(),
            })
        }
    }

    /// Re-attach to a shell the backend still runs but this registry does not
    /// track, without disturbing its state. Returns `false` if it is gone.
    ///
    /// # Errors
    ///
    /// Returns backend errors other than the session being absent.
    pub async fn reconnect(&self, session_id: &str) -> Result<bool, ShellError> {
        if self.lock().sessions.contains_key(session_id) {
            return Ok(true);
        }
        let Some(handle) = self.backend.attach(&self.scope, session_id).await? else {
            return Ok(false);
        };
        let capture = self.backend.capture(&handle).await?;
        if capture.ended {
            return Ok(false);
        }

        let mut state = self.lock();
        if !state.sessions.contains_key(session_id) {
            tracing::info!(session_id, "reconnected to untracked session");
            let session = Session::new(session_id, handle, capture.text.len());
            state.sessions.insert(session_id.to_owned(), session);
        }
        Ok(true)
    }

    /// Stop tracking a session. The shell itself is left alone.
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let removed = self.lock().sessions.remove(session_id);
        if removed.is_some() {
            self.background.forget_session(session_id);
        }
        removed
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.lock().sessions.values().map(SessionInfo::from).collect();
        sessions.sort_by(|a, b| a.label.cmp(&b.label));
        sessions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every tracked shell.
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = self.lock().sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.background.forget_session(&session.id);
            match self.backend.kill(&session.handle).await {
                Ok(killed) => tracing::debug!(session_id = %session.id, killed, "session shut down"),
                Err(e) => tracing::warn!(session_id = %session.id, "failed to kill session: {e}"),
            }
        }
    }
}

impl<S> Drop for SessionRegistry<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let native: Vec<u32> = state
            .sessions
            .values()
            .filter(|s| s.handle.kind == BackendKind::Native)
            .filter_map(|s| s.handle.shell_pid)
            .collect();
        if native.is_empty() {
            return;
        }
        tracing::warn!(
            scope = %self.scope,
            sessions = native.len(),
            "registry dropped without shutdown, killing native shells"
        );
        for pid in native {
            (self.reap)(pid);
        }
    }
}

use std::time::Instant;

use serde::Serialize;

use crate::backend::SessionHandle;
use crate::event::ShellEventTx;
use crate::sentinel::Sentinel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Busy,
}

/// A submitted command whose completion line has not been seen yet.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub sentinel: Sentinel,
    pub command: String,
    pub correlation_id: String,
    pub started: Instant,
}

/// One persistent shell and what the registry knows about it.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub label: String,
    pub handle: SessionHandle,
    pub state: SessionState,
    /// An exec or wait is currently polling this session.
    pub in_flight: bool,
    /// Offset into the captured output up to which output has been delivered.
    pub output_cursor: usize,
    pub pending: Option<PendingCommand>,
    pub stream_sink: Option<ShellEventTx>,
}

impl Session {
    #[must_use]
    pub fn new(label: impl Into<String>, handle: SessionHandle, output_cursor: usize) -> Self {
        Self {
            id: handle.id.clone(),
            label: label.into(),
            handle,
            state: SessionState::Idle,
            in_flight: false,
            output_cursor,
            pending: None,
            stream_sink: None,
        }
    }

    /// Available for a new command.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle && !self.in_flight && self.pending.is_none()
    }

    pub(crate) fn lease(&self) -> Lease {
        Lease {
            session_id: self.id.clone(),
            handle: self.handle.clone(),
            cursor: self.output_cursor,
            pending: self.pending.clone(),
            in_flight: self.in_flight,
        }
    }
}

/// Copy of a session's state handed to an operation working outside the registry lock.
#[derive(Debug, Clone)]
pub struct Lease {
    pub session_id: String,
    pub handle: SessionHandle,
    pub cursor: usize,
    pub pending: Option<PendingCommand>,
    pub in_flight: bool,
}

/// Public summary of a tracked session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub label: String,
    pub state: SessionState,
    pub running: Option<String>,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            label: session.label.clone(),
            state: session.state,
            running: session.pending.as_ref().map(|p| p.command.clone()),
        }
    }
}

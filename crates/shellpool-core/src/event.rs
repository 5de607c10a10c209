/// Live progress of a shell call, delivered out of band for UI or transcript layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Started {
        correlation_id: String,
        session_id: String,
        command: String,
    },
    OutputChunk {
        correlation_id: String,
        session_id: String,
        chunk: String,
    },
    /// Replaces everything streamed so far for this call.
    OutputReset {
        correlation_id: String,
        session_id: String,
        output: String,
    },
    Completed {
        correlation_id: String,
        session_id: String,
        exit_code: Option<i32>,
        timed_out: bool,
        aborted: bool,
    },
}

impl ShellEvent {
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Started { correlation_id, .. }
            | Self::OutputChunk { correlation_id, .. }
            | Self::OutputReset { correlation_id, .. }
            | Self::Completed { correlation_id, .. } => correlation_id,
        }
    }
}

pub type ShellEventTx = tokio::sync::mpsc::UnboundedSender<ShellEvent>;

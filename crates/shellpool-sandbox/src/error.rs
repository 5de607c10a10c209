#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The request never reached the environment.
    #[error("sandbox connection failed: {message}")]
    Transient { message: String },

    #[error("command did not finish within {timeout_secs}s")]
    TimedOut { timeout_secs: u64 },

    #[error("no pty with pid {pid}")]
    PtyNotFound { pid: u32 },

    #[error("native pty sessions are not supported by this sandbox")]
    Unsupported,

    #[error("pty failure: {0}")]
    Pty(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether repeating the request may succeed.
    ///
    /// I/O resets can surface after the request already took effect; use
    /// [`is_undelivered`](Self::is_undelivered) before repeating writes.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Whether the request certainly never reached the environment, so repeating
    /// it cannot act twice.
    #[must_use]
    pub fn is_undelivered(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

use shellpool_sandbox::SandboxError;

/// Failures surfaced by shell session operations.
///
/// A timed-out or aborted command is not an error; those are reported as
/// fields on the result.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("command blocked by policy {policy}: {message}")]
    GuardrailBlocked { policy: String, message: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session {session_id} is already being waited on")]
    SessionBusy { session_id: String },

    #[error("no foreground process is running in session {session_id}")]
    NoForegroundProcess { session_id: String },

    #[error("transient backend failure: {message}")]
    Transient { message: String },

    #[error("shell backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("multiplexer command failed: {message}")]
    Multiplexer { message: String },

    #[error("backend error: {0}")]
    Backend(#[from] SandboxError),

    #[error("invalid parameters: {message}")]
    InvalidParams { message: String },
}

impl ShellError {
    /// Whether repeating the failed operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Backend(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the failed request certainly never reached the shell. Input is
    /// only ever resent under this condition.
    #[must_use]
    pub fn is_undelivered(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_undelivered(),
            _ => false,
        }
    }

    /// Stable machine-readable name used in structured error replies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GuardrailBlocked { .. } => "guardrail_blocked",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::SessionBusy { .. } => "session_busy",
            Self::NoForegroundProcess { .. } => "no_foreground_process",
            Self::Transient { .. } => "transient_backend_error",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::Multiplexer { .. } | Self::Backend(_) => "backend_error",
            Self::InvalidParams { .. } => "invalid_params",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ShellError::GuardrailBlocked {
            policy: "mkfs".into(),
            message: "formatting filesystems is not allowed".into(),
        };
        assert_eq!(
            err.to_string(),
            "command blocked by policy mkfs: formatting filesystems is not allowed"
        );
        assert_eq!(
            ShellError::SessionNotFound {
                session_id: "42".into()
            }
            .to_string(),
            "session not found: 42"
        );
    }

    #[test]
    fn only_transient_failures_retry() {
        assert!(
            ShellError::Transient {
                message: "reset".into()
            }
            .is_transient()
        );
        assert!(
            ShellError::Backend(SandboxError::Transient {
                message: "reset".into()
            })
            .is_transient()
        );
        assert!(
            !ShellError::BackendUnavailable {
                message: "no tmux".into()
            }
            .is_transient()
        );
        assert!(
            !ShellError::SessionNotFound {
                session_id: "x".into()
            }
            .is_transient()
        );
        assert!(!ShellError::Backend(SandboxError::Unsupported).is_transient());
    }

    #[test]
    fn late_resets_are_not_undelivered() {
        let reset = ShellError::Backend(SandboxError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        )));
        assert!(reset.is_transient());
        assert!(!reset.is_undelivered());
        assert!(
            ShellError::Backend(SandboxError::Transient {
                message: "refused".into()
            })
            .is_undelivered()
        );
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            ShellError::NoForegroundProcess {
                session_id: "a".into()
            }
            .kind(),
            "no_foreground_process"
        );
        assert_eq!(
            ShellError::Backend(SandboxError::Unsupported).kind(),
            "backend_error"
        );
    }
}

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::guardrail::PolicyRule;

fn default_true() -> bool {
    true
}

fn default_shell() -> String {
    "bash".into()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stream_interval_ms() -> u64 {
    400
}

fn default_settle_delay_ms() -> u64 {
    300
}

fn default_bootstrap_timeout_secs() -> u64 {
    10
}

fn default_history_limit() -> u32 {
    50_000
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_interrupt_delay_ms() -> u64 {
    300
}

fn default_audit_destination() -> String {
    "stdout".into()
}

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub terminate: TerminateConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Which execution mechanism hosts the sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Native PTY when the sandbox supports it, tmux otherwise.
    #[default]
    Auto,
    Native,
    Multiplexer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub backend: BackendChoice,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stream_interval_ms")]
    pub stream_interval_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_bootstrap_timeout_secs")]
    pub bootstrap_timeout_secs: u64,
    /// Scrollback lines kept by multiplexer sessions.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::default(),
            shell: default_shell(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            stream_interval_ms: default_stream_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            bootstrap_timeout_secs: default_bootstrap_timeout_secs(),
            history_limit: default_history_limit(),
        }
    }
}

impl ShellConfig {
    /// Resolve a caller-supplied timeout, clamped to `max_timeout_secs`.
    #[must_use]
    pub fn effective_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let requested = requested_secs.unwrap_or(self.default_timeout_secs);
        if requested > self.max_timeout_secs {
            tracing::warn!(
                requested,
                max = self.max_timeout_secs,
                "timeout exceeds maximum, clamping"
            );
            return Duration::from_secs(self.max_timeout_secs);
        }
        Duration::from_secs(requested)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    #[must_use]
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }
}

/// Safety policies evaluated before any command reaches a session.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default = "default_true")]
    pub use_defaults: bool,
    /// Names of built-in policies to disable.
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub policies_file: Option<PathBuf>,
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            use_defaults: true,
            allowed: Vec::new(),
            policies_file: None,
            policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminateConfig {
    #[serde(default = "default_interrupt_delay_ms")]
    pub interrupt_delay_ms: u64,
}

impl Default for TerminateConfig {
    fn default() -> Self {
        Self {
            interrupt_delay_ms: default_interrupt_delay_ms(),
        }
    }
}

impl TerminateConfig {
    #[must_use]
    pub fn interrupt_delay(&self) -> Duration {
        Duration::from_millis(self.interrupt_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `stdout` or a file path opened in append mode.
    #[serde(default = "default_audit_destination")]
    pub destination: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: default_audit_destination(),
        }
    }
}

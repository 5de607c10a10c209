mod env;
mod types;


pub use types::*;

use std::path::Path;

use anyhow::Context;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error describing the first inconsistent setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        let shell = &self.shell;
        if shell.poll_interval_ms == 0 {
            anyhow::bail!("shell.poll_interval_ms must be greater than zero");
        }
        if shell.max_timeout_secs == 0 {
            anyhow::bail!("shell.max_timeout_secs must be greater than zero");
        }
        if shell.default_timeout_secs > shell.max_timeout_secs {
            anyhow::bail!(
                "shell.default_timeout_secs ({}) exceeds shell.max_timeout_secs ({})",
                shell.default_timeout_secs,
                shell.max_timeout_secs
            );
        }
        if shell.shell.trim().is_empty() {
            anyhow::bail!("shell.shell must not be empty");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.base_delay_ms exceeds retry.max_delay_ms");
        }
        Ok(())
    }
}

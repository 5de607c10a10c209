use super::Config;

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SHELLPOOL_BACKEND") {
            if let Ok(choice) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.shell.backend = choice;
            } else {
                tracing::warn!("ignoring invalid SHELLPOOL_BACKEND value: {v}");
            }
        }
        if let Ok(v) = std::env::var("SHELLPOOL_SHELL")
            && !v.trim().is_empty()
        {
            self.shell.shell = v;
        }
        if let Ok(v) = std::env::var("SHELLPOOL_DEFAULT_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                self.shell.default_timeout_secs = secs;
            } else {
                tracing::warn!("ignoring invalid SHELLPOOL_DEFAULT_TIMEOUT value: {v}");
            }
        }
        if let Ok(v) = std::env::var("SHELLPOOL_MAX_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                self.shell.max_timeout_secs = secs;
            } else {
                tracing::warn!("ignoring invalid SHELLPOOL_MAX_TIMEOUT value: {v}");
            }
        }
        if let Ok(v) = std::env::var("SHELLPOOL_GUARDRAILS_FILE") {
            self.guardrails.policies_file = Some(v.into());
        }
        if let Ok(v) = std::env::var("SHELLPOOL_AUDIT_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.audit.enabled = enabled;
        }
        if let Ok(v) = std::env::var("SHELLPOOL_AUDIT_DESTINATION") {
            self.audit.destination = v;
        }
    }
}

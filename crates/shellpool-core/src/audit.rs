use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::AuditConfig;

/// JSON-lines record of every command the session pool was asked to run or kill.
#[derive(Debug)]
pub struct AuditLogger {
    destination: AuditDestination,
}

#[derive(Debug)]
enum AuditDestination {
    Stdout,
    File(tokio::sync::Mutex<tokio::fs::File>),
}

#[derive(Debug, serde::Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub action: &'static str,
    pub session_id: Option<String>,
    pub command: String,
    pub result: AuditResult,
    pub duration_ms: u64,
}

impl AuditEntry {
    #[must_use]
    pub fn new(action: &'static str, command: impl Into<String>, result: AuditResult) -> Self {
        Self {
            timestamp: unix_timestamp(),
            action,
            session_id: None,
            command: command.into(),
            result,
            duration_ms: 0,
        }
    }

    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn duration(mut self, elapsed: std::time::Duration) -> Self {
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "type")]
pub enum AuditResult {
    #[serde(rename = "completed")]
    Completed { exit_code: i32 },
    #[serde(rename = "blocked")]
    Blocked { policy: String, reason: String },
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "aborted")]
    Aborted { may_still_run: bool },
    #[serde(rename = "killed")]
    Killed { killed: bool },
    #[serde(rename = "error")]
    Error { message: String },
}

fn unix_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{secs}")
}

impl AuditLogger {
    /// Create a new `AuditLogger` from config.
    ///
    /// # Errors
    ///
    /// Returns an error if a file destination cannot be opened.
    pub async fn from_config(config: &AuditConfig) -> Result<Self, std::io::Error> {
        let destination = if config.destination == "stdout" {
            AuditDestination::Stdout
        } else {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(&config.destination))
                .await?;
            AuditDestination::File(tokio::sync::Mutex::new(file))
        };

        Ok(Self { destination })
    }

    pub async fn log(&self, entry: &AuditEntry) {
        let Ok(json) = serde_json::to_string(entry) else {
            return;
        };

        match &self.destination {
            AuditDestination::Stdout => {
                tracing::info!(target: "audit", "{json}");
            }
            AuditDestination::File(file) => {
                use tokio::io::AsyncWriteExt;
                let mut f = file.lock().await;
                let line = format!("{json}\n");
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    tracing::error!("failed to write audit log: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_entry_serialization() {
        let entry = AuditEntry::new("exec", "echo hi", AuditResult::Completed { exit_code: 0 })
            .session("4242")
            .duration(std::time::Duration::from_millis(42));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"completed\""));
        assert!(json.contains("\"exit_code\":0"));
        assert!(json.contains("\"session_id\":\"4242\""));
        assert!(json.contains("\"duration_ms\":42"));
    }

    #[test]
    fn blocked_entry_serialization() {
        let entry = AuditEntry::new(
            "exec",
            "mkfs /dev/sda",
            AuditResult::Blocked {
                policy: "mkfs".into(),
                reason: "formatting filesystems is not allowed".into(),
            },
        );
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"blocked\""));
        assert!(json.contains("\"policy\":\"mkfs\""));
        assert!(json.contains("\"session_id\":null"));
    }

    #[test]
    fn timestamp_is_unix_seconds() {
        let ts = unix_timestamp();
        let parsed: u64 = ts.parse().unwrap();
        assert!(parsed > 0);
    }

    #[tokio::test]
    async fn logger_stdout() {
        let config = AuditConfig {
            enabled: true,
            destination: "stdout".into(),
        };
        let logger = AuditLogger::from_config(&config).await.unwrap();
        logger
            .log(&AuditEntry::new("kill", "", AuditResult::Killed { killed: true }))
            .await;
    }

    #[tokio::test]
    async fn logger_appends_lines_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let config = AuditConfig {
            enabled: true,
            destination: path.display().to_string(),
        };
        let logger = AuditLogger::from_config(&config).await.unwrap();
        logger
            .log(&AuditEntry::new("exec", "sleep 10", AuditResult::Timeout))
            .await;
        logger
            .log(&AuditEntry::new(
                "exec",
                "sleep 30",
                AuditResult::Aborted {
                    may_still_run: false,
                },
            ))
            .await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"type\":\"timeout\""));
        assert!(lines[1].contains("\"type\":\"aborted\""));
    }

    #[tokio::test]
    async fn logger_rejects_unwritable_destination() {
        let config = AuditConfig {
            enabled: true,
            destination: "/nonexistent/dir/audit.log".into(),
        };
        assert!(AuditLogger::from_config(&config).await.is_err());
    }
}

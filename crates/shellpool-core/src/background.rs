//! Tracking of jobs a session started with `&`, and of the files they write.

use std::path::{Component, Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use regex::Regex;
use shellpool_sandbox::{RunOptions, Sandbox};

use crate::error::ShellError;

static REDIRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:[12&])?>>?\s*(&?)([^\s;|&<>()]+)"#).unwrap());

static JOB_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\[\d+\]\s+(\d+)\s*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundProcessRecord {
    pub pid: u32,
    pub command: String,
    pub output_files: Vec<String>,
    pub session_id: String,
}

fn unquote(token: &str) -> &str {
    token.trim_matches(|c| c == '\'' || c == '"')
}

fn is_output_target(path: &str) -> bool {
    !path.is_empty() && !path.starts_with("/dev/")
}

/// Files the command writes through `>`, `>>`, `2>`, `&>` or `tee`.
#[must_use]
pub fn extract_output_files(command: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let mut push = |path: &str| {
        if is_output_target(path) && !files.iter().any(|f| f == path) {
            files.push(path.to_owned());
        }
    };

    for caps in REDIRECT_RE.captures_iter(command) {
        // `2>&1` duplicates a descriptor rather than naming a file
        if &caps[1] == "&" {
            continue;
        }
        push(unquote(&caps[2]));
    }

    for segment in command.split(['|', ';', '&']) {
        let mut tokens = segment.split_whitespace();
        let is_tee = tokens
            .next()
            .is_some_and(|t| t == "tee" || t.ends_with("/tee"));
        if !is_tee {
            continue;
        }
        for token in tokens {
            if token.starts_with('>') || token.starts_with('<') {
                break;
            }
            if !token.starts_with('-') {
                push(unquote(token));
            }
        }
    }
    files
}

/// Whether the command line hands its last job to the background with `&`.
#[must_use]
pub fn is_background_command(command: &str) -> bool {
    let command = command.trim_end();
    command.ends_with('&') && !command.ends_with("&&")
}

/// Pid from the last `[n] pid` job-control line an interactive shell printed.
#[must_use]
pub fn parse_job_pid(output: &str) -> Option<u32> {
    JOB_LINE_RE
        .captures_iter(output)
        .last()
        .and_then(|caps| caps[1].parse().ok())
}

fn normalized(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Whether a recorded output file and a queried path can name the same file.
/// A relative path matches any path it is a component suffix of.
fn same_file(recorded: &Path, query: &Path) -> bool {
    let (recorded, query) = (normalized(recorded), normalized(query));
    if recorded.as_os_str().is_empty() || query.as_os_str().is_empty() {
        return false;
    }
    match (recorded.is_absolute(), query.is_absolute()) {
        (true, true) => recorded == query,
        (false, true) => query.ends_with(&recorded),
        (true, false) => recorded.ends_with(&query),
        (false, false) => query.ends_with(&recorded) || recorded.ends_with(&query),
    }
}

/// Background jobs started in the sessions of one registry.
#[derive(Debug, Default)]
pub struct BackgroundTracker {
    records: Mutex<Vec<BackgroundProcessRecord>>,
}

impl BackgroundTracker {
    pub fn record(&self, record: BackgroundProcessRecord) {
        tracing::debug!(
            pid = record.pid,
            session_id = %record.session_id,
            files = ?record.output_files,
            "tracking background job"
        );
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.retain(|r| r.pid != record.pid);
        records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> Vec<BackgroundProcessRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a tracked job may still be writing `path`. Such a file must not
    /// be treated as final.
    #[must_use]
    pub fn is_file_pending(&self, path: &Path) -> bool {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(|r| r.output_files.iter())
            .any(|f| same_file(Path::new(f), path))
    }

    /// Drop the jobs of a session that no longer exists.
    pub fn forget_session(&self, session_id: &str) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| r.session_id != session_id);
    }

    /// Check every tracked pid with `kill -0` and drop the ones that exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the liveness check cannot be run.
    pub async fn refresh<S: Sandbox>(&self, sandbox: &S) -> Result<(), ShellError> {
        let pids: Vec<u32> = self.records().iter().map(|r| r.pid).collect();
        if pids.is_empty() {
            return Ok(());
        }
        let list: Vec<String> = pids.iter().map(u32::to_string).collect();
        let check = format!(
            "for p in {}; do kill -0 \"$p\" 2>/dev/null && echo \"$p\"; done",
            list.join(" ")
        );
        let out = sandbox.run(&check, RunOptions::default()).await?;
        let alive: Vec<u32> = out
            .stdout
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|r| alive.contains(&r.pid));
        if records.len() != before {
            tracing::debug!(reaped = before - records.len(), "background jobs exited");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use shellpool_sandbox::{MockSandbox, RunOutput};

    use super::*;

    #[test]
    fn extracts_redirect_targets() {
        assert_eq!(
            extract_output_files("make > build.log 2>&1 &"),
            vec!["build.log"]
        );
        assert_eq!(
            extract_output_files("./run.sh >>out.txt 2> err.txt"),
            vec!["out.txt", "err.txt"]
        );
        assert_eq!(
            extract_output_files("server &> '/tmp/server.log'"),
            vec!["/tmp/server.log"]
        );
        assert!(extract_output_files("sleep 30 > /dev/null &").is_empty());
        assert!(extract_output_files("ls -la").is_empty());
    }

    #[test]
    fn extracts_tee_targets() {
        assert_eq!(
            extract_output_files("python train.py | tee -a train.log metrics.log &"),
            vec!["train.log", "metrics.log"]
        );
    }

    #[test]
    fn background_detection() {
        assert!(is_background_command("sleep 100 &"));
        assert!(is_background_command("make > build.log 2>&1 &  "));
        assert!(!is_background_command("make && make install"));
        assert!(!is_background_command("ls"));
    }

    #[test]
    fn parses_last_job_line() {
        assert_eq!(parse_job_pid("[1] 4242\n"), Some(4242));
        assert_eq!(parse_job_pid("[1] 10\r\n[2] 11\r\n"), Some(11));
        assert_eq!(parse_job_pid("[1]+  Done  sleep 1\n"), None);
        assert_eq!(parse_job_pid("no jobs"), None);
    }

    fn record(pid: u32, files: &[&str]) -> BackgroundProcessRecord {
        BackgroundProcessRecord {
            pid,
            command: "job".into(),
            output_files: files.iter().map(|f| (*f).to_owned()).collect(),
            session_id: "s1".into(),
        }
    }

    #[test]
    fn pending_files() {
        let tracker = BackgroundTracker::default();
        tracker.record(record(10, &["/work/build.log"]));
        assert!(tracker.is_file_pending(&PathBuf::from("/work/build.log")));
        assert!(tracker.is_file_pending(&PathBuf::from("build.log")));
        assert!(!tracker.is_file_pending(&PathBuf::from("/work/other.log")));

        tracker.forget_session("s1");
        assert!(!tracker.is_file_pending(&PathBuf::from("/work/build.log")));
    }

    #[test]
    fn relative_records_match_resolved_queries() {
        let tracker = BackgroundTracker::default();
        tracker.record(record(10, &["out.log"]));
        tracker.record(record(11, &["./logs/train.log"]));

        assert!(tracker.is_file_pending(Path::new("/home/user/out.log")));
        assert!(tracker.is_file_pending(Path::new("./out.log")));
        assert!(tracker.is_file_pending(Path::new("/srv/app/logs/train.log")));
        assert!(tracker.is_file_pending(Path::new("logs/train.log")));
        assert!(tracker.is_file_pending(Path::new("train.log")));

        assert!(!tracker.is_file_pending(Path::new("/home/user/other/train.txt")));
        assert!(!tracker.is_file_pending(Path::new("/srv/app/train.log")));
        assert!(!tracker.is_file_pending(Path::new("/home/user/my-out.log")));
        assert!(!tracker.is_file_pending(Path::new(".")));
    }

    #[tokio::test]
    async fn refresh_reaps_exited_jobs() {
        let sandbox = MockSandbox::default().with_run_handler(|_| {
            Ok(RunOutput {
                stdout: "11\n".into(),
                ..RunOutput::default()
            })
        });
        let tracker = BackgroundTracker::default();
        tracker.record(record(10, &["a.log"]));
        tracker.record(record(11, &["b.log"]));

        tracker.refresh(&sandbox).await.unwrap();
        let pids: Vec<u32> = tracker.records().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![11]);
        assert!(sandbox.run_commands()[0].contains("kill -0"));
    }

    #[tokio::test]
    async fn refresh_without_jobs_runs_nothing() {
        let sandbox = MockSandbox::default();
        BackgroundTracker::default().refresh(&sandbox).await.unwrap();
        assert!(sandbox.calls().is_empty());
    }
}

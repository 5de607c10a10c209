//! Running commands in persistent sessions and polling them to completion.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shellpool_sandbox::Sandbox;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditLogger, AuditResult};
use crate::background::{
    BackgroundProcessRecord, extract_output_files, is_background_command, parse_job_pid,
};
use crate::backend::{SendInput, ShellBackend};
use crate::config::{Config, ShellConfig};
use crate::error::ShellError;
use crate::event::{ShellEvent, ShellEventTx};
use crate::guardrail::{GuardrailChecker, Verdict};
use crate::registry::{DEFAULT_LABEL, SessionRegistry};
use crate::sanitize::{clean, strip_partial_echo};
use crate::sentinel::{MARKER_PREFIX, build_command, command_line, echo_line_end, extract_completion};
use crate::session::{Lease, PendingCommand};
use crate::terminate::ProcessTerminator;

pub(crate) const SESSION_ENDED_NOTE: &str = "session ended before the command completed";
pub(crate) const MAY_STILL_RUN_NOTE: &str = "the process could not be confirmed stopped and may still be running";

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: String,
    pub timeout_secs: Option<u64>,
    /// Session label; the default session when absent.
    pub session: Option<String>,
}

impl ExecRequest {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn session(mut self, label: impl Into<String>) -> Self {
        self.session = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutcome {
    pub session_id: String,
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// How a poll loop ended.
#[derive(Debug)]
pub(crate) enum PollEnd {
    Completed {
        output: String,
        exit_code: i32,
        cursor: usize,
    },
    TimedOut {
        output: String,
        cursor: usize,
    },
    Cancelled {
        output: String,
    },
    Lost {
        output: String,
    },
}

/// Command output as a caller sees it: echo and markers removed, cleaned.
pub(crate) fn visible_output(raw: &str, pending: &PendingCommand) -> String {
    let shown = match echo_line_end(raw, &pending.sentinel) {
        Some(end) => &raw[end..],
        None => strip_partial_echo(raw, &command_line(&pending.command, &pending.sentinel)),
    };
    clean(shown)
}

/// Visible output up to the last complete line, once the echo is through.
/// Output arriving later only ever extends it.
pub(crate) fn settled_output(raw: &str, pending: &PendingCommand) -> Option<String> {
    let echo_end = echo_line_end(raw, &pending.sentinel)?;
    let settled_end = raw.rfind('\n').map_or(0, |i| i + 1);
    Some(clean(raw.get(echo_end..settled_end).unwrap_or_default()))
}

/// How much of `delta` may be marked delivered. A trailing partial line that
/// could be the start of a completion marker is held back.
pub(crate) fn consumable_len(delta: &str) -> usize {
    let tail_start = delta.rfind('\n').map_or(0, |i| i + 1);
    let tail = &delta[tail_start..];
    let holds_marker_prefix = (1..=MARKER_PREFIX.len().min(tail.len()))
        .any(|n| tail.is_char_boundary(tail.len() - n) && MARKER_PREFIX.starts_with(&tail[tail.len() - n..]))
        || tail.contains(MARKER_PREFIX);
    if holds_marker_prefix {
        tail_start
    } else {
        delta.len()
    }
}

/// Validated start offset into `text`; resets to 0 if the cursor ran past it.
pub(crate) fn checked_cursor(text: &str, cursor: usize, session_id: &str) -> usize {
    if cursor <= text.len() && text.is_char_boundary(cursor) {
        cursor
    } else {
        tracing::warn!(
            session_id,
            cursor,
            len = text.len(),
            "output cursor beyond captured output, resetting"
        );
        0
    }
}

/// Forwards newly visible output as chunks, at most once per interval.
///
/// Chunks always extend what was sent before. If the final output disagrees
/// with it, an [`ShellEvent::OutputReset`] carries the whole text instead.
struct OutputStreamer<'a> {
    sink: Option<ShellEventTx>,
    session_id: &'a str,
    correlation_id: &'a str,
    interval: Duration,
    last_emit: Option<Instant>,
    emitted: String,
}

impl<'a> OutputStreamer<'a> {
    fn new(
        sink: Option<ShellEventTx>,
        session_id: &'a str,
        correlation_id: &'a str,
        interval: Duration,
    ) -> Self {
        Self {
            sink,
            session_id,
            correlation_id,
            interval,
            last_emit: None,
            emitted: String::new(),
        }
    }

    fn offer(&mut self, settled: impl FnOnce() -> Option<String>) {
        if self.sink.is_none() {
            return;
        }
        if self.last_emit.is_some_and(|t| t.elapsed() < self.interval) {
            return;
        }
        if let Some(settled) = settled() {
            self.emit(&settled);
        }
    }

    fn flush(&mut self, visible: &str) {
        self.emit(visible);
    }

    fn emit(&mut self, visible: &str) {
        let Some(sink) = &self.sink else {
            return;
        };
        self.last_emit = Some(Instant::now());
        let event = match visible.strip_prefix(self.emitted.as_str()) {
            Some("") => return,
            Some(chunk) => ShellEvent::OutputChunk {
                correlation_id: self.correlation_id.to_owned(),
                session_id: self.session_id.to_owned(),
                chunk: chunk.to_owned(),
            },
            None => {
                tracing::debug!(session_id = self.session_id, "streamed output rewritten, resending");
                ShellEvent::OutputReset {
                    correlation_id: self.correlation_id.to_owned(),
                    session_id: self.session_id.to_owned(),
                    output: visible.to_owned(),
                }
            }
        };
        if sink.send(event).is_err() {
            self.sink = None;
        }
        visible.clone_into(&mut self.emitted);
    }
}

/// Runs commands in persistent shell sessions.
pub struct ShellExecutor<S> {
    pub(crate) registry: Arc<SessionRegistry<S>>,
    guardrails: GuardrailChecker,
    pub(crate) terminator: ProcessTerminator<S>,
    pub(crate) config: ShellConfig,
    audit_logger: Option<AuditLogger>,
    pub(crate) event_tx: Option<ShellEventTx>,
}

impl<S> std::fmt::Debug for ShellExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellExecutor")
            .field("registry", &self.registry)
            .field("policies", &self.guardrails.policies().len())
            .finish_non_exhaustive()
    }
}

impl<S: Sandbox> ShellExecutor<S> {
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry<S>>,
        guardrails: GuardrailChecker,
        config: &Config,
    ) -> Self {
        let terminator = ProcessTerminator::new(Arc::clone(registry.sandbox()), &config.terminate);
        Self {
            registry,
            guardrails,
            terminator,
            config: config.shell.clone(),
            audit_logger: None,
            event_tx: None,
        }
    }

    #[must_use]
    pub fn with_audit(mut self, logger: AuditLogger) -> Self {
        self.audit_logger = Some(logger);
        self
    }

    #[must_use]
    pub fn with_event_tx(mut self, tx: ShellEventTx) -> Self {
        self.event_tx = Some(tx);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry<S>> {
        &self.registry
    }

    pub(crate) async fn audit(&self, entry: AuditEntry) {
        if let Some(logger) = &self.audit_logger {
            logger.log(&entry).await;
        }
    }

    pub(crate) fn emit(&self, session_id: &str, event: ShellEvent) {
        if let Some(tx) = self.registry.stream_sink(session_id).or_else(|| self.event_tx.clone()) {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn background_pids(&self, session_id: &str) -> Vec<u32> {
        self.registry
            .background()
            .records()
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.pid)
            .collect()
    }

    /// Run `request.command` in a persistent session and wait for it, at most
    /// until the timeout. A timed-out command keeps running and can be
    /// resumed with `wait`. Cancelling `cancel` aborts the command.
    ///
    /// # Errors
    ///
    /// `GuardrailBlocked` before anything reaches a session; backend errors
    /// from creating or driving the session.
    pub async fn exec(
        &self,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, ShellError> {
        let started = std::time::Instant::now();
        if let Verdict::Blocked(policy) = self.guardrails.check(&request.command) {
            tracing::warn!(policy = %policy.name, "command blocked by guardrail");
            self.audit(AuditEntry::new(
                "exec",
                &request.command,
                AuditResult::Blocked {
                    policy: policy.name.clone(),
                    reason: policy.message.clone(),
                },
            ))
            .await;
            return Err(ShellError::GuardrailBlocked {
                policy: policy.name.clone(),
                message: policy.message.clone(),
            });
        }

        let timeout = self.config.effective_timeout(request.timeout_secs);
        let label = request.session.as_deref().unwrap_or(DEFAULT_LABEL);
        let lease = self.registry.acquire(label).await?;
        let session_id = lease.session_id.clone();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        self.registry
            .set_stream_sink(&session_id, self.event_tx.clone());
        tracing::info!(%session_id, %correlation_id, command = %request.command, "exec");
        self.emit(
            &session_id,
            ShellEvent::Started {
                correlation_id: correlation_id.clone(),
                session_id: session_id.clone(),
                command: request.command.clone(),
            },
        );

        let (line, sentinel) = build_command(&request.command);
        if let Err(e) = self
            .registry
            .backend()
            .send(&lease.handle, &SendInput::line(line))
            .await
        {
            self.drop_or_release(&session_id, &e);
            self.audit(
                AuditEntry::new("exec", &request.command, AuditResult::Error {
                    message: e.to_string(),
                })
                .session(&session_id)
                .duration(started.elapsed()),
            )
            .await;
            return Err(e);
        }

        let pending = PendingCommand {
            sentinel,
            command: request.command.clone(),
            correlation_id,
            started,
        };
        let end = match self.poll(&lease, &pending, lease.cursor, timeout, cancel).await {
            Ok(end) => end,
            Err(e) => {
                self.drop_or_release(&session_id, &e);
                return Err(e);
            }
        };

        let outcome = match end {
            PollEnd::Completed {
                output,
                exit_code,
                cursor,
            } => {
                self.registry.complete(&session_id, cursor);
                if is_background_command(&request.command) {
                    self.track_background(&session_id, &request.command, &output);
                }
                tracing::info!(%session_id, exit_code, elapsed = ?started.elapsed(), "command completed");
                self.audit(
                    AuditEntry::new("exec", &request.command, AuditResult::Completed { exit_code })
                        .session(&session_id)
                        .duration(started.elapsed()),
                )
                .await;
                ExecOutcome {
                    session_id: session_id.clone(),
                    output,
                    exit_code: Some(exit_code),
                    timed_out: false,
                    aborted: false,
                    note: None,
                }
            }
            PollEnd::TimedOut { output, cursor } => {
                tracing::info!(%session_id, timeout_secs = timeout.as_secs(), "command still running after timeout");
                self.registry.suspend(&session_id, pending.clone(), cursor);
                self.audit(
                    AuditEntry::new("exec", &request.command, AuditResult::Timeout)
                        .session(&session_id)
                        .duration(started.elapsed()),
                )
                .await;
                ExecOutcome {
                    session_id: session_id.clone(),
                    output,
                    exit_code: None,
                    timed_out: true,
                    aborted: false,
                    note: None,
                }
            }
            PollEnd::Cancelled { output } => {
                let termination = self
                    .terminator
                    .terminate_foreground(
                        self.registry.backend(),
                        &lease.handle,
                        Some(&request.command),
                        &self.background_pids(&session_id),
                    )
                    .await;
                self.registry.abandon(&session_id);
                tracing::info!(%session_id, ?termination, "command aborted");
                self.audit(
                    AuditEntry::new("exec", &request.command, AuditResult::Aborted {
                        may_still_run: termination.may_still_run,
                    })
                    .session(&session_id)
                    .duration(started.elapsed()),
                )
                .await;
                ExecOutcome {
                    session_id: session_id.clone(),
                    output,
                    exit_code: None,
                    timed_out: false,
                    aborted: true,
                    note: termination
                        .may_still_run
                        .then(|| MAY_STILL_RUN_NOTE.to_owned()),
                }
            }
            PollEnd::Lost { output } => {
                tracing::warn!(%session_id, "session ended while a command was running");
                self.registry.remove(&session_id);
                self.audit(
                    AuditEntry::new("exec", &request.command, AuditResult::Error {
                        message: SESSION_ENDED_NOTE.into(),
                    })
                    .session(&session_id)
                    .duration(started.elapsed()),
                )
                .await;
                ExecOutcome {
                    session_id: session_id.clone(),
                    output,
                    exit_code: None,
                    timed_out: false,
                    aborted: false,
                    note: Some(SESSION_ENDED_NOTE.into()),
                }
            }
        };

        self.emit(
            &session_id,
            ShellEvent::Completed {
                correlation_id: pending.correlation_id,
                session_id: session_id.clone(),
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
                aborted: outcome.aborted,
            },
        );
        Ok(outcome)
    }

    /// Forget a session whose shell is gone, otherwise free it.
    pub(crate) fn drop_or_release(&self, session_id: &str, error: &ShellError) {
        if matches!(error, ShellError::SessionNotFound { .. }) {
            self.registry.remove(session_id);
        } else {
            self.registry.abandon(session_id);
        }
    }

    pub(crate) fn track_background(&self, session_id: &str, command: &str, output: &str) {
        let Some(pid) = parse_job_pid(output) else {
            tracing::debug!(session_id, "no job pid reported for background command");
            return;
        };
        self.registry.background().record(BackgroundProcessRecord {
            pid,
            command: command.to_owned(),
            output_files: extract_output_files(command),
            session_id: session_id.to_owned(),
        });
    }

    /// Whether a background job started in any session may still be writing `path`.
    pub async fn is_file_pending(&self, path: &Path) -> bool {
        if let Err(e) = self
            .registry
            .background()
            .refresh(self.registry.sandbox().as_ref())
            .await
        {
            tracing::warn!("failed to refresh background jobs: {e}");
        }
        self.registry.background().is_file_pending(path)
    }

    /// Poll a session until `pending` completes, the timeout passes, the
    /// shell goes away or `cancel` fires. Output before `start` is ignored.
    pub(crate) async fn poll(
        &self,
        lease: &Lease,
        pending: &PendingCommand,
        start: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PollEnd, ShellError> {
        let backend = self.registry.backend();
        let deadline = Instant::now() + timeout;
        let mut streamer = OutputStreamer::new(
            self.registry
                .stream_sink(&lease.session_id)
                .or_else(|| self.event_tx.clone()),
            &lease.session_id,
            &pending.correlation_id,
            self.config.stream_interval(),
        );
        let mut start = start;
        let mut text = String::new();

        loop {
            let notified = lease.handle.stream().map(|buffer| buffer.notified());
            // a slow capture must not hold up an abort
            let capture = tokio::select! {
                biased;
                capture = backend.capture(&lease.handle) => capture?,
                () = cancel.cancelled() => {
                    let output = visible_output(text.get(start..).unwrap_or_default(), pending);
                    streamer.flush(&output);
                    return Ok(PollEnd::Cancelled { output });
                }
            };
            text = capture.text;
            start = checked_cursor(&text, start, &lease.session_id);
            let delta = &text[start..];

            if let Some(done) = extract_completion(delta, &pending.sentinel) {
                let output = visible_output(&delta[..done.line_start], pending);
                streamer.flush(&output);
                return Ok(PollEnd::Completed {
                    output,
                    exit_code: done.exit_code,
                    cursor: start + done.end,
                });
            }
            if capture.ended {
                let output = visible_output(delta, pending);
                streamer.flush(&output);
                return Ok(PollEnd::Lost { output });
            }
            streamer.offer(|| settled_output(delta, pending));

            let now = Instant::now();
            if now >= deadline {
                let output = visible_output(delta, pending);
                streamer.flush(&output);
                return Ok(PollEnd::TimedOut {
                    output,
                    cursor: start + consumable_len(delta),
                });
            }

            let wake = async {
                match notified {
                    Some(notified) => notified.await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let output = visible_output(delta, pending);
                    streamer.flush(&output);
                    return Ok(PollEnd::Cancelled { output });
                }
                () = tokio::time::sleep(self.config.poll_interval().min(deadline - now)) => {}
                () = wake => {}
            }
        }
    }
}

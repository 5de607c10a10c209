//! Follow-up operations on an existing session: wait, send and kill.

use serde::Serialize;
use shellpool_sandbox::Sandbox;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditResult};
use crate::backend::{BackendKind, ControlKey, SendInput, ShellBackend};
use crate::background::is_background_command;
use crate::error::ShellError;
use crate::event::ShellEvent;
use crate::executor::{
    MAY_STILL_RUN_NOTE, PollEnd, SESSION_ENDED_NOTE, ShellExecutor, checked_cursor,
    consumable_len, visible_output,
};
use crate::sanitize::clean;
use crate::sentinel::extract_completion;
use crate::session::{Lease, PendingCommand};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitOutcome {
    pub session_id: String,
    pub output: String,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl WaitOutcome {
    fn new(session_id: &str, output: String) -> Self {
        Self {
            session_id: session_id.to_owned(),
            output,
            timed_out: false,
            exit_code: None,
            aborted: false,
            note: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub session_id: String,
    pub output: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillOutcome {
    pub session_id: String,
    pub killed: bool,
}

/// The last visible line is a bare `$` prompt.
fn at_prompt(text: &str) -> bool {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .is_none_or(|line| line.trim_end().ends_with('$'))
}

impl<S: Sandbox> ShellExecutor<S> {
    /// Wait for the pending command of `session_id`. Without one, returns the
    /// output produced since the last delivery.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown sessions, `SessionBusy` if another call
    /// is already polling the session, backend errors from capturing.
    pub async fn wait(
        &self,
        session_id: &str,
        timeout_secs: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, ShellError> {
        let lease = self.registry.begin_poll(session_id).await?;
        let Some(pending) = lease.pending.clone() else {
            return self.drain(&lease).await;
        };

        let timeout = self.config.effective_timeout(timeout_secs);
        tracing::debug!(session_id, command = %pending.command, timeout_secs = timeout.as_secs(), "waiting on pending command");
        let end = match self.poll(&lease, &pending, lease.cursor, timeout, cancel).await {
            Ok(end) => end,
            Err(e) => {
                if matches!(e, ShellError::SessionNotFound { .. }) {
                    self.registry.remove(session_id);
                } else {
                    // keeps the pending command; only the poll claim is dropped
                    self.registry.release(session_id);
                }
                return Err(e);
            }
        };

        let mut outcome = WaitOutcome::new(session_id, String::new());
        match end {
            PollEnd::Completed {
                output,
                exit_code,
                cursor,
            } => {
                self.registry.complete(session_id, cursor);
                if is_background_command(&pending.command) {
                    self.track_background(session_id, &pending.command, &output);
                }
                tracing::info!(session_id, exit_code, elapsed = ?pending.started.elapsed(), "pending command completed");
                outcome.output = output;
                outcome.exit_code = Some(exit_code);
            }
            PollEnd::TimedOut { output, cursor } => {
                self.registry.suspend(session_id, pending.clone(), cursor);
                outcome.output = output;
                outcome.timed_out = true;
            }
            PollEnd::Cancelled { output } => {
                let termination = self
                    .terminator
                    .terminate_foreground(
                        self.registry.backend(),
                        &lease.handle,
                        Some(&pending.command),
                        &self.background_pids(session_id),
                    )
                    .await;
                self.registry.abandon(session_id);
                self.audit(
                    AuditEntry::new("wait", &pending.command, AuditResult::Aborted {
                        may_still_run: termination.may_still_run,
                    })
                    .session(session_id)
                    .duration(pending.started.elapsed()),
                )
                .await;
                outcome.output = output;
                outcome.aborted = true;
                outcome.note = termination
                    .may_still_run
                    .then(|| MAY_STILL_RUN_NOTE.to_owned());
            }
            PollEnd::Lost { output } => {
                tracing::warn!(session_id, "session ended while waiting");
                self.registry.remove(session_id);
                outcome.output = output;
                outcome.note = Some(SESSION_ENDED_NOTE.into());
            }
        }

        self.emit(
            session_id,
            ShellEvent::Completed {
                correlation_id: pending.correlation_id,
                session_id: session_id.to_owned(),
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
                aborted: outcome.aborted,
            },
        );
        Ok(outcome)
    }

    /// Deliver uncollected output of a session with nothing pending.
    async fn drain(&self, lease: &Lease) -> Result<WaitOutcome, ShellError> {
        let session_id = lease.session_id.as_str();
        let capture = match self.registry.backend().capture(&lease.handle).await {
            Ok(capture) => capture,
            Err(e) => {
                self.drop_or_release(session_id, &e);
                return Err(e);
            }
        };
        let start = checked_cursor(&capture.text, lease.cursor, session_id);
        let output = clean(&capture.text[start..]);
        if capture.ended {
            self.registry.remove(session_id);
            let mut outcome = WaitOutcome::new(session_id, output);
            outcome.note = Some(SESSION_ENDED_NOTE.into());
            return Ok(outcome);
        }
        self.registry.set_cursor(session_id, capture.text.len());
        self.registry.release(session_id);
        Ok(WaitOutcome::new(session_id, output))
    }

    /// Whether something other than the shell and its tracked background jobs
    /// is running in the session.
    async fn has_foreground(&self, lease: &Lease) -> Result<bool, ShellError> {
        let exclude = self.background_pids(&lease.session_id);
        if let Some(stopped) = self
            .terminator
            .foreground_stopped(&lease.handle, &exclude)
            .await
        {
            return Ok(!stopped);
        }
        if lease.handle.kind == BackendKind::Multiplexer {
            let capture = self.registry.backend().capture(&lease.handle).await?;
            return Ok(!capture.ended && !at_prompt(&capture.text));
        }
        Ok(false)
    }

    /// Type into the foreground process of `session_id`: a named control key
    /// or text, and return what it printed after a short settle delay.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown sessions, `NoForegroundProcess` when
    /// nothing but the shell is running, backend errors from sending.
    pub async fn send(
        &self,
        session_id: &str,
        input: &str,
        newline: bool,
    ) -> Result<SendOutcome, ShellError> {
        let lease = self.registry.lease(session_id).await?;
        if lease.pending.is_none() && !self.has_foreground(&lease).await? {
            return Err(ShellError::NoForegroundProcess {
                session_id: session_id.to_owned(),
            });
        }

        let key = ControlKey::parse(input);
        let message = match key {
            Some(key) => SendInput::Key(key),
            None => SendInput::Text {
                text: input.to_owned(),
                newline,
            },
        };
        tracing::debug!(session_id, ?key, "sending input");
        let backend = self.registry.backend();
        if let Err(e) = backend.send(&lease.handle, &message).await {
            if matches!(e, ShellError::SessionNotFound { .. }) {
                self.registry.remove(session_id);
            }
            return Err(e);
        }
        tokio::time::sleep(self.config.settle_delay()).await;

        let capture = backend.capture(&lease.handle).await?;
        let start = checked_cursor(&capture.text, lease.cursor, session_id);
        let delta = &capture.text[start..];
        if capture.ended {
            self.registry.remove(session_id);
            return Ok(SendOutcome {
                session_id: session_id.to_owned(),
                output: clean(delta),
                exit_code: None,
            });
        }

        let Some(pending) = lease.pending.as_ref() else {
            if !lease.in_flight {
                self.registry
                    .set_cursor(session_id, start + consumable_len(delta));
            }
            return Ok(SendOutcome {
                session_id: session_id.to_owned(),
                output: clean(delta),
                exit_code: None,
            });
        };

        // (exit code, absolute cursor past the marker, end of output in `delta`)
        let resolved = match extract_completion(delta, &pending.sentinel) {
            Some(done) => Some((done.exit_code, start + done.end, done.line_start)),
            None if key == Some(ControlKey::Interrupt) => self
                .reissue_marker(&lease, pending)
                .await?
                .and_then(|text| {
                    let from = checked_cursor(&text, start, session_id);
                    extract_completion(&text[from..], &pending.sentinel)
                        .map(|done| (done.exit_code, from + done.end, delta.len()))
                }),
            None => None,
        };

        let Some((exit_code, cursor, output_end)) = resolved else {
            if !lease.in_flight {
                self.registry
                    .set_cursor(session_id, start + consumable_len(delta));
            }
            return Ok(SendOutcome {
                session_id: session_id.to_owned(),
                output: visible_output(delta, pending),
                exit_code: None,
            });
        };
        let output = visible_output(&delta[..output_end], pending);

        if !lease.in_flight {
            self.registry.complete(session_id, cursor);
            tracing::info!(session_id, exit_code, "pending command completed after input");
            self.emit(
                session_id,
                ShellEvent::Completed {
                    correlation_id: pending.correlation_id.clone(),
                    session_id: session_id.to_owned(),
                    exit_code: Some(exit_code),
                    timed_out: false,
                    aborted: false,
                },
            );
        }
        Ok(SendOutcome {
            session_id: session_id.to_owned(),
            output,
            exit_code: Some(exit_code),
        })
    }

    /// An interrupt abandons the rest of the command line, marker included.
    /// Once the foreground is verifiably gone, print the marker again so the
    /// pending command resolves with the interrupted status. Returns the
    /// capture taken afterwards.
    async fn reissue_marker(
        &self,
        lease: &Lease,
        pending: &PendingCommand,
    ) -> Result<Option<String>, ShellError> {
        let exclude = self.background_pids(&lease.session_id);
        if self
            .terminator
            .foreground_stopped(&lease.handle, &exclude)
            .await
            != Some(true)
        {
            return Ok(None);
        }
        let backend = self.registry.backend();
        let line = format!("echo {}", pending.sentinel.echo_form());
        backend
            .send(&lease.handle, &SendInput::line(line))
            .await?;
        tokio::time::sleep(self.config.settle_delay()).await;
        let capture = backend.capture(&lease.handle).await?;
        Ok(Some(capture.text))
    }

    /// End a session and whatever runs in it.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if the session is neither tracked nor reattachable.
    pub async fn kill(&self, session_id: &str) -> Result<KillOutcome, ShellError> {
        let started = std::time::Instant::now();
        let lease = self.registry.lease(session_id).await?;
        let command = lease.pending.as_ref().map(|p| p.command.as_str());
        let termination = self
            .terminator
            .terminate_session(self.registry.backend(), &lease.handle, command)
            .await;
        self.registry.remove(session_id);

        let killed = termination.strategy.is_some() && !termination.may_still_run;
        tracing::info!(session_id, killed, strategy = ?termination.strategy, "session killed");
        if let Some(pending) = &lease.pending {
            self.emit(
                session_id,
                ShellEvent::Completed {
                    correlation_id: pending.correlation_id.clone(),
                    session_id: session_id.to_owned(),
                    exit_code: None,
                    timed_out: false,
                    aborted: true,
                },
            );
        }
        self.audit(
            AuditEntry::new("kill", command.unwrap_or_default(), AuditResult::Killed { killed })
                .session(session_id)
                .duration(started.elapsed()),
        )
        .await;
        Ok(KillOutcome {
            session_id: session_id.to_owned(),
            killed,
        })
    }
}

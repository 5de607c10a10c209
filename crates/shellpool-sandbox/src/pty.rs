use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;

use crate::{PtyHandle, PtyOptions, PtyStream, Result, SandboxError};

const READ_CHUNK: usize = 4096;
const REPLAY_BYTES: usize = 256 * 1024;

struct PtyProcess {
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    fanout: Mutex<Fanout>,
    // Dropping the master hangs up the terminal.
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

/// Subscribers of one PTY plus a bounded replay buffer for late joiners.
#[derive(Default)]
struct Fanout {
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    replay: VecDeque<u8>,
}

impl Fanout {
    fn push(&mut self, data: &[u8]) {
        self.replay.extend(data);
        if self.replay.len() > REPLAY_BYTES {
            let drain = self.replay.len() - REPLAY_BYTES;
            self.replay.drain(..drain);
        }
        self.subscribers.retain(|tx| tx.send(data.to_vec()).is_ok());
    }

    fn subscribe(&mut self) -> PtyStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.replay.is_empty() {
            let (head, tail) = self.replay.as_slices();
            let mut seed = Vec::with_capacity(self.replay.len());
            seed.extend_from_slice(head);
            seed.extend_from_slice(tail);
            let _ = tx.send(seed);
        }
        self.subscribers.push(tx);
        rx
    }
}

fn pty_err(e: impl std::fmt::Display) -> SandboxError {
    SandboxError::Pty(e.to_string())
}

/// Live PTY processes of a local sandbox, keyed by child pid.
#[derive(Clone, Default)]
pub(crate) struct PtyTable {
    inner: Arc<Mutex<HashMap<u32, Arc<PtyProcess>>>>,
}

impl PtyTable {
    fn get(&self, pid: u32) -> Option<Arc<PtyProcess>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }

    fn remove(&self, pid: u32) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    pub(crate) fn spawn(&self, options: &PtyOptions) -> Result<PtyHandle> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(pty_err)?;

        let mut cmd = CommandBuilder::new(&options.program);
        cmd.args(&options.args);
        // CommandBuilder starts with an empty environment.
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(pty_err)?;
        drop(pair.slave);
        let pid = child
            .process_id()
            .ok_or_else(|| SandboxError::Pty("spawned pty process has no pid".into()))?;

        let killer = child.clone_killer();
        let writer = pair.master.take_writer().map_err(pty_err)?;
        let mut reader = pair.master.try_clone_reader().map_err(pty_err)?;

        let process = Arc::new(PtyProcess {
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            fanout: Mutex::new(Fanout::default()),
            _master: Mutex::new(pair.master),
        });
        let output = process
            .fanout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, Arc::clone(&process));
        tracing::debug!(pid, program = %options.program, "pty spawned");

        // plain threads: a reader parked in read() must not hold up runtime shutdown
        let table = self.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => process
                        .fanout
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        // EIO once the slave side is gone
                        tracing::debug!(pid, "pty read ended: {e}");
                        break;
                    }
                }
            }
            table.remove(pid);
            process
                .fanout
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .clear();
        });

        std::thread::spawn(move || match child.wait() {
            Ok(status) => tracing::debug!(pid, exit_code = status.exit_code(), "pty exited"),
            Err(e) => tracing::warn!(pid, "failed to reap pty process: {e}"),
        });

        Ok(PtyHandle { pid, output })
    }

    pub(crate) fn subscribe(&self, pid: u32) -> Option<PtyStream> {
        let process = self.get(pid)?;
        let stream = process
            .fanout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();
        Some(stream)
    }

    pub(crate) fn write(&self, pid: u32, data: &[u8]) -> Result<()> {
        let process = self.get(pid).ok_or(SandboxError::PtyNotFound { pid })?;
        let mut writer = process.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn kill(&self, pid: u32) -> Result<bool> {
        let Some(process) = self.get(pid) else {
            return Ok(false);
        };
        process
            .killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_is_bounded() {
        let mut fanout = Fanout::default();
        fanout.push(&vec![b'a'; REPLAY_BYTES]);
        fanout.push(b"tail");
        assert_eq!(fanout.replay.len(), REPLAY_BYTES);
        assert!(fanout.replay.iter().rev().take(4).eq(b"liat".iter()));
    }

    #[test]
    fn late_subscriber_gets_replay() {
        let mut fanout = Fanout::default();
        fanout.push(b"hello ");
        let mut rx = fanout.subscribe();
        fanout.push(b"world");
        assert_eq!(rx.try_recv().unwrap(), b"hello ".to_vec());
        assert_eq!(rx.try_recv().unwrap(), b"world".to_vec());
    }

    #[test]
    fn closed_subscribers_are_dropped() {
        let mut fanout = Fanout::default();
        let rx = fanout.subscribe();
        drop(rx);
        fanout.push(b"x");
        assert!(fanout.subscribers.is_empty());
    }
}

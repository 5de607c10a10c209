use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;
use tokio::sync::futures::Notified;

#[derive(Debug, Default)]
struct BufferState {
    text: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    partial: Vec<u8>,
    closed: bool,
}

/// Accumulated output of a push-based session, decoded as UTF-8.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

impl OutputBuffer {
    pub(crate) fn push(&self, bytes: &[u8]) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut data = std::mem::take(&mut state.partial);
            data.extend_from_slice(bytes);
            let mut rest = data.as_slice();
            loop {
                match std::str::from_utf8(rest) {
                    Ok(valid) => {
                        state.text.push_str(valid);
                        break;
                    }
                    Err(e) => {
                        let (valid, tail) = rest.split_at(e.valid_up_to());
                        state.text.push_str(&String::from_utf8_lossy(valid));
                        match e.error_len() {
                            Some(len) => {
                                state.text.push(char::REPLACEMENT_CHARACTER);
                                rest = &tail[len..];
                            }
                            None => {
                                state.partial = tail.to_vec();
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn snapshot(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .text
            .clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.text.clear();
        state.partial.clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Resolves on the next push or close after this call.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn decodes_split_multibyte_sequences() {
        let buffer = OutputBuffer::default();
        let bytes = "héllo ✓".as_bytes();
        for b in bytes {
            buffer.push(std::slice::from_ref(b));
        }
        assert_eq!(buffer.snapshot(), "héllo ✓");
    }

    #[test]
    fn replaces_invalid_bytes() {
        let buffer = OutputBuffer::default();
        buffer.push(b"a\xffb");
        assert_eq!(buffer.snapshot(), "a\u{fffd}b");
    }

    #[test]
    fn clear_resets_text() {
        let buffer = OutputBuffer::default();
        buffer.push(b"old output\n");
        buffer.clear();
        buffer.push(b"new");
        assert_eq!(buffer.snapshot(), "new");
        assert!(!buffer.is_closed());
        buffer.close();
        assert!(buffer.is_closed());
    }

    #[tokio::test]
    async fn push_wakes_waiter() {
        let buffer = Arc::new(OutputBuffer::default());
        let notified = buffer.notified();
        let writer = Arc::clone(&buffer);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.push(b"x");
        });
        tokio::time::timeout(Duration::from_secs(5), notified)
            .await
            .unwrap();
        assert_eq!(buffer.snapshot(), "x");
    }
}

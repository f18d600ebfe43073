use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::ble::BleError;

/// Longest wait a single pop honours.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Buffer between a notification-dispatch thread and a blocking reader.
///
/// The platform's notification callback calls [`push`](Self::push) for each
/// characteristic value; the transport's `read_partial` calls
/// [`pop`](Self::pop), which blocks until at least one byte is available or
/// the deadline passes. Bytes come out in arrival order and are never
/// reframed: a pop may span several notifications or take part of one.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct QueueState {
    chunks: VecDeque<Vec<u8>>,
    closed: bool,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one notification payload. Empty payloads and payloads that
    /// arrive after [`close`](Self::close) are dropped.
    pub fn push(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed {
            trace!(len = payload.len(), "notification after close dropped");
            return;
        }
        state.chunks.push_back(payload.to_vec());
        drop(state);
        self.ready.notify_one();
    }

    /// Takes up to `max_len` buffered bytes, waiting at most `timeout` for
    /// the first notification. Returns an empty vector on timeout and
    /// [`BleError::Closed`] once the queue is closed and drained.
    pub fn pop(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, BleError> {
        if max_len == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + timeout.min(MAX_WAIT);
        let mut state = self.state.lock();
        while state.chunks.is_empty() {
            if state.closed {
                return Err(BleError::Closed);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                if state.chunks.is_empty() {
                    return if state.closed {
                        Err(BleError::Closed)
                    } else {
                        Ok(Vec::new())
                    };
                }
                break;
            }
        }

        let available: usize = state.chunks.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(available.min(max_len));
        while out.len() < max_len {
            let Some(front) = state.chunks.front_mut() else {
                break;
            };
            let take = front.len().min(max_len - out.len());
            out.extend(front.drain(..take));
            if front.is_empty() {
                state.chunks.pop_front();
            }
        }
        Ok(out)
    }

    /// Marks the link as gone and wakes any blocked reader. Bytes already
    /// buffered can still be popped.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    /// Discards buffered bytes and reopens the queue for a new connection.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.chunks.clear();
        state.closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.state.lock().chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().chunks.is_empty()
    }
}

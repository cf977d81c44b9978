use futures_util::{Sink, SinkExt};
use std::collections::VecDeque;
use tokio_tungstenite::tungstenite::Message;

use crate::frame::Frame;

/// Returned when a bounded queue cannot take another frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pending queue is full ({limit} frames)")]
pub struct QueueFull {
    pub limit: usize,
}

/// Frames received from the client while the upstream handshake is in flight.
///
/// Drained front to back exactly once when the upstream becomes ready. After
/// that the session forwards directly and the queue stays empty.
#[derive(Debug, Default)]
pub struct PendingQueue {
    frames: VecDeque<Frame>,
    limit: Option<usize>,
    bytes: usize,
}

impl PendingQueue {
    /// Creates a queue; `None` means unbounded.
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            frames: VecDeque::new(),
            limit,
            bytes: 0,
        }
    }

    pub fn enqueue(&mut self, frame: Frame) -> Result<(), QueueFull> {
        if let Some(limit) = self.limit {
            if self.frames.len() >= limit {
                return Err(QueueFull { limit });
            }
        }
        self.bytes += frame.len();
        self.frames.push_back(frame);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total payload bytes currently buffered.
    #[must_use]
    pub const fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    /// Sends every buffered frame to `sink` in arrival order.
    ///
    /// Returns how many frames were sent. A frame whose send fails is not
    /// put back; the caller tears the session down on error.
    pub async fn drain_into<S>(&mut self, sink: &mut S) -> Result<usize, S::Error>
    where
        S: Sink<Message> + Unpin,
    {
        let mut sent = 0;
        while let Some(frame) = self.frames.pop_front() {
            self.bytes -= frame.len();
            sink.send(frame.into_message()).await?;
            sent += 1;
        }
        Ok(sent)
    }
}

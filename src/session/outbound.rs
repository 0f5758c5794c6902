use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::frame::Frame;

/// Write side of one connection with a bound on unflushed bytes.
///
/// Frames offered while the writer still holds `threshold` or more bytes are
/// dropped. Control traffic (registration, renewal, exit) goes through
/// [`OutboundQueue::push`] and is never dropped.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<String>,
    buffered: Arc<AtomicUsize>,
    threshold: usize,
}

#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    buffered: Arc<AtomicUsize>,
}

impl OutboundQueue {
    pub fn new(threshold: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                buffered: buffered.clone(),
                threshold,
            },
            OutboundReceiver { rx, buffered },
        )
    }

    /// Best-effort send. Returns false when the frame was dropped.
    pub fn offer(&self, frame: &Frame) -> bool {
        if self.buffered.load(Ordering::Acquire) >= self.threshold {
            tracing::debug!(buffered = self.buffered(), "outbound buffer full, dropping frame");
            return false;
        }
        self.push(frame)
    }

    /// Queues a frame regardless of pressure.
    pub fn push(&self, frame: &Frame) -> bool {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "unencodable outbound frame");
                return false;
            }
        };
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(text).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}

impl OutboundReceiver {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Called by the writer after `len` bytes reached the socket.
    pub fn flushed(&self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::AcqRel);
    }
}

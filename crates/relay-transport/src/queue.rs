//! Bounded per-session outbound queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::traits::{Outbound, SessionId, TransportError};

/// Default number of frames a session may have waiting to be written.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// An [`Outbound`] backed by a bounded mpsc queue.
///
/// A writer task owns the receiving half and drains it onto the wire.
#[derive(Debug)]
pub struct QueuedOutbound {
    id: SessionId,
    tx: mpsc::Sender<Arc<str>>,
    capacity: usize,
    remote_addr: Option<String>,
    is_open: AtomicBool,
}

impl QueuedOutbound {
    /// Create a queue for a session, returning the handle and the receiver
    /// the writer drains.
    #[must_use]
    pub fn channel(
        id: SessionId,
        capacity: usize,
        remote_addr: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let outbound = Arc::new(Self {
            id,
            tx,
            capacity,
            remote_addr,
            is_open: AtomicBool::new(true),
        });
        (outbound, rx)
    }

    /// Mark the session closed; later deliveries fail fast.
    pub fn close(&self) {
        self.is_open.store(false, Ordering::SeqCst);
    }
}

impl Outbound for QueuedOutbound {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn deliver(&self, frame: Arc<str>) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        match self.tx.try_send(frame) {
            Ok(()) => {
                trace!(session = %self.id, "Frame queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(TransportError::Backpressure(self.capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

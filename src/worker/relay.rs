//! Channel carrying encoded wire messages from a context to its pool.

use tokio::sync::mpsc;

use crate::config::{RelayMode, clamp_capacity};

/// Context side of the relay.
#[derive(Clone)]
pub(crate) enum RelaySender {
    Unbounded(mpsc::UnboundedSender<String>),
    Bounded(mpsc::Sender<String>),
}

impl RelaySender {
    /// Send from inside the context's runtime. Returns false once the pool
    /// side is gone.
    pub async fn send(&self, text: String) -> bool {
        match self {
            Self::Unbounded(tx) => tx.send(text).is_ok(),
            Self::Bounded(tx) => tx.send(text).await.is_ok(),
        }
    }

    /// Send from outside any runtime.
    pub fn send_blocking(&self, text: String) -> bool {
        match self {
            Self::Unbounded(tx) => tx.send(text).is_ok(),
            Self::Bounded(tx) => tx.blocking_send(text).is_ok(),
        }
    }
}

/// Pool side of the relay.
pub(crate) enum RelayReceiver {
    Unbounded(mpsc::UnboundedReceiver<String>),
    Bounded(mpsc::Receiver<String>),
}

impl RelayReceiver {
    /// `None` once every sender is dropped and the buffer is drained.
    pub async fn recv(&mut self) -> Option<String> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }
}

pub(crate) fn channel(mode: RelayMode) -> (RelaySender, RelayReceiver) {
    match mode {
        RelayMode::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (RelaySender::Unbounded(tx), RelayReceiver::Unbounded(rx))
        }
        RelayMode::Bounded(capacity) => {
            let (tx, rx) = mpsc::channel(clamp_capacity(capacity));
            (RelaySender::Bounded(tx), RelayReceiver::Bounded(rx))
        }
    }
}

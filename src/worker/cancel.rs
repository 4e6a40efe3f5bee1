//! Structured cancellation.
//!
//! Every worker owns a kill switch. A [`CancelSignal`] observes the kill
//! switch of its own worker plus those of every ancestor worker, so a pool
//! built inside a worker stops as soon as any level above it is torn down.

use futures::future::{self, FutureExt};
use tokio::sync::watch;

/// Owning side of one worker's kill switch.
///
/// Dropping it counts as cancellation for every observer.
#[derive(Debug)]
pub struct KillSwitch {
    tx: watch::Sender<bool>,
}

impl KillSwitch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Flip the switch. Idempotent.
    pub fn kill(&self) {
        self.tx.send_replace(true);
    }

    /// Observer for this switch alone.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once the observed switch is killed or dropped.
pub(crate) async fn killed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Observer of a chain of kill switches.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    chain: Vec<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn root() -> Self {
        Self::default()
    }

    /// This chain extended with one more switch.
    pub fn linked(&self, switch: &KillSwitch) -> Self {
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(switch.subscribe());
        chain.extend(self.chain.iter().cloned());
        Self { chain }
    }

    /// Whether any switch in the chain has been killed or dropped.
    pub fn is_cancelled(&self) -> bool {
        self.chain
            .iter()
            .any(|rx| *rx.borrow() || rx.has_changed().is_err())
    }

    /// Resolve once any switch in the chain is killed or dropped.
    pub async fn cancelled(&self) {
        if self.chain.is_empty() {
            return future::pending().await;
        }

        let waits = self.chain.iter().map(|rx| {
            let mut rx = rx.clone();
            async move { killed(&mut rx).await }.boxed()
        });
        future::select_all(waits).await;
    }

    /// Number of levels observed.
    pub fn depth(&self) -> usize {
        self.chain.len()
    }
}

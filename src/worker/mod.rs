//! Worker execution protocol.
//!
//! Core components:
//! - `context`: the isolated execution context (thread + private runtime)
//! - `message`: wire messages and merged-stream results
//! - `relay`: channel carrying encoded messages back to the pool
//! - `cancel`: kill switches and the cancellation chain

pub mod cancel;
pub(crate) mod context;
pub mod message;
pub(crate) mod relay;

pub use cancel::{CancelSignal, KillSwitch};
pub use message::{ResultMessage, WireMessage};

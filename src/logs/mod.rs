//! # Log Synchronization
//!
//! Run logs served from a persisted cache that is filled and refreshed from
//! the execution engine.
//!
//! - [`LogSyncEngine`]: point-in-time reads and shared live streams
//! - [`observer`]: forwarding a stream to a remote observer with reconnect backoff

pub mod observer;
pub mod sync;

pub use observer::{
    forward_to_observer, BackoffPolicy, ConnectionState, ForwardOutcome, ObserverTransport,
    TransportError,
};
pub use sync::{LogSubscription, LogSyncEngine, LogUpdate};

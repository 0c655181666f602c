//! Fan-out of broker messages to WebSocket clients
//!
//! 1. [`registry`] - Live sessions, keyed by session id
//! 2. [`delivery`] - Relay from the broker's network task onto session queues
//! 3. [`session`] - Per-connection write loop and teardown
//!
//! # Architecture
//!
//! ```text
//! Broker network task ──► DeliveryRelay ──snapshot──► ClientRegistry
//!                              │
//!                              └──enqueue──► session queue ──► ClientSession ──► socket
//! ```
//!
//! The relay only ever enqueues. Each session drains its own queue and removes
//! itself from the registry once its socket stops accepting writes.

pub mod delivery;
pub mod registry;
pub mod session;

pub use delivery::DeliveryRelay;
pub use registry::{ClientRegistry, RegistryError, SessionHandle, SessionId};
pub use session::{
    run_to_completion, ClientSession, FrameSink, SessionExit, SessionSummary, SinkError,
};

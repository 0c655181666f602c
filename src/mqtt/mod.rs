//! # MQTT Integration Module
//!
//! Owns the bridge's single connection to an MQTT broker and turns everything it
//! receives into [`InboundMessage`]s for the bound [`MessageHandler`]s.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── broker.rs   - Connection lifecycle, publish/subscribe, network task
//! ├── error.rs    - BrokerError
//! ├── message.rs  - InboundMessage and its display line
//! └── topic.rs    - Topic filter matching
//! ```
//!
//! ## Design Philosophy
//!
//! - **One connection**: connect is rejected while connected, never replaced
//! - **No hidden retries**: every failure goes back to whoever asked
//! - **Handlers stay cheap**: they run on the network task, so they only hand data off

pub mod broker;
pub mod error;
pub mod message;
pub mod topic;

pub use broker::{
    BrokerAddress, BrokerConnection, BrokerCredentials, ConnectionState, MessageHandler,
};
pub use error::BrokerError;
pub use message::InboundMessage;

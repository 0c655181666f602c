//! Bridges one MQTT broker connection to any number of browser WebSocket clients.
//!
//! ```text
//! HTTP (connect / publish / subscribe) ──► Bridge ──► BrokerConnection ──► broker
//!                                            │
//! broker messages ──► DeliveryRelay ──► ClientRegistry ──► ClientSession ──► WebSocket
//! ```

pub mod bridge;
pub mod config;
pub mod http;
pub mod mqtt;
pub mod relay;

pub use bridge::{Bridge, RegisteredSession};
pub use config::{BridgeConfig, BrokerSettings};

//! Error definitions for the broker connection

use std::time::Duration;
use thiserror::Error;

/// Failures reported by [`BrokerConnection`](super::broker::BrokerConnection) operations
///
/// Every variant is scoped to the single call that produced it. Nothing here is
/// retried internally; the caller decides whether to try again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// A connection is already live; the existing one was left untouched
    #[error("already connected to a broker")]
    AlreadyConnected,

    /// The operation needs a live connection and there is none
    #[error("not connected to a broker")]
    NotConnected,

    /// No CONNACK arrived within the connect bound
    #[error("broker did not answer within {0:?}")]
    ConnectTimeout(Duration),

    /// The broker rejected the session or the transport failed during the handshake
    #[error("connection refused: {0}")]
    ConnectRefused(String),

    /// The broker address could not be turned into connection options
    #[error("invalid broker url: {0}")]
    InvalidBrokerUrl(String),

    /// The client library did not accept the publish request
    #[error("publish failed: {0}")]
    PublishError(String),

    /// The subscribe request failed or the broker rejected it
    #[error("subscribe failed: {0}")]
    SubscribeError(String),
}

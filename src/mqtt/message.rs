use bytes::Bytes;
use chrono::{DateTime, Local};
use std::fmt;

/// Timestamp layout used for every line pushed to WebSocket clients
pub const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A message received on one of the active subscriptions
///
/// Lives only as long as it takes to render and fan it out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    topic: String,
    payload: Bytes,
    received_at: DateTime<Local>,
}

impl InboundMessage {
    /// Stamps the message with the local time of arrival
    pub fn received(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::received_at(topic, payload, Local::now())
    }

    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        received_at: DateTime<Local>,
    ) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// `<YYYY-MM-DD HH:MM:SS> <topic>: <payload>`, payload decoded lossily as UTF-8
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.received_at.format(DISPLAY_TIME_FORMAT),
            self.topic,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

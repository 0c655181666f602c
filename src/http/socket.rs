//! WebSocket side of a session
//!
//! The sending half becomes the session's [`FrameSink`]. The receiving half is only
//! watched for the peer going away, which cancels that one session.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::relay::{FrameSink, SinkError};

pub struct WsFrameSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_text(&mut self, text: String) -> Result<(), SinkError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SinkError(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

pub async fn handle_socket(socket: WebSocket, bridge: Arc<Bridge>) {
    let (sender, mut receiver) = socket.split();

    let session = match bridge.register_session(Box::new(WsFrameSink { inner: sender })) {
        Ok(session) => session,
        Err(e) => {
            warn!("Rejected WebSocket session: {}", e);
            return;
        }
    };

    let id = session.id.clone();
    let mut task = session.task;

    let joined = tokio::select! {
        _ = wait_for_close(&mut receiver) => {
            debug!("Peer closed session {}", id);
            session.cancel.cancel();
            (&mut task).await
        }
        joined = &mut task => joined,
    };

    match joined {
        Ok(summary) => debug!("Session {} finished: {:?}", id, summary.exit),
        Err(e) => warn!("Write loop of session {} aborted: {}", id, e),
    }
}

async fn wait_for_close(receiver: &mut SplitStream<WebSocket>) {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

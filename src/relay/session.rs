//! Per-connection write loop as a typestate machine
//!
//! # State Machine
//!
//! ```text
//! Active ──(write failed | cancelled | queue closed)──► Terminating ──► Removed
//! ```
//!
//! `Active` owns the receiving end of the session's queue and writes one text frame
//! per line. `Terminating` takes the session out of the registry. `Removed` closes
//! the socket and reports how the session ended.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::{ClientRegistry, RegistryError, SessionHandle, SessionId};

/// Outbound half of a client socket
#[async_trait]
pub trait FrameSink: Send {
    /// Writes one text frame
    async fn send_text(&mut self, text: String) -> Result<(), SinkError>;

    /// Best effort close; errors are irrelevant at this point
    async fn close(&mut self);
}

#[derive(Debug, Error)]
#[error("socket write failed: {0}")]
pub struct SinkError(pub String);

/// Why a session left the `Active` state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionExit {
    /// The socket rejected a write
    WriteFailed,
    /// Peer closed the socket or the server is shutting down
    Cancelled,
    /// Every sender of the queue is gone
    QueueClosed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub exit: SessionExit,
    pub delivered: u64,
}

mod sealed {
    pub trait Sealed {}
}

/// Marker for the lifecycle stage a [`ClientSession`] is in
pub trait SessionState: sealed::Sealed {}

#[derive(Debug, Clone)]
pub struct Active;
#[derive(Debug, Clone)]
pub struct Terminating;
#[derive(Debug, Clone)]
pub struct Removed;

impl sealed::Sealed for Active {}
impl sealed::Sealed for Terminating {}
impl sealed::Sealed for Removed {}
impl SessionState for Active {}
impl SessionState for Terminating {}
impl SessionState for Removed {}

pub struct ClientSession<S: SessionState> {
    id: SessionId,
    sink: Box<dyn FrameSink>,
    queue: mpsc::UnboundedReceiver<String>,
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
    delivered: u64,
    exit: Option<SessionExit>,
    state: PhantomData<S>,
}

impl<S: SessionState> ClientSession<S> {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn transition<N: SessionState>(self) -> ClientSession<N> {
        ClientSession {
            id: self.id,
            sink: self.sink,
            queue: self.queue,
            registry: self.registry,
            shutdown: self.shutdown,
            delivered: self.delivered,
            exit: self.exit,
            state: PhantomData,
        }
    }
}

impl ClientSession<Active> {
    /// Creates the session's queue and registers it under a fresh id
    pub fn open(
        registry: Arc<ClientRegistry>,
        sink: Box<dyn FrameSink>,
        shutdown: CancellationToken,
    ) -> Result<Self, RegistryError> {
        let id = SessionId::generate();
        let (sender, queue) = mpsc::unbounded_channel();
        registry.add(SessionHandle::new(id.clone(), sender))?;
        info!("WebSocket session {} registered", id);

        Ok(Self {
            id,
            sink,
            queue,
            registry,
            shutdown,
            delivered: 0,
            exit: None,
            state: PhantomData,
        })
    }

    /// Writes queued lines until a write fails, the session is cancelled or the
    /// queue closes
    pub async fn run(mut self) -> ClientSession<Terminating> {
        let exit = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break SessionExit::Cancelled,
                next = self.queue.recv() => match next {
                    Some(line) => {
                        // A peer that stops reading must not hold off cancellation
                        let written = tokio::select! {
                            biased;
                            _ = self.shutdown.cancelled() => break SessionExit::Cancelled,
                            written = self.sink.send_text(line) => written,
                        };
                        if let Err(e) = written {
                            debug!("Session {}: {}", self.id, e);
                            break SessionExit::WriteFailed;
                        }
                        self.delivered += 1;
                    }
                    None => break SessionExit::QueueClosed,
                },
            }
        };

        debug!("Session {} leaving active state: {:?}", self.id, exit);
        self.exit = Some(exit);
        self.transition()
    }
}

impl ClientSession<Terminating> {
    pub fn exit(&self) -> Option<SessionExit> {
        self.exit
    }

    /// Takes the session out of the registry; safe if it is already gone
    pub fn unregister(mut self) -> ClientSession<Removed> {
        if !self.registry.remove(&self.id) {
            debug!("Session {} was already unregistered", self.id);
        }
        self.queue.close();
        self.transition()
    }
}

impl ClientSession<Removed> {
    pub async fn close(mut self) -> SessionSummary {
        self.sink.close().await;
        let exit = self.exit.unwrap_or(SessionExit::QueueClosed);
        info!(
            "WebSocket session {} closed after {} messages ({:?})",
            self.id, self.delivered, exit
        );

        SessionSummary {
            id: self.id.clone(),
            exit,
            delivered: self.delivered,
        }
    }
}

/// Runs a freshly opened session through its whole lifecycle
pub async fn run_to_completion(session: ClientSession<Active>) -> SessionSummary {
    session.run().await.unregister().close().await
}

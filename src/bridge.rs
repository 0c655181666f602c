//! Bridge context: one broker connection, one session registry, one relay
//!
//! Owned by the application entry point and handed to the HTTP layer behind an
//! `Arc`. Everything the outside world can do to the core goes through here.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BrokerSettings;
use crate::mqtt::{BrokerConnection, BrokerCredentials, BrokerError, ConnectionState, MessageHandler};
use crate::relay::{
    run_to_completion, ClientRegistry, ClientSession, DeliveryRelay, FrameSink, RegistryError,
    SessionId, SessionSummary,
};

/// A session that has been registered and whose write loop is running
pub struct RegisteredSession {
    pub id: SessionId,
    /// Cancel to end this session only (e.g. when the peer closes)
    pub cancel: CancellationToken,
    pub task: JoinHandle<SessionSummary>,
}

pub struct Bridge {
    broker: BrokerConnection,
    registry: Arc<ClientRegistry>,
    relay: Arc<DeliveryRelay>,
    shutdown: CancellationToken,
}

impl Bridge {
    pub fn new(settings: BrokerSettings) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let relay = Arc::new(DeliveryRelay::new(Arc::clone(&registry)));
        Self {
            broker: BrokerConnection::new(settings),
            registry,
            relay,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn connect_broker(&self, credentials: &BrokerCredentials) -> Result<(), BrokerError> {
        self.broker.connect(credentials).await
    }

    pub async fn disconnect_broker(&self) {
        self.broker.disconnect().await
    }

    pub fn broker_status(&self) -> ConnectionState {
        self.broker.status()
    }

    pub async fn publish(&self, topic: &str, message: &str) -> Result<(), BrokerError> {
        self.broker.publish(topic, message.as_bytes().to_vec()).await
    }

    /// Subscribes and binds the relay, so matching messages reach every session
    pub async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let relay: Arc<dyn MessageHandler> = self.relay.clone();
        self.broker.subscribe(topic, relay).await
    }

    /// Registers a socket and spawns its write loop
    pub fn register_session(
        &self,
        sink: Box<dyn FrameSink>,
    ) -> Result<RegisteredSession, RegistryError> {
        let cancel = self.shutdown.child_token();
        let session = ClientSession::open(Arc::clone(&self.registry), sink, cancel.clone())?;
        let id = session.id().clone();
        let task = tokio::spawn(run_to_completion(session));
        debug!("Spawned write loop for session {}", id);

        Ok(RegisteredSession { id, cancel, task })
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<DeliveryRelay> {
        &self.relay
    }

    /// Ends every session and closes the broker connection
    pub async fn shutdown(&self) {
        info!(
            "Shutting down bridge with {} open sessions",
            self.registry.len()
        );
        self.shutdown.cancel();
        self.broker.disconnect().await;
    }
}

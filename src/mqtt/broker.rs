//! The single outbound broker connection
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect──► Connected ──disconnect / network loss──► Disconnected
//! ```
//!
//! Lifecycle calls are serialized by one async mutex around the live connection.
//! The externally visible state sits in a `watch` cell so [`BrokerConnection::status`]
//! never waits on a lifecycle call in flight. Every live connection gets an epoch;
//! its network task may only flip the state back to `Disconnected` while that epoch
//! is still current.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex as SyncMutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, Transport,
};
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::{Host, Url};

use super::error::BrokerError;
use super::message::InboundMessage;
use super::topic;
use crate::config::BrokerSettings;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Receives every message matching a subscription
///
/// Called on the connection's network task, one message at a time. Implementations
/// must return promptly: anything slow here stalls the whole connection.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &InboundMessage);
}

/// What an operator supplies to open a connection
#[derive(Clone, Default)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
    pub broker_url: String,
}

impl BrokerCredentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        broker_url: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            broker_url: broker_url.into(),
        }
    }
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("broker_url", &self.broker_url)
            .finish()
    }
}

/// Host, port and transport extracted from a broker URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Accepts `tcp://`, `mqtt://`, `ssl://`, `tls://`, `mqtts://` or no scheme at all
    ///
    /// Credentials embedded in the URL are rejected; they travel in
    /// [`BrokerCredentials`] instead.
    pub fn parse(url: &str) -> Result<Self, BrokerError> {
        let trimmed = url.trim();
        let invalid = |reason: String| BrokerError::InvalidBrokerUrl(reason);

        let normalized = if trimmed.contains("://") {
            trimmed.to_string()
        } else if trimmed.parse::<Ipv6Addr>().is_ok() {
            format!("tcp://[{}]", trimmed)
        } else {
            format!("tcp://{}", trimmed)
        };
        let parsed =
            Url::parse(&normalized).map_err(|e| invalid(format!("'{}': {}", trimmed, e)))?;

        let tls = match parsed.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(invalid(
                "credentials must be given separately, not in the url".to_string(),
            ));
        }
        if !matches!(parsed.path(), "" | "/") || parsed.query().is_some() {
            return Err(invalid(format!("unexpected path in '{}'", trimmed)));
        }

        let host = match parsed.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(invalid(format!("missing host in '{}'", trimmed))),
        };
        let port = parsed
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        Ok(Self { host, port, tls })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Visible state plus the epoch of the connection allowed to change it
struct StateCell {
    tx: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            epoch: AtomicU64::new(0),
        }
    }

    fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    fn mark_connected(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx.send_replace(ConnectionState::Connected);
        epoch
    }

    /// Used by network tasks; ignored once a newer lifecycle call took over
    fn mark_lost(&self, epoch: u64) -> bool {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        self.tx.send_replace(ConnectionState::Disconnected);
        true
    }

    fn retire(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.tx.send_replace(ConnectionState::Disconnected);
    }
}

/// Handler bindings and outstanding SUBACK waiters of one live connection
#[derive(Default)]
struct Subscriptions {
    handlers: RwLock<Vec<(String, Arc<dyn MessageHandler>)>>,
    pending_acks: SyncMutex<VecDeque<oneshot::Sender<Vec<SubscribeReasonCode>>>>,
}

impl Subscriptions {
    /// Binds `handler` to `filter`, returning whatever was bound before
    fn bind(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let mut handlers = self.handlers.write();
        match handlers.iter_mut().find(|(f, _)| f == filter) {
            Some((_, bound)) => Some(std::mem::replace(bound, handler)),
            None => {
                handlers.push((filter.to_string(), handler));
                None
            }
        }
    }

    fn restore(&self, filter: &str, previous: Option<Arc<dyn MessageHandler>>) {
        let mut handlers = self.handlers.write();
        match previous {
            Some(previous) => {
                if let Some((_, bound)) = handlers.iter_mut().find(|(f, _)| f == filter) {
                    *bound = previous;
                }
            }
            None => handlers.retain(|(f, _)| f != filter),
        }
    }

    /// Invokes each distinct matching handler once; returns how many ran
    fn dispatch(&self, message: &InboundMessage) -> usize {
        let handlers = self.handlers.read();
        let mut invoked: Vec<&Arc<dyn MessageHandler>> = Vec::new();
        for (filter, handler) in handlers.iter() {
            if !topic::matches(filter, message.topic()) {
                continue;
            }
            if invoked.iter().any(|seen| Arc::ptr_eq(*seen, handler)) {
                continue;
            }
            handler.on_message(message);
            invoked.push(handler);
        }
        invoked.len()
    }

    fn expect_ack(&self) -> oneshot::Receiver<Vec<SubscribeReasonCode>> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().push_back(tx);
        rx
    }

    fn forget_last_ack(&self) {
        self.pending_acks.lock().pop_back();
    }

    // SUBACKs come back in request order. A waiter that timed out stays queued so
    // its late SUBACK is consumed here instead of shifting the ones behind it.
    fn resolve_ack(&self, return_codes: Vec<SubscribeReasonCode>) {
        match self.pending_acks.lock().pop_front() {
            Some(waiter) => {
                let _ = waiter.send(return_codes);
            }
            None => warn!("Received SUBACK without an outstanding subscribe"),
        }
    }

    fn drop_waiters(&self) {
        self.pending_acks.lock().clear();
    }
}

struct LiveConnection {
    client: AsyncClient,
    client_id: String,
    subscriptions: Arc<Subscriptions>,
    driver: JoinHandle<()>,
}

/// Owner of the one MQTT connection
pub struct BrokerConnection {
    settings: BrokerSettings,
    live: Mutex<Option<LiveConnection>>,
    state: Arc<StateCell>,
}

impl BrokerConnection {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            live: Mutex::new(None),
            state: Arc::new(StateCell::new()),
        }
    }

    pub fn status(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionState::Connected
    }

    /// Opens the connection and waits for the broker's CONNACK
    ///
    /// # Errors
    ///
    /// * [`BrokerError::AlreadyConnected`] - a connection is live and stays untouched
    /// * [`BrokerError::InvalidBrokerUrl`] - the URL could not be parsed
    /// * [`BrokerError::ConnectTimeout`] - no CONNACK within `connect_timeout`
    /// * [`BrokerError::ConnectRefused`] - rejected by the broker or the transport
    pub async fn connect(&self, credentials: &BrokerCredentials) -> Result<(), BrokerError> {
        let mut live = self.live.lock().await;

        if self.state.current() == ConnectionState::Connected {
            warn!("Connect requested while already connected, keeping existing connection");
            return Err(BrokerError::AlreadyConnected);
        }

        if let Some(stale) = live.take() {
            debug!("Discarding lost connection {}", stale.client_id);
            stale.driver.abort();
        }

        let address = BrokerAddress::parse(&credentials.broker_url)?;
        let client_id = self.next_client_id();
        let options = self.mqtt_options(&client_id, &address, credentials);
        let (client, mut eventloop) = AsyncClient::new(options, self.settings.request_capacity);

        info!("Connecting to {} as {}", address, client_id);
        let bound = self.settings.connect_timeout();
        match tokio::time::timeout(bound, await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {}", address, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Connection to {} timed out after {:?}", address, bound);
                return Err(BrokerError::ConnectTimeout(bound));
            }
        }

        let epoch = self.state.mark_connected();
        let subscriptions = Arc::new(Subscriptions::default());
        let driver = tokio::spawn(drive_connection(
            eventloop,
            Arc::clone(&subscriptions),
            Arc::clone(&self.state),
            epoch,
        ));

        info!("Connected to {} as {}", address, client_id);
        *live = Some(LiveConnection {
            client,
            client_id,
            subscriptions,
            driver,
        });
        Ok(())
    }

    /// Closes the connection if there is one; always leaves the state `Disconnected`
    pub async fn disconnect(&self) {
        let mut live = self.live.lock().await;
        self.state.retire();

        let Some(connection) = live.take() else {
            debug!("Disconnect requested without a connection");
            return;
        };

        let LiveConnection {
            client,
            client_id,
            mut driver,
            ..
        } = connection;

        if driver.is_finished() {
            info!("Dropped lost connection {}", client_id);
            return;
        }

        let linger = self.settings.disconnect_linger();
        let drain = async {
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect request for {} not queued: {}", client_id, e);
            }
            let _ = (&mut driver).await;
        };
        if tokio::time::timeout(linger, drain).await.is_err() {
            debug!("Linger of {:?} elapsed, stopping network task", linger);
            driver.abort();
        }

        info!("Disconnected {}", client_id);
    }

    /// Sends `payload` to `topic` with QoS 0
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        let client = {
            let live = self.live.lock().await;
            match live.as_ref() {
                Some(connection) if self.is_connected() => connection.client.clone(),
                _ => return Err(BrokerError::NotConnected),
            }
        };

        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| {
                warn!("Publish to {} failed: {}", topic, e);
                BrokerError::PublishError(e.to_string())
            })?;

        debug!("Published to {}", topic);
        Ok(())
    }

    /// Subscribes to `filter` with QoS 0 and binds `handler` to it
    ///
    /// Waits for the SUBACK; the binding is rolled back if the subscription does
    /// not become active.
    pub async fn subscribe(
        &self,
        filter: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let live = self.live.lock().await;
        let connection = match live.as_ref() {
            Some(connection) if self.is_connected() => connection,
            _ => return Err(BrokerError::NotConnected),
        };
        let subscriptions = &connection.subscriptions;

        let previous = subscriptions.bind(filter, handler);
        let ack = subscriptions.expect_ack();

        if let Err(e) = connection.client.subscribe(filter, QoS::AtMostOnce).await {
            subscriptions.forget_last_ack();
            subscriptions.restore(filter, previous);
            warn!("Subscribe to {} failed: {}", filter, e);
            return Err(BrokerError::SubscribeError(e.to_string()));
        }

        let bound = self.settings.ack_timeout();
        let outcome = match tokio::time::timeout(bound, ack).await {
            Ok(Ok(codes)) if codes.iter().all(|c| !matches!(c, SubscribeReasonCode::Failure)) => {
                Ok(())
            }
            Ok(Ok(_)) => Err(BrokerError::SubscribeError(format!(
                "broker rejected subscription to '{}'",
                filter
            ))),
            Ok(Err(_)) => Err(BrokerError::NotConnected),
            Err(_) => Err(BrokerError::SubscribeError(format!(
                "no SUBACK within {:?}",
                bound
            ))),
        };

        match &outcome {
            Ok(()) => info!("Subscribed to {}", filter),
            Err(e) => {
                subscriptions.restore(filter, previous);
                warn!("Subscription to {} not active: {}", filter, e);
            }
        }
        outcome
    }

    fn next_client_id(&self) -> String {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{}{}", self.settings.client_id_prefix, nanos)
    }

    fn mqtt_options(
        &self,
        client_id: &str,
        address: &BrokerAddress,
        credentials: &BrokerCredentials,
    ) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, address.host.clone(), address.port);
        options
            .set_keep_alive(self.settings.keep_alive())
            .set_clean_session(true);
        if !credentials.username.is_empty() {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }
        if address.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BrokerError::ConnectRefused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(BrokerError::ConnectRefused(format!("{:?}", code)))
            }
            Err(e) => return Err(BrokerError::ConnectRefused(e.to_string())),
        }
    }
}

/// Network task of one live connection
///
/// Polls the event loop, hands publishes to the bound handlers and resolves SUBACK
/// waiters. Ends on DISCONNECT in either direction or on the first network error.
async fn drive_connection(
    mut eventloop: EventLoop,
    subscriptions: Arc<Subscriptions>,
    state: Arc<StateCell>,
    epoch: u64,
) {
    debug!("Network task for connection epoch {} started", epoch);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::received(publish.topic, publish.payload);
                let handled = subscriptions.dispatch(&message);
                if handled == 0 {
                    debug!("No handler bound for {}", message.topic());
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                subscriptions.resolve_ack(ack.return_codes);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("Broker closed the session");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if state.mark_lost(epoch) {
                    error!("Broker connection lost: {}", e);
                } else {
                    debug!("Retired connection ended: {}", e);
                }
                break;
            }
        }
    }

    state.mark_lost(epoch);
    subscriptions.drop_waiters();
    debug!("Network task for connection epoch {} finished", epoch);
}

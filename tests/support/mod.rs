//! Minimal in-process MQTT 3.1.1 broker for tests
//!
//! Speaks just enough of the protocol for one client library: CONNECT/CONNACK,
//! SUBSCRIBE/SUBACK, QoS 0 PUBLISH (echoed back to matching subscribers),
//! PINGREQ/PINGRESP and DISCONNECT. Packets are encoded and decoded with the
//! client library's own `mqttbytes` codec.

#![allow(dead_code)]

use bytes::BytesMut;
use mqtt_ws_bridge::mqtt::topic;
use mqtt_ws_bridge::BrokerSettings;
use parking_lot::Mutex;
use rumqttc::mqttbytes::v4::{self, ConnAck, Packet, PingResp, Publish, SubAck};
use rumqttc::mqttbytes::{self, QoS};
use rumqttc::{ConnectReturnCode, SubscribeReasonCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_PACKET_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub enum ConnackMode {
    Accept,
    /// Answer CONNACK with this return code
    Refuse(ConnectReturnCode),
    /// Never answer CONNECT
    Silent,
}

#[derive(Default)]
struct Shared {
    connects: usize,
    disconnects: usize,
    subscribed: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    reject_filters: Vec<String>,
    clients: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    kill: CancellationToken,
}

pub struct FakeBroker {
    pub addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
}

impl FakeBroker {
    pub async fn start(mode: ConnackMode) -> Self {
        Self::start_rejecting(mode, &[]).await
    }

    /// Answers SUBSCRIBE for any of `reject_filters` with a failure return code
    pub async fn start_rejecting(mode: ConnackMode, reject_filters: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Mutex::new(Shared {
            reject_filters: reject_filters.iter().map(|f| f.to_string()).collect(),
            ..Shared::default()
        }));

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_client(
                    stream,
                    mode.clone(),
                    Arc::clone(&accept_shared),
                ));
            }
        });

        Self { addr, shared }
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn connects(&self) -> usize {
        self.shared.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.shared.lock().disconnects
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.shared.lock().subscribed.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.shared.lock().published.clone()
    }

    /// Pushes a QoS 0 PUBLISH to every connected client
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        let frame = publish_frame(topic, payload);
        for client in self.shared.lock().clients.iter() {
            let _ = client.send(frame.clone());
        }
    }

    /// Drops every client connection without a DISCONNECT
    pub fn kill_clients(&self) {
        let mut shared = self.shared.lock();
        shared.kill.cancel();
        shared.kill = CancellationToken::new();
    }
}

pub fn test_settings() -> BrokerSettings {
    BrokerSettings {
        connect_timeout_ms: 500,
        disconnect_linger_ms: 100,
        ack_timeout_ms: 1000,
        ..BrokerSettings::default()
    }
}

/// Polls `condition` for up to two seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Address that refuses TCP connections
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Buffers socket reads until a whole packet can be decoded
struct PacketReader {
    reader: OwnedReadHalf,
    buffer: BytesMut,
}

impl PacketReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// `None` once the peer closed the socket or sent something undecodable
    async fn next(&mut self) -> Option<Packet> {
        loop {
            match v4::read(&mut self.buffer, MAX_PACKET_SIZE) {
                Ok(packet) => return Some(packet),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(_) => return None,
            }
            match self.reader.read_buf(&mut self.buffer).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }
}

async fn serve_client(stream: TcpStream, mode: ConnackMode, shared: Arc<Mutex<Shared>>) {
    let (reader, mut writer) = stream.into_split();
    let mut packets = PacketReader::new(reader);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let kill = shared.lock().kill.clone();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    match packets.next().await {
        Some(Packet::Connect(_)) => shared.lock().connects += 1,
        _ => return,
    }

    match mode {
        ConnackMode::Accept => {
            let _ = tx.send(connack_frame(ConnectReturnCode::Success));
        }
        ConnackMode::Refuse(code) => {
            let _ = tx.send(connack_frame(code));
            while packets.next().await.is_some() {}
            return;
        }
        ConnackMode::Silent => {
            while packets.next().await.is_some() {}
            return;
        }
    }

    shared.lock().clients.push(tx.clone());
    let mut filters: Vec<String> = Vec::new();

    loop {
        let packet = tokio::select! {
            _ = kill.cancelled() => break,
            packet = packets.next() => packet,
        };
        let Some(packet) = packet else { break };

        match packet {
            Packet::Subscribe(subscribe) => {
                let mut codes = Vec::with_capacity(subscribe.filters.len());
                for filter in subscribe.filters {
                    let rejected = shared.lock().reject_filters.contains(&filter.path);
                    if rejected {
                        codes.push(SubscribeReasonCode::Failure);
                    } else {
                        codes.push(SubscribeReasonCode::Success(QoS::AtMostOnce));
                        shared.lock().subscribed.push(filter.path.clone());
                        filters.push(filter.path);
                    }
                }
                let mut buffer = BytesMut::new();
                SubAck::new(subscribe.pkid, codes)
                    .write(&mut buffer)
                    .unwrap();
                let _ = tx.send(buffer.to_vec());
            }
            Packet::Publish(publish) => {
                let payload = publish.payload.to_vec();
                shared
                    .lock()
                    .published
                    .push((publish.topic.clone(), payload.clone()));
                if filters.iter().any(|f| topic::matches(f, &publish.topic)) {
                    let _ = tx.send(publish_frame(&publish.topic, &payload));
                }
            }
            Packet::PingReq => {
                let mut buffer = BytesMut::new();
                PingResp.write(&mut buffer).unwrap();
                let _ = tx.send(buffer.to_vec());
            }
            Packet::Disconnect => {
                shared.lock().disconnects += 1;
                break;
            }
            _ => {}
        }
    }

    shared.lock().clients.retain(|client| !client.same_channel(&tx));
    drop(tx);
    writer_task.abort();
}

fn connack_frame(code: ConnectReturnCode) -> Vec<u8> {
    let mut buffer = BytesMut::new();
    ConnAck::new(code, false).write(&mut buffer).unwrap();
    buffer.to_vec()
}

fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut buffer = BytesMut::new();
    Publish::new(topic, QoS::AtMostOnce, payload.to_vec())
        .write(&mut buffer)
        .unwrap();
    buffer.to_vec()
}

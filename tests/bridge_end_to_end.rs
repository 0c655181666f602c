mod support;

use chrono::NaiveDateTime;
use futures::StreamExt;
use mqtt_ws_bridge::{http, Bridge};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use support::{eventually, test_settings, ConnackMode, FakeBroker};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(bridge: Arc<Bridge>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let static_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("static");
    let router = http::build_router(bridge, &static_dir);
    tokio::spawn(http::serve(listener, router, std::future::pending::<()>()));
    addr
}

async fn open_feed(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{addr}/data")).await.unwrap();
    ws
}

async fn next_line(ws: &mut WsClient) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no frame within 2s")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return text.to_string();
        }
    }
}

async fn post(client: &reqwest::Client, url: String, body: Value) -> Value {
    client
        .post(url)
        .json(&body)
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap()
}

/// Splits `"<YYYY-MM-DD HH:MM:SS> <rest>"` and checks the timestamp parses
fn split_timestamp(line: &str) -> &str {
    let (stamp, rest) = line.split_at(19);
    NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S")
        .unwrap_or_else(|e| panic!("bad timestamp in {line:?}: {e}"));
    rest
}

#[tokio::test]
async fn published_message_reaches_websocket_client() {
    let broker = FakeBroker::start(ConnackMode::Accept).await;
    let bridge = Arc::new(Bridge::new(test_settings()));
    let addr = start_server(Arc::clone(&bridge)).await;
    let client = reqwest::Client::new();

    let mut ws = open_feed(addr).await;
    eventually("session registration", || bridge.registry().len() == 1).await;

    let reply = post(
        &client,
        format!("http://{addr}/mqtt"),
        json!({"username": "user", "password": "secret", "broker": broker.url()}),
    )
    .await;
    assert_eq!(reply["errcode"], 2000);

    let status: Value = client
        .get(format!("http://{addr}/mqtt/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["errcode"], 2000);
    assert_eq!(status["data"]["is_connected"], true);

    let reply = post(
        &client,
        format!("http://{addr}/mqtt/subscription"),
        json!({"topic": "sensors/temp"}),
    )
    .await;
    assert_eq!(reply["errcode"], 2000);

    let reply = post(
        &client,
        format!("http://{addr}/mqtt/message"),
        json!({"topic": "sensors/temp", "message": "21.5"}),
    )
    .await;
    assert_eq!(reply["errcode"], 2000);

    let line = next_line(&mut ws).await;
    assert_eq!(split_timestamp(&line), " sensors/temp: 21.5");

    ws.close(None).await.unwrap();
    eventually("session removal", || bridge.registry().is_empty()).await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn departed_client_does_not_affect_the_others() {
    let broker = FakeBroker::start(ConnackMode::Accept).await;
    let bridge = Arc::new(Bridge::new(test_settings()));
    let addr = start_server(Arc::clone(&bridge)).await;

    let mut staying = open_feed(addr).await;
    let mut leaving = open_feed(addr).await;
    eventually("two sessions", || bridge.registry().len() == 2).await;

    bridge
        .connect_broker(&mqtt_ws_bridge::mqtt::BrokerCredentials::new(
            "",
            "",
            broker.url(),
        ))
        .await
        .unwrap();
    bridge.subscribe("sensors/#").await.unwrap();

    broker.inject("sensors/a", b"first");
    assert_eq!(split_timestamp(&next_line(&mut staying).await), " sensors/a: first");
    assert_eq!(split_timestamp(&next_line(&mut leaving).await), " sensors/a: first");

    leaving.close(None).await.unwrap();
    drop(leaving);
    eventually("one session left", || bridge.registry().len() == 1).await;

    broker.inject("sensors/b", b"second");
    broker.inject("sensors/c", b"third");
    assert_eq!(split_timestamp(&next_line(&mut staying).await), " sensors/b: second");
    assert_eq!(split_timestamp(&next_line(&mut staying).await), " sensors/c: third");
    assert_eq!(bridge.registry().len(), 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn broker_errors_come_back_in_the_envelope() {
    let broker = FakeBroker::start(ConnackMode::Accept).await;
    let bridge = Arc::new(Bridge::new(test_settings()));
    let addr = start_server(Arc::clone(&bridge)).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/mqtt/message"))
        .json(&json!({"topic": "sensors/temp", "message": "21.5"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["errcode"], 4001);
    assert_eq!(reply["errmsg"], "not connected to a broker");

    let reply = post(
        &client,
        format!("http://{addr}/mqtt/subscription"),
        json!({"topic": "sensors/temp"}),
    )
    .await;
    assert_eq!(reply["errcode"], 4001);

    let connect = json!({"username": "user", "password": "secret", "broker": broker.url()});
    let reply = post(&client, format!("http://{addr}/mqtt"), connect.clone()).await;
    assert_eq!(reply["errcode"], 2000);
    let reply = post(&client, format!("http://{addr}/mqtt"), connect).await;
    assert_eq!(reply["errcode"], 4000);
    assert_eq!(reply["errmsg"], "already connected to a broker");

    let reply: Value = client
        .delete(format!("http://{addr}/mqtt"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["errcode"], 2000);
    assert_eq!(reply["errmsg"], "disconnected");

    let status: Value = client
        .get(format!("http://{addr}/mqtt/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["data"]["is_connected"], false);

    let reply = post(
        &client,
        format!("http://{addr}/mqtt"),
        json!({"broker": "http://not-an-mqtt-scheme"}),
    )
    .await;
    assert_eq!(reply["errcode"], 4000);
}

#[tokio::test]
async fn auxiliary_routes_answer() {
    let bridge = Arc::new(Bridge::new(test_settings()));
    let addr = start_server(bridge).await;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let hello: Value = client
        .get(format!("http://{addr}/hello"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(hello, json!({"msg": "hello"}));

    let index = client.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(index.status(), reqwest::StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(index.headers()["location"], "/static/");

    let page = client
        .get(format!("http://{addr}/static/index.html"))
        .send()
        .await
        .unwrap();
    assert_eq!(page.status(), reqwest::StatusCode::OK);
    assert!(page.text().await.unwrap().contains("/data"));
}

#[tokio::test]
async fn shutdown_closes_open_feeds() {
    let bridge = Arc::new(Bridge::new(test_settings()));
    let addr = start_server(Arc::clone(&bridge)).await;

    let mut ws = open_feed(addr).await;
    eventually("session registration", || bridge.registry().len() == 1).await;

    bridge.shutdown().await;
    eventually("session removal", || bridge.registry().is_empty()).await;

    let ended = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "feed stayed open after shutdown");
}

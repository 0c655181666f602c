use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Redirect};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::response::{ApiResponse, CODE_OK};
use super::socket;
use crate::bridge::Bridge;
use crate::mqtt::{BrokerCredentials, ConnectionState};

#[derive(Default, Deserialize)]
#[serde(default)]
pub struct ConnectForm {
    pub username: String,
    pub password: String,
    pub broker: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PublishForm {
    pub topic: String,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubscribeForm {
    pub topic: String,
}

pub async fn index() -> Redirect {
    Redirect::temporary("/static/")
}

pub async fn hello() -> impl IntoResponse {
    Json(json!({"msg": "hello"}))
}

pub async fn connect(
    State(bridge): State<Arc<Bridge>>,
    Json(form): Json<ConnectForm>,
) -> ApiResponse {
    let credentials = BrokerCredentials::new(form.username, form.password, form.broker);
    info!("Connect requested: {:?}", credentials);

    match bridge.connect_broker(&credentials).await {
        Ok(()) => ApiResponse::ok(),
        Err(e) => e.into(),
    }
}

pub async fn disconnect(State(bridge): State<Arc<Bridge>>) -> ApiResponse {
    bridge.disconnect_broker().await;
    ApiResponse::message(CODE_OK, "disconnected")
}

pub async fn status(State(bridge): State<Arc<Bridge>>) -> ApiResponse {
    let connected = bridge.broker_status() == ConnectionState::Connected;
    ApiResponse::with_data(json!({ "is_connected": connected }))
}

pub async fn publish(
    State(bridge): State<Arc<Bridge>>,
    Json(form): Json<PublishForm>,
) -> ApiResponse {
    debug!("Publish requested: {:?}", form);
    match bridge.publish(&form.topic, &form.message).await {
        Ok(()) => ApiResponse::message(CODE_OK, "success"),
        Err(e) => e.into(),
    }
}

pub async fn subscribe(
    State(bridge): State<Arc<Bridge>>,
    Json(form): Json<SubscribeForm>,
) -> ApiResponse {
    debug!("Subscribe requested: {:?}", form);
    match bridge.subscribe(&form.topic).await {
        Ok(()) => ApiResponse::message(CODE_OK, "success"),
        Err(e) => e.into(),
    }
}

pub async fn data(ws: WebSocketUpgrade, State(bridge): State<Arc<Bridge>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket::handle_socket(socket, bridge))
}

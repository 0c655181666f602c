use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::mqtt::BrokerError;

pub const CODE_OK: u16 = 2000;
/// Connecting to the broker failed
pub const CODE_CONNECT_FAILED: u16 = 4000;
/// Anything that needed a live connection failed
pub const CODE_BROKER_FAILED: u16 = 4001;

/// `{"errcode", "data", "errmsg"}` envelope; the HTTP status is always 200
#[derive(Debug, Serialize, PartialEq)]
pub struct ApiResponse {
    pub errcode: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self::with_data(json!({}))
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            errcode: CODE_OK,
            data: Some(data),
            errmsg: Some("success".to_string()),
        }
    }

    pub fn message(errcode: u16, errmsg: impl Into<String>) -> Self {
        Self {
            errcode,
            data: None,
            errmsg: Some(errmsg.into()),
        }
    }
}

impl From<BrokerError> for ApiResponse {
    fn from(error: BrokerError) -> Self {
        let errcode = match error {
            BrokerError::AlreadyConnected
            | BrokerError::ConnectTimeout(_)
            | BrokerError::ConnectRefused(_)
            | BrokerError::InvalidBrokerUrl(_) => CODE_CONNECT_FAILED,
            BrokerError::NotConnected
            | BrokerError::PublishError(_)
            | BrokerError::SubscribeError(_) => CODE_BROKER_FAILED,
        };
        Self {
            errcode,
            data: Some(json!({})),
            errmsg: Some(error.to_string()),
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

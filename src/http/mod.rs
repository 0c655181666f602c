//! HTTP and WebSocket front of the bridge
//!
//! | Route                     | Operation                      |
//! |---------------------------|--------------------------------|
//! | `POST /mqtt`              | connect to a broker            |
//! | `DELETE /mqtt`            | disconnect                     |
//! | `GET /mqtt/status`        | connection state               |
//! | `POST /mqtt/message`      | publish                        |
//! | `POST /mqtt/subscription` | subscribe and relay to clients |
//! | `GET /data`               | WebSocket feed of messages     |
//! | `GET /static/*`           | bundled web page               |

pub mod handlers;
pub mod response;
pub mod socket;

use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

use crate::bridge::Bridge;

pub fn build_router(bridge: Arc<Bridge>, static_dir: &Path) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/hello", get(handlers::hello))
        .route("/mqtt", post(handlers::connect).delete(handlers::disconnect))
        .route("/mqtt/status", get(handlers::status))
        .route("/mqtt/message", post(handlers::publish))
        .route("/mqtt/subscription", post(handlers::subscribe))
        .route("/data", get(handlers::data))
        .nest_service("/static", ServeDir::new(static_dir))
        .with_state(bridge)
        .layer(CorsLayer::permissive())
}

/// Serves `router` until `shutdown` resolves, then drains open connections
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    info!("Listening on {}", local_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

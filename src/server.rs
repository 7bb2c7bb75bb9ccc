use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bridge::{self, BridgeResponse, InboundRequest};
use crate::config::ServerConfig;
use crate::twilio::TwilioClient;

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<TwilioClient>,
}

impl IntoResponse for BridgeResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Decode the request body as JSON or form fields depending on its
/// content type. A body that is not an object or a form becomes an empty
/// request so the validator reports what is missing.
fn parse_inbound(headers: &HeaderMap, body: &[u8]) -> InboundRequest {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let parsed = if content_type.starts_with("application/x-www-form-urlencoded") {
        serde_urlencoded::from_bytes::<HashMap<String, String>>(body)
            .map(|fields| InboundRequest::from_form(&fields))
            .map_err(|e| e.to_string())
    } else {
        serde_json::from_slice::<Map<String, Value>>(body)
            .map(|fields| InboundRequest::from_json(&fields))
            .map_err(|e| e.to_string())
    };

    parsed.unwrap_or_else(|e| {
        if !body.is_empty() {
            warn!("Could not decode request body: {}", e);
        }
        InboundRequest::default()
    })
}

async fn handle_bridge(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> BridgeResponse {
    let request = parse_inbound(&headers, &body);
    bridge::run(&state.client, request).await
}

async fn health() -> &'static str {
    "ok"
}

pub fn router(config: &ServerConfig, state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::OPTIONS, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route(&config.path, post(handle_bridge))
        .route("/health", get(health))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(config: &ServerConfig, state: AppState) -> Result<()> {
    let app = router(config, state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;

    info!(
        "Bridge listening on http://{}{}",
        config.bind_address, config.path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Server error")?;

    Ok(())
}

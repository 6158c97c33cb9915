//! HTTP transport.
//!
//! Every request goes through a single fallback handler that turns it into
//! a [`RequestSnapshot`], hands it to the [`MockEngine`] and writes the
//! rendered response back.

use crate::engine::MockEngine;
use crate::render::MockResponse;
use crate::request::{Headers, RequestSnapshot};
use anyhow::Context;
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Maximum request body size: 10 MiB.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Router serving every path from `engine`.
pub fn router(engine: Arc<MockEngine>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Bind `address` and serve until Ctrl-C.
pub async fn serve(engine: Arc<MockEngine>, address: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(address = %listener.local_addr()?, "Mock server listening");

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Mock server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn handle(State(engine): State<Arc<MockEngine>>, request: Request) -> Response {
    let snapshot = match snapshot_from_request(request).await {
        Ok(snapshot) => snapshot,
        Err(response) => return into_http(response),
    };

    match engine.handle(snapshot) {
        Ok(response) => into_http(response),
        Err(e) => {
            error!(error = %e, kind = e.kind(), "Failed to render response");
            into_http(MockResponse::json(
                500,
                &json!({ "error": e.to_string(), "kind": e.kind() }),
            ))
        }
    }
}

/// Read the whole request into a snapshot. Oversized bodies yield a 413.
pub async fn snapshot_from_request(request: Request) -> Result<RequestSnapshot, MockResponse> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|_| MockResponse::error(413, "Payload Too Large"))?;

    let headers: Headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    Ok(
        RequestSnapshot::builder(parts.method.as_str(), parts.uri.path())
            .query_string(parts.uri.query().unwrap_or_default())
            .headers(headers)
            .raw_body(&bytes)
            .build(),
    )
}

fn into_http(response: MockResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http = (status, response.body).into_response();

    for (name, value) in response.headers.iter() {
        match (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                http.headers_mut().insert(name, value);
            }
            _ => warn!(header = name, "Skipping invalid response header"),
        }
    }
    http
}

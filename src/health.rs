//! `GET /health`, reporting whether the node subscription is up.
//!
//! The body follows the common `{status, info, error, details}` health
//! check layout with a single `node` indicator. Unhealthy answers use
//! `503 Service Unavailable`.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::connectivity::{ConnectivityHandle, ConnectivityStatus};

const NODE_INDICATOR: &str = "node";
const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorResult {
    pub status: IndicatorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub info: BTreeMap<String, IndicatorResult>,
    pub error: BTreeMap<String, IndicatorResult>,
    pub details: BTreeMap<String, IndicatorResult>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == OverallStatus::Ok
    }
}

/// Builds the report for the current connectivity state.
pub fn health_report(connectivity: &ConnectivityHandle) -> HealthReport {
    let node = match connectivity.status() {
        ConnectivityStatus::Connected => IndicatorResult {
            status: IndicatorStatus::Up,
            message: None,
        },
        ConnectivityStatus::Disconnected => IndicatorResult {
            status: IndicatorStatus::Down,
            message: Some("Node healthcheck failed: not connected".to_string()),
        },
        ConnectivityStatus::Terminated => IndicatorResult {
            status: IndicatorStatus::Down,
            message: Some("Node healthcheck failed: retries exhausted".to_string()),
        },
    };

    let mut details = BTreeMap::new();
    details.insert(NODE_INDICATOR.to_string(), node.clone());

    let (status, info, error) = if node.status == IndicatorStatus::Up {
        (OverallStatus::Ok, details.clone(), BTreeMap::new())
    } else {
        (OverallStatus::Error, BTreeMap::new(), details.clone())
    };

    HealthReport {
        status,
        info,
        error,
        details,
    }
}

async fn health_handler(State(connectivity): State<ConnectivityHandle>) -> impl IntoResponse {
    let report = health_report(&connectivity);
    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, [(header::CACHE_CONTROL, NO_CACHE)], Json(report))
}

pub fn router(connectivity: ConnectivityHandle) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(connectivity)
}

/// Binds the health listener. Done before anything is spawned so a taken
/// port fails startup.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health server to {}", addr))?;
    info!(
        "Health endpoint listening on http://{}/health",
        listener.local_addr()?
    );
    Ok(listener)
}

/// Serves the health endpoint until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    connectivity: ConnectivityHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router(connectivity))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("health server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connectivity::ConnectivityState;
    use serde_json::json;

    #[test]
    fn test_report_connected() {
        let state = ConnectivityState::new();
        state.set_connected(true);

        let report = health_report(&state.handle());
        assert!(report.is_healthy());
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "status": "ok",
                "info": {"node": {"status": "up"}},
                "error": {},
                "details": {"node": {"status": "up"}}
            })
        );
    }

    #[test]
    fn test_report_disconnected_and_terminated_differ() {
        let state = ConnectivityState::new();
        let disconnected = health_report(&state.handle());
        assert!(!disconnected.is_healthy());
        assert!(disconnected.info.is_empty());
        assert_eq!(disconnected.error["node"].status, IndicatorStatus::Down);

        state.set_terminated();
        let terminated = health_report(&state.handle());
        assert!(!terminated.is_healthy());
        assert_ne!(
            terminated.error["node"].message,
            disconnected.error["node"].message
        );
    }

    async fn spawn_server(state: &ConnectivityState) -> (SocketAddr, CancellationToken) {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, state.handle(), shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_bind_fails_when_port_is_taken() {
        let taken = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = bind(addr).await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to bind health server"));
    }

    #[tokio::test]
    async fn test_endpoint_status_codes_and_headers() {
        let state = ConnectivityState::new();
        let (addr, shutdown) = spawn_server(&state).await;
        let url = format!("http://{}/health", addr);
        let client = reqwest::Client::new();

        let down = client.get(&url).send().await.unwrap();
        assert_eq!(down.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(down.headers()["cache-control"], NO_CACHE);
        let body: HealthReport = down.json().await.unwrap();
        assert_eq!(body.status, OverallStatus::Error);

        state.set_connected(true);
        let up = client.get(&url).send().await.unwrap();
        assert_eq!(up.status(), reqwest::StatusCode::OK);
        let body: HealthReport = up.json().await.unwrap();
        assert!(body.is_healthy());

        shutdown.cancel();
    }
}

//! Status server: a small `axum` surface exposing `/api/status` and
//! `/api/audit` over the control surface, mirroring the teacher's
//! dashboard server but trimmed to JSON only (no HTML dashboard).

use std::net::SocketAddr;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use log::info;

use crate::chain::ChainDataSource;
use crate::persistence::GridPersistence;

use super::control::BotControl;

/// Binds and serves the status API until the process exits. Runs
/// alongside the cycle loop, never blocking it.
pub async fn start_server<C, P>(control: BotControl<C, P>, host: &str, port: u16)
where
    C: ChainDataSource + Send + Sync + 'static,
    P: GridPersistence + Send + Sync + 'static,
{
    let app = Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/audit", get(audit_handler))
        .with_state(control);

    let addr: SocketAddr = format!("{host}:{port}").parse().expect("invalid status server address");
    info!("status server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind status server");
    axum::serve(listener, app).await.expect("status server exited unexpectedly");
}

async fn status_handler<C, P>(State(control): State<BotControl<C, P>>) -> Json<serde_json::Value>
where
    C: ChainDataSource + Send + Sync + 'static,
    P: GridPersistence + Send + Sync + 'static,
{
    Json(serde_json::to_value(control.status().await).unwrap_or(serde_json::Value::Null))
}

async fn audit_handler<C, P>(State(control): State<BotControl<C, P>>) -> Json<serde_json::Value>
where
    C: ChainDataSource + Send + Sync + 'static,
    P: GridPersistence + Send + Sync + 'static,
{
    Json(serde_json::to_value(control.audit_log().await).unwrap_or(serde_json::Value::Null))
}

//! Maintenance HTTP façade
//!
//! - `GET /server-status` reports broker state, sessions and helper bot
//! - `GET /restart_{service}` restarts `MQTTServer` or `Helperbot`
//! - `GET /bot/remove/{did}` and `GET /client/remove/{userid}` drop records
//!
//! Every response is JSON with a `status` field.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::AppContext;

pub type WebState = Arc<AppContext>;

pub fn router(ctx: WebState) -> Router {
    Router::new()
        .route("/server-status", get(server_status))
        .route("/bot/remove/{did}", get(remove_bot))
        .route("/client/remove/{userid}", get(remove_client))
        .route("/{action}", get(restart_service))
        .with_state(ctx)
}

/// Serves the façade until `cancel` fires.
pub async fn serve(ctx: WebState, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind((ctx.settings.web.host.as_str(), ctx.settings.web.port)).await?;
    info!("Web server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

fn status(code: StatusCode, status: &str) -> Response {
    (code, Json(json!({ "status": status }))).into_response()
}

async fn server_status(State(ctx): State<WebState>) -> Response {
    let sessions = ctx.mqtt_server.sessions().await;
    let bound: Vec<String> = ctx
        .mqtt_server
        .bound_addrs()
        .await
        .iter()
        .map(|b| format!("{}{}", b.addr, if b.use_ssl { " (tls)" } else { "" }))
        .collect();

    Json(json!({
        "status": {
            "mqtt_server": {
                "state": ctx.mqtt_server.state().to_string(),
                "listeners": bound,
                "sessions": sessions,
            },
            "helperbot": {
                "connected": ctx.helper_bot.current().is_some(),
            },
            "proxy": {
                "enabled": ctx.bridge.is_enabled(),
                "clients": ctx.bridge.client_count().await,
            },
        }
    }))
    .into_response()
}

async fn restart_service(State(ctx): State<WebState>, AxumPath(action): AxumPath<String>) -> Response {
    let Some(service) = action.strip_prefix("restart_") else {
        return status(StatusCode::NOT_FOUND, "not found");
    };

    let result = match service {
        "Helperbot" => ctx.restart_helper_bot().await,
        "MQTTServer" => match ctx.restart_mqtt_server().await {
            Ok(()) => ctx.restart_helper_bot().await,
            Err(e) => Err(e),
        },
        other => {
            warn!("Restart requested for unknown service '{}'", other);
            return status(StatusCode::BAD_REQUEST, "invalid service");
        }
    };

    match result {
        Ok(()) => status(StatusCode::OK, "complete"),
        Err(e) => {
            error!("Restart of {} failed: {}", service, e);
            status(StatusCode::INTERNAL_SERVER_ERROR, "failed")
        }
    }
}

async fn remove_bot(State(ctx): State<WebState>, AxumPath(did): AxumPath<String>) -> Response {
    match ctx.repository.remove_bot(&did).await {
        Ok(true) => status(StatusCode::OK, "successfully removed bot"),
        Ok(false) => status(StatusCode::OK, "failed to remove bot"),
        Err(e) => {
            error!("Removing bot {} failed: {}", did, e);
            status(StatusCode::INTERNAL_SERVER_ERROR, "failed to remove bot")
        }
    }
}

async fn remove_client(State(ctx): State<WebState>, AxumPath(userid): AxumPath<String>) -> Response {
    match ctx.repository.remove_client(&userid).await {
        Ok(true) => status(StatusCode::OK, "successfully removed client"),
        Ok(false) => status(StatusCode::OK, "failed to remove client"),
        Err(e) => {
            error!("Removing client {} failed: {}", userid, e);
            status(StatusCode::INTERNAL_SERVER_ERROR, "failed to remove client")
        }
    }
}

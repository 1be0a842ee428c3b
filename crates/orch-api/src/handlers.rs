//! REST API handlers.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use orch_broker::{BrokerError, ResourceStatus};
use orch_core::epoch_secs;

use crate::ServiceContext;
use crate::error::ApiError;

const OCTET_STREAM: &str = "application/octet-stream";
const CA_CERT: &str = "application/x-x509-ca-cert";

fn attachment(bytes: Vec<u8>, file_name: &str, content_type: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response()
}

/// GET /
pub async fn index() -> impl IntoResponse {
    Json(json!({
        "service": "orch",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "checkout": "POST /resource/{id}",
            "release": "DELETE /resource/{id}",
            "status": "GET /resource/{id}/status",
            "validate": "GET /resource/{id}/validate",
            "health": "GET /status/health",
            "mappings": "GET /status/mappings",
            "ca_certificate": "GET /ca/certificate",
            "ca_info": "GET /ca/info",
            "ca_status": "GET /ca/status",
        },
    }))
}

// ── Resources ──────────────────────────────────────────────────

/// POST /resource/{id}
pub async fn checkout(
    State(ctx): State<ServiceContext>,
    Path(id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    let caller_ip = peer.ip().to_string();
    let grant = ctx.broker.checkout(&id, &caller_ip).await?;

    let bytes = match tokio::fs::read(&grant.artifact_path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let record = &grant.record;
            if let Err(rollback) = ctx.broker.store().release_if_held_by(
                &record.mapping_id,
                &record.concrete_name,
                &record.holder_container_id,
            ) {
                error!(%id, error = %rollback, "failed to roll back checkout");
            }
            return Err(BrokerError::Internal(format!(
                "failed to read {}: {e}",
                grant.artifact_path.display()
            ))
            .into());
        }
    };
    Ok(attachment(bytes, &grant.file_name(), OCTET_STREAM))
}

/// DELETE /resource/{id}
pub async fn release(
    State(ctx): State<ServiceContext>,
    Path(id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = ctx.broker.release(&id, &peer.ip().to_string()).await?;
    Ok(Json(json!({
        "message": "resource released",
        "resource_id": record.mapping_id,
        "resource_name": record.concrete_name,
        "container_id": record.holder_container_id,
    })))
}

/// GET /resource/{id}/status
pub async fn resource_status(
    State(ctx): State<ServiceContext>,
    Path(id): Path<String>,
) -> Result<Json<ResourceStatus>, ApiError> {
    Ok(Json(ctx.broker.status(&id).await?))
}

/// GET /resource/{id}/validate
pub async fn validate(
    State(ctx): State<ServiceContext>,
    Path(id): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller_ip = peer.ip().to_string();
    let decision = ctx.broker.validate_access(&id, &caller_ip).await?;
    Ok(Json(json!({
        "resource_id": id,
        "client_ip": caller_ip,
        "can_access": decision.can_access,
        "reason": decision.reason,
    })))
}

// ── Service status ─────────────────────────────────────────────

/// GET /status/health
pub async fn health(State(ctx): State<ServiceContext>) -> Response {
    let runtime = ctx.broker.resolver().runtime();

    let (database, mappings_loaded) = match ctx.broker.store().count_mappings() {
        Ok(count) => (Ok(()), count),
        Err(e) => (Err(e.to_string()), 0),
    };
    let container_client = runtime.ping().await.map_err(|e| e.to_string());

    let healthy = database.is_ok() && container_client.is_ok();
    let containers_cleaned = if healthy {
        ctx.sweeper.sweep_once().await
    } else {
        0
    };

    let describe = |r: &Result<(), String>| match r {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("error: {e}"),
    };
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "database": describe(&database),
        "container_client": describe(&container_client),
        "runtime": runtime.name(),
        "mappings_loaded": mappings_loaded,
        "containers_cleaned": containers_cleaned,
        "total_reclaimed": ctx.sweeper.stats().total_reclaimed(),
        "timestamp": epoch_secs(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(body)).into_response()
}

/// GET /status/mappings
pub async fn list_mappings(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mappings = ctx
        .broker
        .store()
        .list_mappings()
        .map_err(BrokerError::from)?;
    Ok(Json(json!({
        "count": mappings.len(),
        "mappings": mappings,
    })))
}

// ── Certificate authority ──────────────────────────────────────

/// GET /ca/certificate
pub async fn ca_certificate(State(ctx): State<ServiceContext>) -> Result<Response, ApiError> {
    let signing = ctx.broker.materializer().signing();
    signing
        .bootstrap()
        .await
        .map_err(|e| BrokerError::Internal(format!("CA bootstrap failed: {e}")))?;

    let path = signing.root_certificate_path();
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        BrokerError::Internal(format!("failed to read {}: {e}", path.display()))
    })?;
    Ok(attachment(bytes, "ca.crt", CA_CERT))
}

/// GET /ca/info
pub async fn ca_info(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let info = ctx
        .broker
        .materializer()
        .signing()
        .root_info()
        .map_err(|e| BrokerError::Internal(format!("failed to read CA certificate: {e}")))?
        .ok_or_else(|| BrokerError::NotFound {
            id: "ca_certificate".to_string(),
        })?;
    Ok(Json(json!({
        "ca_info": info,
        "requested_at": epoch_secs(),
    })))
}

/// GET /ca/status
pub async fn ca_status(State(ctx): State<ServiceContext>) -> impl IntoResponse {
    Json(ctx.broker.materializer().signing().status())
}

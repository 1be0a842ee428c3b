//! orch-api: REST API for the credential broker.
//!
//! Callers are identified by the peer address of the connection, so the
//! router must be served with
//! `into_make_service_with_connect_info::<SocketAddr>()`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Service index |
//! | POST | `/resource/{id}` | Check out a credential, returns the artifact |
//! | DELETE | `/resource/{id}` | Release the caller's lease |
//! | GET | `/resource/{id}/status` | Lease state and holder liveness |
//! | GET | `/resource/{id}/validate` | Whether the caller could use the resource |
//! | GET | `/status/health` | Store and runtime connectivity, runs a sweep |
//! | GET | `/health` | Alias of `/status/health` |
//! | GET | `/status/mappings` | Loaded resource mappings |
//! | GET | `/ca/certificate` | Root CA certificate |
//! | GET | `/ca/info` | Parsed root certificate details, 404 before bootstrap |
//! | GET | `/ca/status` | CA initialization state |

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use orch_broker::{CheckoutBroker, Sweeper};

pub use error::ApiError;

/// Everything the handlers need, built once at startup.
#[derive(Clone)]
pub struct ServiceContext {
    pub broker: Arc<CheckoutBroker>,
    pub sweeper: Arc<Sweeper>,
}

impl ServiceContext {
    pub fn new(broker: Arc<CheckoutBroker>, sweeper: Arc<Sweeper>) -> Self {
        Self { broker, sweeper }
    }
}

/// Build the complete API router.
pub fn build_router(ctx: ServiceContext) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route(
            "/resource/{id}",
            post(handlers::checkout).delete(handlers::release),
        )
        .route("/resource/{id}/status", get(handlers::resource_status))
        .route("/resource/{id}/validate", get(handlers::validate))
        .route("/status/health", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/status/mappings", get(handlers::list_mappings))
        .route("/ca/certificate", get(handlers::ca_certificate))
        .route("/ca/info", get(handlers::ca_info))
        .route("/ca/status", get(handlers::ca_status))
        .with_state(ctx)
}

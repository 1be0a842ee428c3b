//! JSON error envelope.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use orch_broker::BrokerError;

/// A [`BrokerError`] rendered as `{"error": {"code", "message", "details"}}`.
#[derive(Debug)]
pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            warn!(code = self.0.code(), error = %self.0, "request rejected");
        }
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
                "details": self.0.details(),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn envelope_shape() {
        let resp = ApiError(BrokerError::Conflict {
            id: "hub".into(),
            holder: "c1".into(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "RESOURCE_ALREADY_CHECKED_OUT");
        assert_eq!(body["error"]["details"]["holder"], "c1");
        assert!(body["error"]["message"].as_str().unwrap().contains("hub"));
    }

    #[tokio::test]
    async fn internal_errors_are_500() {
        let resp = ApiError(BrokerError::Internal("boom".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

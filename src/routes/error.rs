use crate::{
    gateway::GatewayError,
    records::StoreError,
    routes::upload::UploadError,
    runner::FailureStage,
};
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Json(#[from] JsonRejection),
    #[error("Invalid analysis record: {0}")]
    InvalidRecord(String),
    #[error("Missing user identity")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("Storage failure: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ApiError::Upload(UploadError::Multipart(e)) => (e.status(), e.body_text()),
            ApiError::Upload(e @ UploadError::TooLarge { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
            }
            ApiError::Upload(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Json(e) => (e.status(), e.body_text()),
            ApiError::InvalidRecord(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "missing user identity".into()),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what.clone()),
            ApiError::Gateway(GatewayError::Input(e)) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Gateway(GatewayError::Worker(failure)) => {
                let message = match failure.stage {
                    FailureStage::Spawn => "failed to start worker".to_string(),
                    FailureStage::NonZeroExit if !failure.diagnostic.trim().is_empty() => {
                        failure.diagnostic.clone()
                    }
                    FailureStage::NonZeroExit => "worker failed".to_string(),
                    FailureStage::Timeout => "worker timed out".to_string(),
                    FailureStage::StdinWrite => "worker did not receive input".to_string(),
                    FailureStage::Parse => "unexpected worker response".to_string(),
                };
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            ApiError::Gateway(GatewayError::Reported(message)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            }
            ApiError::Gateway(GatewayError::Response(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "unexpected worker response".into(),
            ),
            ApiError::Store(StoreError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                format!("analysis record {} not found", id),
            ),
            ApiError::Store(StoreError::Backend(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{payload::PayloadError, runner::WorkerFailure};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::Gateway(GatewayError::Input(PayloadError::NoImages)),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                ApiError::Gateway(GatewayError::Worker(WorkerFailure::new(
                    FailureStage::Timeout,
                    "worker timed out after 600s",
                ))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.status_and_message().0, expected);
        }
    }

    #[test]
    fn test_parse_failure_hides_raw_output() {
        let error = ApiError::Gateway(GatewayError::Worker(WorkerFailure::new(
            FailureStage::Parse,
            "Traceback (most recent call last): secret path",
        )));

        let (_, message) = error.status_and_message();
        assert_eq!(message, "unexpected worker response");
    }

    #[test]
    fn test_spawn_failure_message() {
        let error = ApiError::Gateway(GatewayError::Worker(WorkerFailure::new(
            FailureStage::Spawn,
            "No such file or directory (os error 2)",
        )));

        let (status, message) = error.status_and_message();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(message, "failed to start worker");
    }
}

mod error;
mod health;
mod history;
mod identity;
mod metrics;
mod upload;
mod workers;

pub use error::ApiError;
pub use identity::{UserId, USER_HEADER};

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/api/features/analyze", post(workers::analyze))
        .route("/api/features/select", post(workers::select))
        .route("/api/train", post(workers::train))
        .route("/api/predict", post(workers::predict))
        .route("/api/analysis/save", post(history::save))
        .route("/api/analysis/history", get(history::history))
        .route("/api/analysis/latest", get(history::latest))
        .route("/api/models/current", get(history::current_model))
}

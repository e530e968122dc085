use crate::{
    config::WorkerConfig,
    payload::{Operation, PayloadError, RequestPayload},
    runner::{Outcome, WorkerFailure, WorkerRunner},
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Input(#[from] PayloadError),
    #[error("worker failed at {} stage: {}", .0.stage, .0.diagnostic)]
    Worker(WorkerFailure),
    #[error("worker reported an error: {0}")]
    Reported(String),
    #[error("unexpected worker response: {0}")]
    Response(String),
}

impl GatewayError {
    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            GatewayError::Input(_) => "rejected",
            GatewayError::Worker(failure) => failure.stage.as_str(),
            GatewayError::Reported(_) => "reported",
            GatewayError::Response(_) => "parse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AnalysisResponse {
    Scores {
        features: Vec<String>,
        mi_scores: Vec<f64>,
    },
    Split {
        features_classical: Vec<String>,
        mi_classical: Vec<f64>,
        features_deep: Vec<String>,
        mi_deep: Vec<f64>,
    },
}

impl AnalysisResponse {
    fn check(&self) -> Result<(), GatewayError> {
        let aligned = match self {
            AnalysisResponse::Scores {
                features,
                mi_scores,
            } => features.len() == mi_scores.len(),
            AnalysisResponse::Split {
                features_classical,
                mi_classical,
                features_deep,
                mi_deep,
            } => {
                features_classical.len() == mi_classical.len()
                    && features_deep.len() == mi_deep.len()
            }
        };
        if aligned {
            Ok(())
        } else {
            Err(GatewayError::Response(
                "feature names and scores differ in length".into(),
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SelectionResponse {
    pub selected_features: Vec<String>,
    pub accuracies: Vec<f64>,
    pub final_accuracy: f64,
}

/// Architecture the network trainer builds when it does not name one.
const DEFAULT_NETWORK_ARCHITECTURE: &str = "MobileNetV2";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TrainingResponse {
    Network {
        cnn_accuracy: f64,
        #[serde(default)]
        logistic_accuracy: Option<f64>,
        #[serde(default)]
        loss_history: Option<Vec<f64>>,
        #[serde(default)]
        model_path: Option<String>,
        #[serde(default)]
        architecture: Option<String>,
    },
    Classifier {
        accuracy: f64,
        #[serde(default)]
        model_path: Option<String>,
        #[serde(default)]
        architecture: Option<String>,
    },
}

impl TrainingResponse {
    pub fn accuracy(&self) -> f64 {
        match self {
            TrainingResponse::Network { cnn_accuracy, .. } => *cnn_accuracy,
            TrainingResponse::Classifier { accuracy, .. } => *accuracy,
        }
    }

    /// Where the worker saved the trained model, if it saved one.
    pub fn model_path(&self) -> Option<&str> {
        match self {
            TrainingResponse::Network { model_path, .. }
            | TrainingResponse::Classifier { model_path, .. } => model_path.as_deref(),
        }
    }

    pub fn architecture(&self) -> Option<&str> {
        match self {
            TrainingResponse::Network {
                architecture,
                model_path,
                ..
            } => architecture
                .as_deref()
                .or(model_path.as_ref().map(|_| DEFAULT_NETWORK_ARCHITECTURE)),
            TrainingResponse::Classifier { architecture, .. } => architecture.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PredictionResponse {
    #[serde(alias = "predicted_class")]
    pub predicted_label: i64,
}

/// A successful worker answer: the body exactly as the worker printed it and
/// a typed view of the fields this service relies on.
#[derive(Debug, Clone)]
pub struct Completed<T> {
    pub body: Value,
    pub view: T,
}

/// Validates requests, launches the operation's worker through a
/// [`WorkerRunner`] and interprets what comes back.
#[derive(Clone)]
pub struct Gateway {
    runner: Arc<dyn WorkerRunner>,
    workers: WorkerConfig,
}

impl Gateway {
    pub fn new(runner: Arc<dyn WorkerRunner>, workers: WorkerConfig) -> Self {
        Self { runner, workers }
    }

    /// Runs one worker. Payloads that break the operation's preconditions are
    /// rejected before anything is spawned.
    #[instrument(skip(self, payload), fields(operation = operation.as_str(), images = payload.images.len()))]
    pub async fn invoke(
        &self,
        operation: Operation,
        payload: RequestPayload,
    ) -> Result<Outcome, PayloadError> {
        let payload = payload.prepare(operation)?;
        let body = payload.to_json()?;
        let script = self.workers.script_for(operation);
        Ok(self.runner.invoke(&script, body).await)
    }

    async fn run<T: DeserializeOwned>(
        &self,
        operation: Operation,
        payload: RequestPayload,
    ) -> Result<Completed<T>, GatewayError> {
        let body = match self.invoke(operation, payload).await? {
            Outcome::Success(body) => body,
            Outcome::Failure(failure) => return Err(GatewayError::Worker(failure)),
        };

        if let Some(message) = body.get("error").and_then(reported_error) {
            return Err(GatewayError::Reported(message));
        }

        let view = T::deserialize(&body).map_err(|e| GatewayError::Response(e.to_string()))?;
        Ok(Completed { body, view })
    }

    pub async fn analyze(
        &self,
        payload: RequestPayload,
    ) -> Result<Completed<AnalysisResponse>, GatewayError> {
        let completed = self.run::<AnalysisResponse>(Operation::Analyze, payload).await?;
        completed.view.check()?;
        Ok(completed)
    }

    pub async fn select(
        &self,
        payload: RequestPayload,
    ) -> Result<Completed<SelectionResponse>, GatewayError> {
        self.run(Operation::Select, payload).await
    }

    pub async fn train(
        &self,
        payload: RequestPayload,
    ) -> Result<Completed<TrainingResponse>, GatewayError> {
        self.run(Operation::Train, payload).await
    }

    pub async fn predict(
        &self,
        payload: RequestPayload,
    ) -> Result<Completed<PredictionResponse>, GatewayError> {
        self.run(Operation::Predict, payload).await
    }
}

/// Message of an in-band `error` value. `null`, `false`, `0` and `""` mean no error.
fn reported_error(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(text) if text.is_empty() => None,
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

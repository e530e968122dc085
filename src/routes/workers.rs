use crate::{
    gateway::{Completed, GatewayError},
    payload::Operation,
    records::{AnalysisRecord, NewRecord, StoreError, TrainingUpdate},
    routes::{error::ApiError, identity::UserId, upload::UploadForm},
    server::SharedState,
};
use axum::{
    extract::{Multipart, State},
    Json,
};
use serde_json::Value;
use std::{future::Future, time::Instant};
use tracing::instrument;

fn observe<T>(
    state: &SharedState,
    operation: Operation,
    result: &Result<Completed<T>, GatewayError>,
    started: Instant,
) {
    let outcome = match result {
        Ok(_) => "success",
        Err(e) => e.label(),
    };
    state.metrics.record_invocation(
        operation.as_str(),
        outcome,
        started.elapsed().as_millis() as u64,
    );
}

/// Record writes never fail the request; the worker result is returned either way.
async fn persist(
    state: &SharedState,
    operation: Operation,
    write: impl Future<Output = Result<AnalysisRecord, StoreError>>,
) {
    match write.await {
        Ok(record) => {
            tracing::debug!(record = %record.id, operation = operation.as_str(), "Analysis record saved")
        }
        Err(e) => {
            tracing::warn!(error = %e, operation = operation.as_str(), "Failed to save analysis record");
            state.metrics.record_write_failure(operation.as_str());
        }
    }
}

#[instrument(skip(state, user, multipart), fields(user = %user))]
pub async fn analyze(
    State(state): State<SharedState>,
    user: UserId,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = UploadForm::from_multipart(multipart, &state.upload).await?;
    let payload = form.labeled_payload()?;

    let started = Instant::now();
    let result = state.gateway.analyze(payload).await;
    observe(&state, Operation::Analyze, &result, started);

    Ok(Json(result?.body))
}

#[instrument(skip(state, user, multipart), fields(user = %user))]
pub async fn select(
    State(state): State<SharedState>,
    user: UserId,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = UploadForm::from_multipart(multipart, &state.upload).await?;
    let payload = form.labeled_payload()?;

    let started = Instant::now();
    let result = state.gateway.select(payload).await;
    observe(&state, Operation::Select, &result, started);
    let completed = result?;

    let selection = completed.view;
    let record = NewRecord {
        owner: user.to_string(),
        selected_features: selection.selected_features,
        accuracies: selection.accuracies,
        final_accuracy: Some(selection.final_accuracy),
        ..Default::default()
    };
    persist(&state, Operation::Select, state.store.create(record)).await;

    Ok(Json(completed.body))
}

#[instrument(skip(state, user, multipart), fields(user = %user))]
pub async fn train(
    State(state): State<SharedState>,
    user: UserId,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = UploadForm::from_multipart(multipart, &state.upload).await?;
    let record_id = form.record;
    let selected = form.selected.clone().unwrap_or_default();
    let payload = form.labeled_payload()?;

    let started = Instant::now();
    let result = state.gateway.train(payload).await;
    observe(&state, Operation::Train, &result, started);
    let completed = result?;

    let update = TrainingUpdate {
        accuracy: completed.view.accuracy(),
        model_path: completed.view.model_path().map(str::to_string),
        architecture: completed.view.architecture().map(str::to_string),
    };
    let store = state.store.clone();
    let owner = user.to_string();
    persist(&state, Operation::Train, async move {
        if let Some(id) = record_id {
            match store.append_training(&owner, id, update.clone()).await {
                Err(StoreError::NotFound(_)) => {
                    tracing::warn!(record = %id, "Record to update not found, saving a new one")
                }
                other => return other,
            }
        }
        store
            .create(NewRecord {
                owner,
                selected_features: selected,
                final_accuracy: Some(update.accuracy),
                model_path: update.model_path,
                architecture: update.architecture,
                ..Default::default()
            })
            .await
    })
    .await;

    Ok(Json(completed.body))
}

#[instrument(skip(state, user, multipart), fields(user = %user))]
pub async fn predict(
    State(state): State<SharedState>,
    user: UserId,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let form = UploadForm::from_multipart(multipart, &state.upload).await?;
    let payload = form.into_payload();

    let started = Instant::now();
    let result = state.gateway.predict(payload).await;
    observe(&state, Operation::Predict, &result, started);
    let completed = result?;

    let record = NewRecord {
        owner: user.to_string(),
        predicted_label: Some(completed.view.predicted_label),
        ..Default::default()
    };
    persist(&state, Operation::Predict, state.store.create(record)).await;

    Ok(Json(completed.body))
}

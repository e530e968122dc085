use crate::{
    records::{AnalysisRecord, NewRecord},
    routes::{error::ApiError, identity::UserId},
    server::SharedState,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::instrument;

/// Analysis result a user chose to keep, usually the body of an earlier analyze call.
#[derive(Debug, Deserialize)]
pub struct SaveAnalysis {
    features: Vec<String>,
    #[serde(alias = "miScores")]
    mi_scores: Vec<f64>,
    #[serde(default)]
    note: Option<String>,
}

impl SaveAnalysis {
    fn into_record(self, owner: &UserId) -> Result<NewRecord, ApiError> {
        if self.features.is_empty() || self.features.len() != self.mi_scores.len() {
            return Err(ApiError::InvalidRecord(format!(
                "{} features do not match {} scores",
                self.features.len(),
                self.mi_scores.len()
            )));
        }
        let note = self.note.map(|note| note.trim().to_string());
        Ok(NewRecord {
            owner: owner.to_string(),
            features: self.features,
            scores: self.mi_scores,
            note: note.filter(|note| !note.is_empty()),
            ..Default::default()
        })
    }
}

#[instrument(skip(state, user, body), fields(user = %user))]
pub async fn save(
    State(state): State<SharedState>,
    user: UserId,
    body: Result<Json<SaveAnalysis>, JsonRejection>,
) -> Result<(StatusCode, Json<AnalysisRecord>), ApiError> {
    let Json(analysis) = body?;
    let record = state.store.create(analysis.into_record(&user)?).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[instrument(skip(state, user), fields(user = %user))]
pub async fn history(
    State(state): State<SharedState>,
    user: UserId,
) -> Result<Json<Vec<AnalysisRecord>>, ApiError> {
    let records = state.store.history_for(user.as_str()).await?;
    Ok(Json(records))
}

#[instrument(skip(state, user), fields(user = %user))]
pub async fn latest(
    State(state): State<SharedState>,
    user: UserId,
) -> Result<Json<AnalysisRecord>, ApiError> {
    state
        .store
        .latest_for(user.as_str())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no analysis records".into()))
}

#[instrument(skip(state, user), fields(user = %user))]
pub async fn current_model(
    State(state): State<SharedState>,
    user: UserId,
) -> Result<Json<AnalysisRecord>, ApiError> {
    state
        .store
        .current_model_for(user.as_str())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("no trained model".into()))
}

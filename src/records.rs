use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("analysis record {0} not found")]
    NotFound(Uuid),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Summary of one completed worker invocation, owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub id: Uuid,
    pub owner: String,
    pub features: Vec<String>,
    pub scores: Vec<f64>,
    pub note: Option<String>,
    pub selected_features: Vec<String>,
    pub accuracies: Vec<f64>,
    pub final_accuracy: Option<f64>,
    pub model_path: Option<String>,
    pub architecture: Option<String>,
    pub predicted_label: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    sequence: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRecord {
    pub owner: String,
    /// Analyzed feature names, paired index by index with `scores`.
    pub features: Vec<String>,
    pub scores: Vec<f64>,
    pub note: Option<String>,
    pub selected_features: Vec<String>,
    pub accuracies: Vec<f64>,
    pub final_accuracy: Option<f64>,
    pub model_path: Option<String>,
    pub architecture: Option<String>,
    pub predicted_label: Option<i64>,
}

/// What a finished training adds to an existing record.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingUpdate {
    pub accuracy: f64,
    pub model_path: Option<String>,
    pub architecture: Option<String>,
}

#[async_trait]
pub trait AnalysisStore: Send + Sync + 'static {
    async fn create(&self, record: NewRecord) -> Result<AnalysisRecord, StoreError>;

    async fn get(&self, owner: &str, id: Uuid) -> Result<AnalysisRecord, StoreError>;

    /// Most recently written record of `owner`.
    async fn latest_for(&self, owner: &str) -> Result<Option<AnalysisRecord>, StoreError>;

    /// All records of `owner`, newest first.
    async fn history_for(&self, owner: &str) -> Result<Vec<AnalysisRecord>, StoreError>;

    async fn append_training(
        &self,
        owner: &str,
        id: Uuid,
        update: TrainingUpdate,
    ) -> Result<AnalysisRecord, StoreError>;

    /// Most recently written record of `owner` that points at a saved model.
    async fn current_model_for(&self, owner: &str) -> Result<Option<AnalysisRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct Records {
    next_sequence: u64,
    rows: Vec<AnalysisRecord>,
}

/// Process-local record store. Every write takes the lock once, so records
/// written concurrently stay separate and are ordered by write sequence.
#[derive(Debug, Default)]
pub struct InMemoryAnalysisStore {
    records: RwLock<Records>,
}

impl InMemoryAnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalysisStore for InMemoryAnalysisStore {
    async fn create(&self, record: NewRecord) -> Result<AnalysisRecord, StoreError> {
        let mut records = self.records.write();
        let sequence = records.next_sequence;
        records.next_sequence += 1;

        let row = AnalysisRecord {
            id: Uuid::new_v4(),
            owner: record.owner,
            features: record.features,
            scores: record.scores,
            note: record.note,
            selected_features: record.selected_features,
            accuracies: record.accuracies,
            final_accuracy: record.final_accuracy,
            model_path: record.model_path,
            architecture: record.architecture,
            predicted_label: record.predicted_label,
            created_at: Utc::now(),
            updated_at: None,
            sequence,
        };
        records.rows.push(row.clone());
        Ok(row)
    }

    async fn get(&self, owner: &str, id: Uuid) -> Result<AnalysisRecord, StoreError> {
        self.records
            .read()
            .rows
            .iter()
            .find(|row| row.id == id && row.owner == owner)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn latest_for(&self, owner: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .rows
            .iter()
            .filter(|row| row.owner == owner)
            .max_by_key(|row| row.sequence)
            .cloned())
    }

    async fn history_for(&self, owner: &str) -> Result<Vec<AnalysisRecord>, StoreError> {
        let mut history: Vec<AnalysisRecord> = self
            .records
            .read()
            .rows
            .iter()
            .filter(|row| row.owner == owner)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(history)
    }

    async fn append_training(
        &self,
        owner: &str,
        id: Uuid,
        update: TrainingUpdate,
    ) -> Result<AnalysisRecord, StoreError> {
        let mut records = self.records.write();
        let sequence = records.next_sequence;
        let row = records
            .rows
            .iter_mut()
            .find(|row| row.id == id && row.owner == owner)
            .ok_or(StoreError::NotFound(id))?;
        row.final_accuracy = Some(update.accuracy);
        if update.model_path.is_some() {
            row.model_path = update.model_path;
            row.architecture = update.architecture;
        }
        row.updated_at = Some(Utc::now());
        // An update counts as the owner's latest write.
        row.sequence = sequence;
        let updated = row.clone();
        records.next_sequence += 1;
        Ok(updated)
    }

    async fn current_model_for(&self, owner: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .rows
            .iter()
            .filter(|row| row.owner == owner && row.model_path.is_some())
            .max_by_key(|row| row.sequence)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn selection(owner: &str, accuracy: f64) -> NewRecord {
        NewRecord {
            owner: owner.into(),
            selected_features: vec!["avg_r".into(), "std_gray".into()],
            accuracies: vec![0.6, accuracy],
            final_accuracy: Some(accuracy),
            ..Default::default()
        }
    }

    fn trained(accuracy: f64, model_path: Option<&str>) -> TrainingUpdate {
        TrainingUpdate {
            accuracy,
            model_path: model_path.map(str::to_string),
            architecture: model_path.map(|_| "MobileNetV2".to_string()),
        }
    }

    #[tokio::test]
    async fn test_latest_and_history_are_per_owner() {
        let store = InMemoryAnalysisStore::new();
        let first = store.create(selection("alice", 0.7)).await.unwrap();
        store.create(selection("bob", 0.9)).await.unwrap();
        let second = store.create(selection("alice", 0.8)).await.unwrap();

        let latest = store.latest_for("alice").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        let history = store.history_for("alice").await.unwrap();
        let ids: Vec<Uuid> = history.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);

        assert!(store.latest_for("carol").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_training_only_for_owner() {
        let store = InMemoryAnalysisStore::new();
        let record = store.create(selection("alice", 0.7)).await.unwrap();

        let err = store
            .append_training("bob", record.id, trained(0.99, None))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(record.id));

        let updated = store
            .append_training("alice", record.id, trained(0.85, None))
            .await
            .unwrap();
        assert_eq!(updated.final_accuracy, Some(0.85));
        assert!(updated.updated_at.is_some());
        assert_eq!(updated.accuracies, record.accuracies);
        assert_eq!(updated.created_at, record.created_at);

        assert_eq!(store.get("alice", record.id).await.unwrap(), updated);
        assert!(store.get("bob", record.id).await.is_err());
    }

    #[tokio::test]
    async fn test_current_model_is_latest_record_with_a_model() {
        let store = InMemoryAnalysisStore::new();
        assert!(store.current_model_for("alice").await.unwrap().is_none());

        let first = store.create(selection("alice", 0.7)).await.unwrap();
        let second = store.create(selection("alice", 0.8)).await.unwrap();
        store
            .append_training("alice", first.id, trained(0.9, Some("models/a.pt")))
            .await
            .unwrap();
        store
            .append_training("alice", second.id, trained(0.6, None))
            .await
            .unwrap();

        let current = store.current_model_for("alice").await.unwrap().unwrap();
        assert_eq!(current.id, first.id);
        assert_eq!(current.model_path.as_deref(), Some("models/a.pt"));
        assert_eq!(current.architecture.as_deref(), Some("MobileNetV2"));

        // Updates are writes too: the record trained last is the latest one.
        let latest = store.latest_for("alice").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(store.current_model_for("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writes_stay_separate() {
        let store = Arc::new(InMemoryAnalysisStore::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create(NewRecord {
                            owner: "alice".into(),
                            final_accuracy: Some(i as f64 / 100.0),
                            ..Default::default()
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut written = Vec::new();
        for handle in handles {
            written.push(handle.await.unwrap());
        }

        let history = store.history_for("alice").await.unwrap();
        assert_eq!(history.len(), 16);
        for record in &written {
            let stored = history.iter().find(|r| r.id == record.id).unwrap();
            assert_eq!(stored, record);
        }

        let last_written = written.iter().max_by_key(|r| r.sequence).unwrap();
        let latest = store.latest_for("alice").await.unwrap().unwrap();
        assert_eq!(latest.id, last_written.id);
    }
}

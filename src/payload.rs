use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PayloadError {
    #[error("at least one image is required")]
    NoImages,
    #[error("exactly one image is required, got {0}")]
    SingleImageExpected(usize),
    #[error("number of images ({images}) does not match number of labels ({labels})")]
    LabelCountMismatch { images: usize, labels: usize },
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Predict,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Predict => "predict",
        }
    }
}

/// The four things a worker can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Analyze,
    Select,
    Train,
    Predict,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Analyze => "analyze",
            Operation::Select => "select",
            Operation::Train => "train",
            Operation::Predict => "predict",
        }
    }

    pub fn mode(&self) -> Option<Mode> {
        match self {
            Operation::Train => Some(Mode::Train),
            Operation::Predict => Some(Mode::Predict),
            Operation::Analyze | Operation::Select => None,
        }
    }

    pub fn requires_labels(&self) -> bool {
        !matches!(self, Operation::Predict)
    }
}

/// JSON document written to the worker's stdin.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RequestPayload {
    pub images: Vec<String>,
    pub labels: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classnames: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finetune: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl RequestPayload {
    pub fn from_raw_images<I, B>(images: I, labels: Vec<i64>) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        Self {
            images: images.into_iter().map(|b| STANDARD.encode(b)).collect(),
            labels,
            ..Default::default()
        }
    }

    /// Fills the fields a given operation's worker expects and checks the
    /// preconditions that must hold before any process is started.
    pub fn prepare(mut self, operation: Operation) -> Result<Self, PayloadError> {
        self.validate(operation)?;
        self.mode = operation.mode();
        if operation == Operation::Predict {
            self.image = self.images.first().cloned();
        }
        Ok(self)
    }

    pub fn validate(&self, operation: Operation) -> Result<(), PayloadError> {
        if self.images.is_empty() {
            return Err(PayloadError::NoImages);
        }
        if operation == Operation::Predict && self.images.len() != 1 {
            return Err(PayloadError::SingleImageExpected(self.images.len()));
        }
        if operation.requires_labels() && self.images.len() != self.labels.len() {
            return Err(PayloadError::LabelCountMismatch {
                images: self.images.len(),
                labels: self.labels.len(),
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(|e| PayloadError::Encode(e.to_string()))
    }
}

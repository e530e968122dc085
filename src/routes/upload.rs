use crate::{config::UploadConfig, payload::RequestPayload};
use axum::{
    body::Bytes,
    extract::multipart::{Field, Multipart, MultipartError},
};
use image::ImageFormat;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Only jpg/jpeg/png images are accepted ({0})")]
    NotAnImage(String),
    #[error("File {name} exceeds the {limit} byte limit")]
    TooLarge { name: String, limit: usize },
    #[error("Field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Field `{0}` is required")]
    MissingField(&'static str),
}

/// Fields of a worker request after the multipart body has been read.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub images: Vec<Bytes>,
    pub labels: Option<Vec<i64>>,
    pub selected: Option<Vec<String>>,
    pub classnames: Option<Vec<String>>,
    pub finetune: Option<bool>,
    pub metric: Option<String>,
    pub record: Option<Uuid>,
}

impl UploadForm {
    pub async fn from_multipart(
        mut multipart: Multipart,
        limits: &UploadConfig,
    ) -> Result<Self, UploadError> {
        let mut form = UploadForm::default();

        while let Some(mut field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "images" | "images[]" | "image" => {
                    let file_name = field
                        .file_name()
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("{} #{}", name, form.images.len() + 1));
                    let bytes = read_limited(&mut field, &file_name, limits.max_file_bytes).await?;
                    form.images.push(check_image(file_name, bytes, limits)?);
                }
                "labels" => form.labels = parse_json("labels", &field.text().await?)?,
                "selected" => form.selected = parse_json("selected", &field.text().await?)?,
                "classnames" => form.classnames = parse_json("classnames", &field.text().await?)?,
                "finetune" => form.finetune = Some(parse_flag(&field.text().await?)?),
                "metric" => {
                    let metric = field.text().await?.trim().to_string();
                    form.metric = (!metric.is_empty()).then_some(metric);
                }
                "record" => {
                    let text = field.text().await?;
                    let id = Uuid::parse_str(text.trim()).map_err(|e| UploadError::InvalidField {
                        field: "record",
                        reason: e.to_string(),
                    })?;
                    form.record = Some(id);
                }
                other => tracing::debug!(field = other, "Ignoring unknown form field"),
            }
        }

        Ok(form)
    }

    /// Payload for operations that train or score against labels.
    pub fn labeled_payload(self) -> Result<RequestPayload, UploadError> {
        if self.labels.is_none() {
            return Err(UploadError::MissingField("labels"));
        }
        Ok(self.into_payload())
    }

    pub fn into_payload(self) -> RequestPayload {
        let mut payload =
            RequestPayload::from_raw_images(&self.images, self.labels.unwrap_or_default());
        payload.selected = self.selected;
        payload.classnames = self.classnames;
        payload.finetune = self.finetune;
        payload.metric = self.metric;
        payload
    }
}

/// Reads a file part chunk by chunk, giving up as soon as it passes `limit`.
async fn read_limited(
    field: &mut Field<'_>,
    name: &str,
    limit: usize,
) -> Result<Bytes, UploadError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        if buffer.len() + chunk.len() > limit {
            return Err(UploadError::TooLarge {
                name: name.to_string(),
                limit,
            });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}

fn check_image(name: String, bytes: Bytes, limits: &UploadConfig) -> Result<Bytes, UploadError> {
    if bytes.len() > limits.max_file_bytes {
        return Err(UploadError::TooLarge {
            name,
            limit: limits.max_file_bytes,
        });
    }
    match image::guess_format(&bytes) {
        Ok(ImageFormat::Png | ImageFormat::Jpeg) => Ok(bytes),
        _ => Err(UploadError::NotAnImage(name)),
    }
}

fn parse_json<T: DeserializeOwned>(
    field: &'static str,
    text: &str,
) -> Result<Option<T>, UploadError> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| UploadError::InvalidField {
            field,
            reason: e.to_string(),
        })
}

fn parse_flag(text: &str) -> Result<bool, UploadError> {
    match text.trim().to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(UploadError::InvalidField {
            field: "finetune",
            reason: format!("expected true or false, got `{}`", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    #[test]
    fn test_check_image_accepts_png_and_rejects_text() {
        let limits = UploadConfig::default();

        assert!(check_image("a.png".into(), Bytes::from_static(PNG_MAGIC), &limits).is_ok());
        assert!(matches!(
            check_image("notes.txt".into(), Bytes::from_static(b"hello"), &limits),
            Err(UploadError::NotAnImage(name)) if name == "notes.txt"
        ));
    }

    #[test]
    fn test_check_image_enforces_size_limit() {
        let limits = UploadConfig {
            max_file_bytes: 4,
            ..Default::default()
        };

        assert!(matches!(
            check_image("a.png".into(), Bytes::from_static(PNG_MAGIC), &limits),
            Err(UploadError::TooLarge { limit: 4, .. })
        ));
    }

    #[test]
    fn test_parse_json_fields() {
        let labels: Option<Vec<i64>> = parse_json("labels", "[0, 1, 1]").unwrap();
        assert_eq!(labels, Some(vec![0, 1, 1]));

        let empty: Option<Vec<String>> = parse_json("selected", "  ").unwrap();
        assert_eq!(empty, None);

        let broken = parse_json::<Vec<i64>>("labels", "[0, 1");
        assert!(matches!(
            broken,
            Err(UploadError::InvalidField { field: "labels", .. })
        ));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true").unwrap());
        assert!(!parse_flag("false").unwrap());
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn test_labeled_payload_requires_labels() {
        let form = UploadForm {
            images: vec![Bytes::from_static(PNG_MAGIC)],
            ..Default::default()
        };

        assert!(matches!(
            form.labeled_payload(),
            Err(UploadError::MissingField("labels"))
        ));
    }
}

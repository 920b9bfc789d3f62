use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::detection::{DetectionError, DetectionService};
use crate::object_store::{key_basename, ObjectStore, ObjectStoreError};
use crate::record_store::{RecordStore, RecordStoreError};
use crate::status::{ProcessingStatus, StatusTracker, ANALYSIS_PROCESS};

/// Event source marking a pub/sub notification record
const SNS_EVENT_SOURCE: &str = "aws:sns";
/// Event name prefix denoting object creation
const OBJECT_CREATED_PREFIX: &str = "ObjectCreated";

/// Errors that invalidate a whole notification batch
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Failed to parse notification envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("Failed to parse storage event message: {0}")]
    Message(#[source] serde_json::Error),

    #[error("Notification record is missing its payload")]
    MissingPayload,

    #[error("Failed to decode object key: {0}")]
    Key(String),
}

/// Errors caught at per-image granularity
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Metadata(#[from] ObjectStoreError),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Persistence(#[from] RecordStoreError),
}

/// Outer pub/sub envelope wrapping storage notifications
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Records")]
    records: Vec<EnvelopeRecord>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeRecord {
    #[serde(rename = "EventSource")]
    event_source: String,
    #[serde(rename = "Sns")]
    sns: Option<SnsPayload>,
}

#[derive(Debug, Deserialize)]
struct SnsPayload {
    /// JSON-encoded storage event message
    #[serde(rename = "Message")]
    message: String,
}

/// Storage event message carried inside the envelope
#[derive(Debug, Deserialize)]
struct StorageEventMessage {
    #[serde(rename = "Records")]
    records: Vec<StorageEventRecord>,
}

#[derive(Debug, Deserialize)]
struct StorageEventRecord {
    #[serde(rename = "eventName")]
    event_name: String,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectEntity {
    key: String,
}

/// Per-batch processing tally
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: usize,
    pub failed: usize,
}

struct EventFailure {
    /// Set once an image record exists to attribute the failure to
    image_id: Option<i64>,
    error: ProcessError,
}

/// Drives one storage notification batch through metadata lookup,
/// detection, and persistence.
pub struct EventProcessor {
    objects: Arc<dyn ObjectStore>,
    detector: Arc<dyn DetectionService>,
    records: Arc<dyn RecordStore>,
    tracker: StatusTracker,
}

impl EventProcessor {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        detector: Arc<dyn DetectionService>,
        records: Arc<dyn RecordStore>,
        tracker: StatusTracker,
    ) -> Self {
        Self {
            objects,
            detector,
            records,
            tracker,
        }
    }

    /// Process every object-creation notification in the envelope.
    /// Individual image failures are recorded and counted without
    /// aborting the rest of the batch; a malformed envelope fails the
    /// batch as a whole.
    #[instrument(skip(self, payload))]
    pub async fn handle_envelope(&self, payload: &[u8]) -> Result<BatchOutcome, EnvelopeError> {
        let envelope: Envelope =
            serde_json::from_slice(payload).map_err(EnvelopeError::Envelope)?;

        let mut outcome = BatchOutcome::default();

        for record in &envelope.records {
            if record.event_source != SNS_EVENT_SOURCE {
                debug!(source = %record.event_source, "Skipping non-notification record");
                continue;
            }

            let sns = record.sns.as_ref().ok_or(EnvelopeError::MissingPayload)?;
            let message: StorageEventMessage =
                serde_json::from_str(&sns.message).map_err(EnvelopeError::Message)?;

            for event in &message.records {
                if !event.event_name.starts_with(OBJECT_CREATED_PREFIX) {
                    debug!(event = %event.event_name, "Skipping non-creation event");
                    continue;
                }

                let bucket = &event.s3.bucket.name;
                let key = decode_key(&event.s3.object.key)?;

                info!(bucket = %bucket, key = %key, "Processing storage event");

                match self.process_event(bucket, &key).await {
                    Ok(image_id) => {
                        outcome.processed += 1;
                        metrics::counter!("pictor.images.processed").increment(1);
                        info!(image_id = image_id, key = %key, "Image processed");
                    }
                    Err(failure) => {
                        outcome.failed += 1;
                        metrics::counter!("pictor.images.failed").increment(1);
                        error!(key = %key, error = %failure.error, "Failed to process image");

                        if let Some(image_id) = failure.image_id {
                            self.tracker
                                .record(
                                    image_id,
                                    ProcessingStatus::Failed,
                                    Some(&format!("Processing failed: {}", failure.error)),
                                    None,
                                )
                                .await;
                        }
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Run one image through the pipeline: metadata, record resolution,
    /// detection, persistence, status bookkeeping.
    #[instrument(skip(self))]
    async fn process_event(&self, bucket: &str, key: &str) -> Result<i64, EventFailure> {
        let info = self.objects.object_info(key).await.map_err(|e| EventFailure {
            image_id: None,
            error: e.into(),
        })?;

        let original_name = info
            .original_name
            .unwrap_or_else(|| key_basename(key).to_string());
        let upload_time = info.upload_time.unwrap_or_else(Utc::now);

        let resolved = self
            .records
            .resolve_or_create_image(key, &original_name, info.file_size, upload_time)
            .await
            .map_err(|e| EventFailure {
                image_id: None,
                error: e.into(),
            })?;

        if resolved.created {
            // The row is already 'pending' at creation; announce it
            // without re-writing the status column.
            self.tracker
                .log_event(
                    resolved.id,
                    ANALYSIS_PROCESS,
                    "pending",
                    Some("Image record created"),
                )
                .await;
        }

        self.tracker
            .record(
                resolved.id,
                ProcessingStatus::Processing,
                Some("Analysis started"),
                None,
            )
            .await;

        let started = std::time::Instant::now();
        let analysis = self
            .detector
            .analyze_image(bucket, key)
            .await
            .map_err(|e| EventFailure {
                image_id: Some(resolved.id),
                error: e.into(),
            })?;
        metrics::histogram!("pictor.analysis.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        self.records
            .save_analysis(resolved.id, &analysis)
            .await
            .map_err(|e| EventFailure {
                image_id: Some(resolved.id),
                error: e.into(),
            })?;

        self.tracker
            .record(
                resolved.id,
                ProcessingStatus::Completed,
                Some("Processing completed successfully"),
                Some(Utc::now()),
            )
            .await;

        Ok(resolved.id)
    }
}

/// Storage keys arrive percent-encoded with spaces as '+'
fn decode_key(raw: &str) -> Result<String, EnvelopeError> {
    let plus_decoded = raw.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| EnvelopeError::Key(e.to_string()))
}

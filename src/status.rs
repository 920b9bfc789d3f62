use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

use crate::record_store::RecordStore;

/// Process tag for audit entries written by the analysis pipeline
pub const ANALYSIS_PROCESS: &str = "analysis";
/// Process tag for audit entries written by the upload handler
pub const UPLOAD_PROCESS: &str = "upload";

/// Per-image processing status.
///
/// The lifecycle is `pending -> processing -> completed`, with `failed`
/// reachable from either non-terminal state and uploads completing
/// straight from `pending`. `completed` and `failed` are terminal for a
/// given processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Error)]
#[error("Unknown processing status: {0}")]
pub struct UnknownStatus(String);

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal successor state. Uploads complete
    /// straight from `pending`, skipping the `processing` write.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::Pending, Self::Processing | Self::Completed) => true,
            (Self::Processing, Self::Completed) => true,
            (Self::Pending | Self::Processing, Self::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Writes status transitions and audit entries on behalf of the
/// pipeline. Writes are best-effort: a failed write is logged and
/// swallowed so it never masks the error being recorded.
#[derive(Clone)]
pub struct StatusTracker {
    records: Arc<dyn RecordStore>,
}

impl StatusTracker {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Record a status transition: updates the image row and appends
    /// the audit entry under the analysis process tag. A write the
    /// transition matrix does not allow still lands, with a warning.
    pub async fn record(
        &self,
        image_id: i64,
        status: ProcessingStatus,
        message: Option<&str>,
        processed_at: Option<DateTime<Utc>>,
    ) {
        match self
            .records
            .record_status(image_id, ANALYSIS_PROCESS, status.as_str(), message, processed_at)
            .await
        {
            Ok(previous) => {
                if let Some(Ok(prior)) = previous.as_deref().map(str::parse::<ProcessingStatus>) {
                    if !prior.can_transition_to(status) {
                        warn!(
                            image_id = image_id,
                            from = %prior,
                            to = %status,
                            "Out-of-order status transition recorded"
                        );
                    }
                }
            }
            Err(e) => {
                error!(
                    image_id = image_id,
                    status = %status,
                    error = %e,
                    "Failed to record status transition"
                );
            }
        }
    }

    /// Append an audit entry without changing the image's status
    pub async fn log_event(
        &self,
        image_id: i64,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) {
        if let Err(e) = self
            .records
            .append_log(image_id, process_type, status, message)
            .await
        {
            error!(
                image_id = image_id,
                process_type = process_type,
                error = %e,
                "Failed to append processing log entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_store::{
        ImageWithDetections, RecordStoreError, ResolvedImage,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ] {
            let parsed: ProcessingStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!("done".parse::<ProcessingStatus>().is_err());
        assert!("".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ProcessingStatus::Pending.is_terminal());
        assert!(!ProcessingStatus::Processing.is_terminal());
        assert!(ProcessingStatus::Completed.is_terminal());
        assert!(ProcessingStatus::Failed.is_terminal());
    }

    #[test]
    fn test_transition_matrix() {
        use ProcessingStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        // Uploads record completion without a processing write
        assert!(Pending.can_transition_to(Completed));

        // No going back, no repeats, no leaving terminal states
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
    }

    /// Store whose writes always fail, for exercising the swallow path
    struct FailingStore;

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn resolve_or_create_image(
            &self,
            _s3_key: &str,
            _original_name: &str,
            _file_size: i64,
            _upload_time: DateTime<Utc>,
        ) -> Result<ResolvedImage, RecordStoreError> {
            Err(RecordStoreError::Query(sqlx::Error::PoolClosed))
        }

        async fn record_status(
            &self,
            _image_id: i64,
            _process_type: &str,
            _status: &str,
            _message: Option<&str>,
            _processed_at: Option<DateTime<Utc>>,
        ) -> Result<Option<String>, RecordStoreError> {
            Err(RecordStoreError::Query(sqlx::Error::PoolClosed))
        }

        async fn append_log(
            &self,
            _image_id: i64,
            _process_type: &str,
            _status: &str,
            _message: Option<&str>,
        ) -> Result<(), RecordStoreError> {
            Err(RecordStoreError::Query(sqlx::Error::PoolClosed))
        }

        async fn save_analysis(
            &self,
            _image_id: i64,
            _analysis: &crate::detection::ImageAnalysis,
        ) -> Result<(), RecordStoreError> {
            Err(RecordStoreError::Query(sqlx::Error::PoolClosed))
        }

        async fn fetch_all_with_detections(
            &self,
        ) -> Result<Vec<ImageWithDetections>, RecordStoreError> {
            Err(RecordStoreError::Query(sqlx::Error::PoolClosed))
        }

        async fn health_check(&self) -> Result<(), RecordStoreError> {
            Err(RecordStoreError::Query(sqlx::Error::PoolClosed))
        }
    }

    #[tokio::test]
    async fn test_tracker_swallows_store_errors() {
        let tracker = StatusTracker::new(Arc::new(FailingStore));

        // Neither call should panic or propagate the store failure
        tracker
            .record(1, ProcessingStatus::Failed, Some("boom"), None)
            .await;
        tracker.log_event(1, UPLOAD_PROCESS, "completed", None).await;
    }

    /// Store that reports a fixed prior status and records every write
    struct PriorStatusStore {
        prior: &'static str,
        writes: Mutex<Vec<String>>,
    }

    impl PriorStatusStore {
        fn new(prior: &'static str) -> Self {
            Self {
                prior,
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RecordStore for PriorStatusStore {
        async fn resolve_or_create_image(
            &self,
            _s3_key: &str,
            _original_name: &str,
            _file_size: i64,
            _upload_time: DateTime<Utc>,
        ) -> Result<ResolvedImage, RecordStoreError> {
            Ok(ResolvedImage {
                id: 1,
                created: false,
            })
        }

        async fn record_status(
            &self,
            _image_id: i64,
            _process_type: &str,
            status: &str,
            _message: Option<&str>,
            _processed_at: Option<DateTime<Utc>>,
        ) -> Result<Option<String>, RecordStoreError> {
            self.writes.lock().unwrap().push(status.to_string());
            Ok(Some(self.prior.to_string()))
        }

        async fn append_log(
            &self,
            _image_id: i64,
            _process_type: &str,
            _status: &str,
            _message: Option<&str>,
        ) -> Result<(), RecordStoreError> {
            Ok(())
        }

        async fn save_analysis(
            &self,
            _image_id: i64,
            _analysis: &crate::detection::ImageAnalysis,
        ) -> Result<(), RecordStoreError> {
            Ok(())
        }

        async fn fetch_all_with_detections(
            &self,
        ) -> Result<Vec<ImageWithDetections>, RecordStoreError> {
            Ok(Vec::new())
        }

        async fn health_check(&self) -> Result<(), RecordStoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_record_writes_through_out_of_order_arrivals() {
        // A redelivered event replays an image that already finished;
        // the write is kept rather than rejected
        let store = Arc::new(PriorStatusStore::new("completed"));
        let tracker = StatusTracker::new(store.clone());

        tracker
            .record(1, ProcessingStatus::Processing, Some("Analysis started"), None)
            .await;

        assert_eq!(*store.writes.lock().unwrap(), vec!["processing"]);
    }

    #[tokio::test]
    async fn test_record_accepts_upload_completion() {
        let store = Arc::new(PriorStatusStore::new("pending"));
        let tracker = StatusTracker::new(store.clone());

        tracker
            .record(1, ProcessingStatus::Completed, None, Some(Utc::now()))
            .await;

        assert_eq!(*store.writes.lock().unwrap(), vec!["completed"]);
    }
}

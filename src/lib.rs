//! Pictor Image Analysis Service
//!
//! Asynchronous image analysis pipeline. The service consumes object-creation
//! notifications from Kafka, runs each new image through AWS Rekognition for
//! label and face detection, and persists the results in PostgreSQL alongside
//! a per-image processing status and audit trail. An HTTP API accepts direct
//! uploads and serves an aggregated gallery view of every analyzed image.
//!
//! ## Features
//!
//! - **Event-Driven Ingestion**: SNS-enveloped S3 creation events consumed
//!   from Kafka, with per-image failure isolation inside each batch
//! - **Managed Detection**: Rekognition labels, person instances, and face
//!   attributes (age range, gender, emotions) behind a service trait
//! - **Transactional Persistence**: PostgreSQL-backed record store writing
//!   images, detections, and audit entries atomically
//! - **Status Tracking**: Append-only processing trail driving the
//!   pending/processing/completed/failed lifecycle
//! - **Resilient Gallery**: Database-first listing with automatic fallback to
//!   raw object storage plus on-the-fly re-detection
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic                 S3 Bucket                 PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Storage      │           │ uploads/     │          │ images       │
//! │ Notifications│──────────▶│   {uuid}.jpg │          │ detections   │
//! └──────────────┘           └──────────────┘          │ audit trail  │
//!        │                          │                  └──────────────┘
//!        ▼                          │                         ▲
//! ┌──────────────┐                  ▼                         │
//! │ Event        │           ┌──────────────┐                │
//! │ Processor    │──────────▶│ Rekognition  │                │
//! └──────────────┘           │ Detector     │                │
//!        │                   └──────────────┘                │
//!        ▼                          │                         │
//! ┌──────────────┐                  ▼                         │
//! │ Status       │           ┌──────────────┐                │
//! │ Tracker      │──────────▶│ Record       │────────────────┘
//! └──────────────┘           │ Store        │
//!                            └──────────────┘
//!                                   │
//!                                   ▼
//!                            ┌──────────────┐
//!                            │ Gallery API  │
//!                            └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod detection;
pub mod events;
pub mod gallery;
pub mod ingest;
pub mod object_store;
pub mod record_store;
pub mod status;

pub use api::{start_api_server, AppState, UploadResponse};
pub use config::Config;
pub use detection::{DetectionService, ImageAnalysis, RekognitionDetector};
pub use events::{BatchOutcome, EventProcessor};
pub use gallery::{DetectionView, GalleryImage, GalleryService, Listing, ListingSource};
pub use ingest::NotificationConsumer;
pub use object_store::{ObjectStore, S3ObjectStore, StoredObjectInfo};
pub use record_store::{ImageRecord, PgRecordStore, RecordStore};
pub use status::{ProcessingStatus, StatusTracker};

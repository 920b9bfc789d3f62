use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::DatabaseConfig;
use crate::detection::ImageAnalysis;

/// Errors from the relational persistence layer
#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("Failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("Failed to run database migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// One image known to the pipeline
#[derive(Debug, Clone, FromRow)]
pub struct ImageRecord {
    pub id: i64,
    pub s3_key: String,
    pub original_name: String,
    pub file_size: i64,
    pub upload_time: DateTime<Utc>,
    pub processing_status: String,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One entry in an image's append-only audit trail
#[derive(Debug, Clone, FromRow)]
pub struct ProcessingLogEntry {
    pub id: i64,
    pub image_id: i64,
    pub process_type: String,
    pub status: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct LabelRow {
    pub image_id: i64,
    pub label_name: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, FromRow)]
pub struct PersonRow {
    pub image_id: i64,
    pub confidence: f32,
    pub bbox_left: f32,
    pub bbox_top: f32,
    pub bbox_width: f32,
    pub bbox_height: f32,
}

#[derive(Debug, Clone, FromRow)]
pub struct FaceRow {
    pub id: i64,
    pub image_id: i64,
    pub confidence: f32,
    pub bbox_left: f32,
    pub bbox_top: f32,
    pub bbox_width: f32,
    pub bbox_height: f32,
    pub age_low: Option<i32>,
    pub age_high: Option<i32>,
    pub gender: Option<String>,
    pub gender_confidence: Option<f32>,
    pub primary_emotion: Option<String>,
    pub emotion_confidence: Option<f32>,
    /// Compact "TYPE:confidence,..." duplicate of the emotion rows
    pub emotions: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct FaceEmotionRow {
    pub face_detection_id: i64,
    pub emotion_type: String,
    pub confidence: f32,
}

/// A face joined with its emotion rows
#[derive(Debug, Clone)]
pub struct FaceWithEmotions {
    pub face: FaceRow,
    pub emotions: Vec<FaceEmotionRow>,
}

/// An image joined with all of its detection rows
#[derive(Debug, Clone)]
pub struct ImageWithDetections {
    pub image: ImageRecord,
    pub labels: Vec<LabelRow>,
    pub persons: Vec<PersonRow>,
    pub faces: Vec<FaceWithEmotions>,
}

/// Result of resolving a storage key to an image record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedImage {
    pub id: i64,
    /// True when this call created the record
    pub created: bool,
}

/// Transactional persistence for images and their detections
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Look up an image by storage key, creating a `pending` record on
    /// first sighting. Safe to call repeatedly for the same key.
    async fn resolve_or_create_image(
        &self,
        s3_key: &str,
        original_name: &str,
        file_size: i64,
        upload_time: DateTime<Utc>,
    ) -> Result<ResolvedImage, RecordStoreError>;

    /// Update an image's status column and append the matching audit
    /// trail entry, as one transaction. Returns the status the row held
    /// before the update, when the image exists.
    async fn record_status(
        &self,
        image_id: i64,
        process_type: &str,
        status: &str,
        message: Option<&str>,
        processed_at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>, RecordStoreError>;

    /// Append an audit trail entry without touching the status column
    async fn append_log(
        &self,
        image_id: i64,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), RecordStoreError>;

    /// Persist one detection pass atomically: all label, person, face,
    /// and emotion rows commit together or not at all
    async fn save_analysis(
        &self,
        image_id: i64,
        analysis: &ImageAnalysis,
    ) -> Result<(), RecordStoreError>;

    /// Fetch every image joined with its detections, newest upload first
    async fn fetch_all_with_detections(
        &self,
    ) -> Result<Vec<ImageWithDetections>, RecordStoreError>;

    /// Verify the database is reachable
    async fn health_check(&self) -> Result<(), RecordStoreError>;
}

/// PostgreSQL-backed record store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Connect a pool and optionally run migrations
    pub async fn new(config: &DatabaseConfig) -> Result<Self, RecordStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .map_err(RecordStoreError::Connect)?;

        info!("Connected to PostgreSQL database");

        if config.run_migrations {
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    /// Audit trail for one image, oldest entry first
    pub async fn processing_trail(
        &self,
        image_id: i64,
    ) -> Result<Vec<ProcessingLogEntry>, RecordStoreError> {
        let entries = sqlx::query_as::<_, ProcessingLogEntry>(
            r#"
            SELECT id, image_id, process_type, status, message, created_at
            FROM processing_logs
            WHERE image_id = $1
            ORDER BY id
            "#,
        )
        .bind(image_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self), fields(s3_key = %s3_key))]
    async fn resolve_or_create_image(
        &self,
        s3_key: &str,
        original_name: &str,
        file_size: i64,
        upload_time: DateTime<Utc>,
    ) -> Result<ResolvedImage, RecordStoreError> {
        let mut tx = self.pool.begin().await?;

        // Atomic insert-if-absent; the unique constraint on s3_key makes
        // concurrent resolvers converge on one row.
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO images (s3_key, original_name, file_size, upload_time, processing_status)
            VALUES ($1, $2, $3, $4, 'pending')
            ON CONFLICT (s3_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(s3_key)
        .bind(original_name)
        .bind(file_size)
        .bind(upload_time)
        .fetch_optional(&mut *tx)
        .await?;

        let resolved = match inserted {
            Some(id) => {
                debug!(image_id = id, "Created image record");
                ResolvedImage { id, created: true }
            }
            None => {
                let id: i64 = sqlx::query_scalar("SELECT id FROM images WHERE s3_key = $1")
                    .bind(s3_key)
                    .fetch_one(&mut *tx)
                    .await?;
                debug!(image_id = id, "Found existing image record");
                ResolvedImage { id, created: false }
            }
        };

        tx.commit().await?;
        Ok(resolved)
    }

    async fn record_status(
        &self,
        image_id: i64,
        process_type: &str,
        status: &str,
        message: Option<&str>,
        processed_at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>, RecordStoreError> {
        let mut tx = self.pool.begin().await?;

        // The row lock serializes concurrent writers, so the prior
        // status reflects commit order.
        let previous: Option<String> = sqlx::query_scalar(
            "SELECT processing_status FROM images WHERE id = $1 FOR UPDATE",
        )
        .bind(image_id)
        .fetch_optional(&mut *tx)
        .await?;

        match processed_at {
            Some(ts) => {
                sqlx::query(
                    "UPDATE images SET processing_status = $1, processed_at = $2 WHERE id = $3",
                )
                .bind(status)
                .bind(ts)
                .bind(image_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("UPDATE images SET processing_status = $1 WHERE id = $2")
                    .bind(status)
                    .bind(image_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO processing_logs (image_id, process_type, status, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(image_id)
        .bind(process_type)
        .bind(status)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(previous)
    }

    async fn append_log(
        &self,
        image_id: i64,
        process_type: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), RecordStoreError> {
        sqlx::query(
            r#"
            INSERT INTO processing_logs (image_id, process_type, status, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(image_id)
        .bind(process_type)
        .bind(status)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, analysis), fields(image_id = image_id))]
    async fn save_analysis(
        &self,
        image_id: i64,
        analysis: &ImageAnalysis,
    ) -> Result<(), RecordStoreError> {
        let mut tx = self.pool.begin().await?;

        for label in &analysis.labels {
            sqlx::query(
                r#"
                INSERT INTO detection_labels (image_id, label_name, confidence)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(image_id)
            .bind(&label.name)
            .bind(label.confidence)
            .execute(&mut *tx)
            .await?;
        }

        for person in &analysis.persons {
            sqlx::query(
                r#"
                INSERT INTO person_detections (
                    image_id, confidence, bbox_left, bbox_top, bbox_width, bbox_height
                ) VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(image_id)
            .bind(person.confidence)
            .bind(person.bounding_box.left)
            .bind(person.bounding_box.top)
            .bind(person.bounding_box.width)
            .bind(person.bounding_box.height)
            .execute(&mut *tx)
            .await?;
        }

        for face in &analysis.faces {
            let primary = face.primary_emotion();

            let face_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO face_detections (
                    image_id, confidence, bbox_left, bbox_top, bbox_width, bbox_height,
                    age_low, age_high, gender, gender_confidence,
                    primary_emotion, emotion_confidence, emotions
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                RETURNING id
                "#,
            )
            .bind(image_id)
            .bind(face.confidence)
            .bind(face.bounding_box.left)
            .bind(face.bounding_box.top)
            .bind(face.bounding_box.width)
            .bind(face.bounding_box.height)
            .bind(face.age_low)
            .bind(face.age_high)
            .bind(face.gender.as_deref())
            .bind(face.gender_confidence)
            .bind(primary.map(|e| e.emotion.as_str()))
            .bind(primary.map(|e| e.confidence))
            .bind(encode_emotions(&face.emotions))
            .fetch_one(&mut *tx)
            .await?;

            for emotion in &face.emotions {
                sqlx::query(
                    r#"
                    INSERT INTO face_emotions (face_detection_id, emotion_type, confidence)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(face_id)
                .bind(&emotion.emotion)
                .bind(emotion.confidence)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        debug!(
            image_id = image_id,
            labels = analysis.labels.len(),
            persons = analysis.persons.len(),
            faces = analysis.faces.len(),
            "Saved detection results"
        );

        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_all_with_detections(
        &self,
    ) -> Result<Vec<ImageWithDetections>, RecordStoreError> {
        let images = sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT id, s3_key, original_name, file_size, upload_time,
                   processing_status, processed_at
            FROM images
            ORDER BY upload_time DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if images.is_empty() {
            return Ok(Vec::new());
        }

        let image_ids: Vec<i64> = images.iter().map(|img| img.id).collect();

        let labels = sqlx::query_as::<_, LabelRow>(
            r#"
            SELECT image_id, label_name, confidence
            FROM detection_labels
            WHERE image_id = ANY($1)
            ORDER BY confidence DESC
            "#,
        )
        .bind(&image_ids)
        .fetch_all(&self.pool)
        .await?;

        let persons = sqlx::query_as::<_, PersonRow>(
            r#"
            SELECT image_id, confidence, bbox_left, bbox_top, bbox_width, bbox_height
            FROM person_detections
            WHERE image_id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(&image_ids)
        .fetch_all(&self.pool)
        .await?;

        let faces = sqlx::query_as::<_, FaceRow>(
            r#"
            SELECT id, image_id, confidence, bbox_left, bbox_top, bbox_width, bbox_height,
                   age_low, age_high, gender, gender_confidence,
                   primary_emotion, emotion_confidence, emotions
            FROM face_detections
            WHERE image_id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(&image_ids)
        .fetch_all(&self.pool)
        .await?;

        let face_ids: Vec<i64> = faces.iter().map(|f| f.id).collect();
        let emotions = if face_ids.is_empty() {
            Vec::new()
        } else {
            sqlx::query_as::<_, FaceEmotionRow>(
                r#"
                SELECT face_detection_id, emotion_type, confidence
                FROM face_emotions
                WHERE face_detection_id = ANY($1)
                ORDER BY confidence DESC
                "#,
            )
            .bind(&face_ids)
            .fetch_all(&self.pool)
            .await?
        };

        let mut labels_by_image: HashMap<i64, Vec<LabelRow>> = HashMap::new();
        for row in labels {
            labels_by_image.entry(row.image_id).or_default().push(row);
        }

        let mut persons_by_image: HashMap<i64, Vec<PersonRow>> = HashMap::new();
        for row in persons {
            persons_by_image.entry(row.image_id).or_default().push(row);
        }

        let mut emotions_by_face: HashMap<i64, Vec<FaceEmotionRow>> = HashMap::new();
        for row in emotions {
            emotions_by_face
                .entry(row.face_detection_id)
                .or_default()
                .push(row);
        }

        let mut faces_by_image: HashMap<i64, Vec<FaceWithEmotions>> = HashMap::new();
        for face in faces {
            let face_emotions = emotions_by_face.remove(&face.id).unwrap_or_default();
            faces_by_image
                .entry(face.image_id)
                .or_default()
                .push(FaceWithEmotions {
                    face,
                    emotions: face_emotions,
                });
        }

        let result = images
            .into_iter()
            .map(|image| {
                let id = image.id;
                ImageWithDetections {
                    image,
                    labels: labels_by_image.remove(&id).unwrap_or_default(),
                    persons: persons_by_image.remove(&id).unwrap_or_default(),
                    faces: faces_by_image.remove(&id).unwrap_or_default(),
                }
            })
            .collect();

        Ok(result)
    }

    async fn health_check(&self) -> Result<(), RecordStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Encode emotion readings as "TYPE:confidence" pairs for the compact
/// column. Returns None when there are no readings.
fn encode_emotions(emotions: &[crate::detection::EmotionScore]) -> Option<String> {
    if emotions.is_empty() {
        return None;
    }

    let encoded: Vec<String> = emotions
        .iter()
        .map(|e| format!("{}:{}", e.emotion, e.confidence))
        .collect();

    Some(encoded.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{
        BoundingBox, DetectedFace, DetectedLabel, DetectedPerson, EmotionScore,
    };
    use uuid::Uuid;

    #[test]
    fn test_encode_emotions() {
        let emotions = vec![
            EmotionScore {
                emotion: "HAPPY".to_string(),
                confidence: 80.0,
            },
            EmotionScore {
                emotion: "CALM".to_string(),
                confidence: 10.5,
            },
        ];

        assert_eq!(
            encode_emotions(&emotions).as_deref(),
            Some("HAPPY:80,CALM:10.5")
        );
    }

    #[test]
    fn test_encode_emotions_empty() {
        assert_eq!(encode_emotions(&[]), None);
    }

    // The tests below need a live PostgreSQL instance; run them with
    //   DATABASE_URL=postgres://... cargo test -- --ignored

    async fn connect_store() -> PgRecordStore {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for database tests");
        let config = DatabaseConfig {
            url,
            max_connections: 5,
            min_connections: 1,
            connect_timeout_secs: 5,
            idle_timeout_secs: 60,
            run_migrations: true,
        };
        PgRecordStore::new(&config).await.expect("connect to database")
    }

    fn unique_key() -> String {
        format!("uploads/{}.jpg", Uuid::new_v4())
    }

    fn sample_analysis() -> ImageAnalysis {
        ImageAnalysis {
            labels: vec![
                DetectedLabel {
                    name: "Cat".to_string(),
                    confidence: 95.0,
                },
                DetectedLabel {
                    name: "Person".to_string(),
                    confidence: 90.0,
                },
            ],
            persons: vec![DetectedPerson {
                confidence: 88.0,
                bounding_box: BoundingBox {
                    left: 0.0,
                    top: 0.0,
                    width: 0.5,
                    height: 0.5,
                },
            }],
            faces: vec![DetectedFace {
                confidence: 99.0,
                bounding_box: BoundingBox {
                    left: 0.1,
                    top: 0.1,
                    width: 0.2,
                    height: 0.2,
                },
                age_low: Some(20),
                age_high: Some(30),
                gender: Some("Female".to_string()),
                gender_confidence: Some(97.0),
                emotions: vec![
                    EmotionScore {
                        emotion: "HAPPY".to_string(),
                        confidence: 80.0,
                    },
                    EmotionScore {
                        emotion: "CALM".to_string(),
                        confidence: 10.0,
                    },
                    EmotionScore {
                        emotion: "SAD".to_string(),
                        confidence: 5.0,
                    },
                ],
            }],
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_resolve_or_create_is_idempotent() {
        let store = connect_store().await;
        let key = unique_key();

        let first = store
            .resolve_or_create_image(&key, "cat.jpg", 1024, Utc::now())
            .await
            .unwrap();
        assert!(first.created);

        let second = store
            .resolve_or_create_image(&key, "cat.jpg", 1024, Utc::now())
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.id, second.id);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images WHERE s3_key = $1")
            .bind(&key)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_save_analysis_round_trip() {
        let store = connect_store().await;
        let key = unique_key();

        let resolved = store
            .resolve_or_create_image(&key, "cat.jpg", 1024, Utc::now())
            .await
            .unwrap();

        store
            .save_analysis(resolved.id, &sample_analysis())
            .await
            .unwrap();

        let all = store.fetch_all_with_detections().await.unwrap();
        let image = all
            .iter()
            .find(|entry| entry.image.id == resolved.id)
            .expect("persisted image present in listing");

        assert_eq!(image.labels.len(), 2);
        assert_eq!(image.persons.len(), 1);
        assert_eq!(image.faces.len(), 1);

        let face = &image.faces[0];
        assert_eq!(face.face.primary_emotion.as_deref(), Some("HAPPY"));
        assert_eq!(face.face.emotion_confidence, Some(80.0));
        assert_eq!(face.emotions.len(), 3);
        assert_eq!(face.emotions[0].emotion_type, "HAPPY");
    }

    #[tokio::test]
    #[ignore]
    async fn test_save_analysis_rolls_back_on_failure() {
        let store = connect_store().await;
        let key = unique_key();

        let resolved = store
            .resolve_or_create_image(&key, "cat.jpg", 1024, Utc::now())
            .await
            .unwrap();

        // The final emotion row violates the confidence range check, so
        // every row written before it must be rolled back.
        let mut analysis = sample_analysis();
        analysis.faces[0].emotions.push(EmotionScore {
            emotion: "ANGRY".to_string(),
            confidence: 150.0,
        });

        let result = store.save_analysis(resolved.id, &analysis).await;
        assert!(result.is_err());

        for table in [
            "detection_labels",
            "person_detections",
            "face_detections",
        ] {
            let count: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {table} WHERE image_id = $1"
            ))
            .bind(resolved.id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
            assert_eq!(count, 0, "expected no rows in {table} after rollback");
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_status_trail_is_ordered() {
        let store = connect_store().await;
        let key = unique_key();

        let resolved = store
            .resolve_or_create_image(&key, "cat.jpg", 1024, Utc::now())
            .await
            .unwrap();

        store
            .append_log(resolved.id, "analysis", "pending", Some("Image record created"))
            .await
            .unwrap();
        let prior = store
            .record_status(resolved.id, "analysis", "processing", Some("Analysis started"), None)
            .await
            .unwrap();
        assert_eq!(prior.as_deref(), Some("pending"));
        let completed_at = Utc::now();
        let prior = store
            .record_status(
                resolved.id,
                "analysis",
                "completed",
                Some("Processing completed successfully"),
                Some(completed_at),
            )
            .await
            .unwrap();
        assert_eq!(prior.as_deref(), Some("processing"));

        let trail = store.processing_trail(resolved.id).await.unwrap();
        let statuses: Vec<&str> = trail.iter().map(|entry| entry.status.as_str()).collect();
        assert_eq!(statuses, vec!["pending", "processing", "completed"]);

        let record = sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT id, s3_key, original_name, file_size, upload_time,
                   processing_status, processed_at
            FROM images WHERE id = $1
            "#,
        )
        .bind(resolved.id)
        .fetch_one(&store.pool)
        .await
        .unwrap();

        assert_eq!(record.processing_status, "completed");
        assert!(record.processed_at.is_some());
    }
}

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::detection::{BoundingBox, DetectionService, ImageAnalysis};
use crate::object_store::{key_basename, ObjectStore, ObjectStoreError};
use crate::record_store::{
    FaceWithEmotions, ImageWithDetections, LabelRow, PersonRow, RecordStore, RecordStoreError,
};

/// Reconstructed detection payload served to the UI. The record-store
/// path and the storage fallback both produce this shape.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DetectionView {
    pub labels: Vec<LabelView>,
    #[serde(rename = "boundingBoxes")]
    pub bounding_boxes: Vec<PersonBoxView>,
    #[serde(rename = "faceBoxes")]
    pub face_boxes: Vec<FaceBoxView>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LabelView {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Confidence")]
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PersonBoxView {
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "boundingBox")]
    pub bounding_box: BoundingBoxView,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FaceBoxView {
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "boundingBox")]
    pub bounding_box: BoundingBoxView,
    #[serde(rename = "ageRange", skip_serializing_if = "Option::is_none")]
    pub age_range: Option<AgeRangeView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<GenderView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotions: Option<Vec<EmotionView>>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct BoundingBoxView {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct AgeRangeView {
    #[serde(rename = "Low")]
    pub low: i32,
    #[serde(rename = "High")]
    pub high: i32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenderView {
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "Confidence")]
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmotionView {
    #[serde(rename = "Type")]
    pub emotion_type: String,
    #[serde(rename = "Confidence")]
    pub confidence: f32,
}

impl From<BoundingBox> for BoundingBoxView {
    fn from(bb: BoundingBox) -> Self {
        Self {
            left: bb.left,
            top: bb.top,
            width: bb.width,
            height: bb.height,
        }
    }
}

impl DetectionView {
    /// Build a view from a live analysis result
    pub fn from_analysis(analysis: &ImageAnalysis) -> Self {
        let labels = analysis
            .labels
            .iter()
            .map(|label| LabelView {
                name: label.name.clone(),
                confidence: label.confidence,
            })
            .collect();

        let bounding_boxes = analysis
            .persons
            .iter()
            .map(|person| PersonBoxView {
                label: "Person".to_string(),
                confidence: person.confidence,
                bounding_box: person.bounding_box.into(),
            })
            .collect();

        let face_boxes = analysis
            .faces
            .iter()
            .map(|face| {
                let age_range = match (face.age_low, face.age_high) {
                    (Some(low), Some(high)) => Some(AgeRangeView { low, high }),
                    _ => None,
                };

                let gender = face.gender.clone().map(|value| GenderView {
                    value,
                    confidence: face.gender_confidence.unwrap_or(0.0),
                });

                let emotions = if face.emotions.is_empty() {
                    None
                } else {
                    Some(
                        face.emotions
                            .iter()
                            .map(|e| EmotionView {
                                emotion_type: e.emotion.clone(),
                                confidence: e.confidence,
                            })
                            .collect(),
                    )
                };

                FaceBoxView {
                    label: "Face".to_string(),
                    confidence: face.confidence,
                    bounding_box: face.bounding_box.into(),
                    age_range,
                    gender,
                    emotions,
                }
            })
            .collect();

        Self {
            labels,
            bounding_boxes,
            face_boxes,
        }
    }

    /// Reconstruct a view from persisted detection rows
    pub fn from_rows(
        labels: &[LabelRow],
        persons: &[PersonRow],
        faces: &[FaceWithEmotions],
    ) -> Self {
        let labels = labels
            .iter()
            .map(|row| LabelView {
                name: row.label_name.clone(),
                confidence: row.confidence,
            })
            .collect();

        let bounding_boxes = persons
            .iter()
            .map(|row| PersonBoxView {
                label: "Person".to_string(),
                confidence: row.confidence,
                bounding_box: BoundingBoxView {
                    left: row.bbox_left,
                    top: row.bbox_top,
                    width: row.bbox_width,
                    height: row.bbox_height,
                },
            })
            .collect();

        let face_boxes = faces.iter().map(face_box_from_row).collect();

        Self {
            labels,
            bounding_boxes,
            face_boxes,
        }
    }
}

fn face_box_from_row(entry: &FaceWithEmotions) -> FaceBoxView {
    let face = &entry.face;

    let age_range = match (face.age_low, face.age_high) {
        (Some(low), Some(high)) => Some(AgeRangeView { low, high }),
        _ => None,
    };

    let gender = face.gender.clone().map(|value| GenderView {
        value,
        confidence: face.gender_confidence.unwrap_or(0.0),
    });

    // Structured emotion rows are authoritative; the compact column covers
    // rows written without them, and the primary emotion is the last resort
    let mut emotions = if entry.emotions.is_empty() {
        None
    } else {
        Some(
            entry
                .emotions
                .iter()
                .map(|row| EmotionView {
                    emotion_type: row.emotion_type.clone(),
                    confidence: row.confidence,
                })
                .collect(),
        )
    };
    if emotions.is_none() {
        if let Some(ref compact) = face.emotions {
            let parsed = parse_compact_emotions(compact);
            if !parsed.is_empty() {
                emotions = Some(parsed);
            }
        }
    }
    if emotions.is_none() {
        emotions = face.primary_emotion.clone().map(|primary| {
            vec![EmotionView {
                emotion_type: primary,
                confidence: face.emotion_confidence.unwrap_or(0.0),
            }]
        });
    }

    FaceBoxView {
        label: "Face".to_string(),
        confidence: face.confidence,
        bounding_box: BoundingBoxView {
            left: face.bbox_left,
            top: face.bbox_top,
            width: face.bbox_width,
            height: face.bbox_height,
        },
        age_range,
        gender,
        emotions,
    }
}

/// Parse the compact "TYPE:confidence,..." emotion encoding. Malformed
/// pairs are skipped.
pub fn parse_compact_emotions(raw: &str) -> Vec<EmotionView> {
    raw.split(',')
        .filter_map(|pair| {
            let (emotion_type, confidence) = pair.split_once(':')?;
            let confidence: f32 = confidence.trim().parse().ok()?;
            Some(EmotionView {
                emotion_type: emotion_type.trim().to_string(),
                confidence,
            })
        })
        .collect()
}

/// One listing entry, shaped for the UI. Record-store entries carry the
/// processing fields; fallback entries omit them.
#[derive(Debug, Clone, Serialize)]
pub struct GalleryImage {
    #[serde(rename = "s3Key")]
    pub s3_key: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "originalName")]
    pub original_name: String,
    #[serde(rename = "uploadTime")]
    pub upload_time: Option<String>,
    pub size: i64,
    pub url: String,
    pub rekognition: Option<DetectionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
    #[serde(rename = "imageId", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<i64>,
}

/// Which source produced a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ListingSource {
    #[serde(rename = "database")]
    Database,
    #[serde(rename = "S3")]
    S3,
}

/// A complete image listing with its source
#[derive(Debug)]
pub struct Listing {
    pub images: Vec<GalleryImage>,
    pub source: ListingSource,
}

/// Serves the consolidated image view, preferring the record store and
/// falling back to direct storage enumeration with re-detection.
pub struct GalleryService {
    objects: Arc<dyn ObjectStore>,
    detector: Arc<dyn DetectionService>,
    records: Arc<dyn RecordStore>,
    upload_prefix: String,
    url_expiry: Duration,
}

impl GalleryService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        detector: Arc<dyn DetectionService>,
        records: Arc<dyn RecordStore>,
        upload_prefix: String,
        url_expiry: Duration,
    ) -> Self {
        Self {
            objects,
            detector,
            records,
            upload_prefix,
            url_expiry,
        }
    }

    /// List all images with their detections. Any record-store failure
    /// switches the whole listing to the storage fallback.
    #[instrument(skip(self))]
    pub async fn list_images(&self) -> Result<Listing, ObjectStoreError> {
        match self.list_from_records().await {
            Ok(images) => {
                info!(count = images.len(), "Listed images from record store");
                Ok(Listing {
                    images,
                    source: ListingSource::Database,
                })
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Record store listing failed, falling back to storage enumeration"
                );
                metrics::counter!("pictor.listing.fallbacks").increment(1);

                let images = self.list_from_storage().await?;
                info!(count = images.len(), "Listed images from storage fallback");
                Ok(Listing {
                    images,
                    source: ListingSource::S3,
                })
            }
        }
    }

    async fn list_from_records(&self) -> Result<Vec<GalleryImage>, RecordStoreError> {
        let items = self.records.fetch_all_with_detections().await?;
        let mut images = Vec::with_capacity(items.len());

        for item in &items {
            let image = &item.image;

            let url = match self.objects.presign_get(&image.s3_key, self.url_expiry).await {
                Ok(url) => url,
                Err(e) => {
                    warn!(key = %image.s3_key, error = %e, "Skipping image without presigned URL");
                    continue;
                }
            };

            images.push(GalleryImage {
                s3_key: image.s3_key.clone(),
                file_name: key_basename(&image.s3_key).to_string(),
                original_name: image.original_name.clone(),
                upload_time: Some(image.upload_time.to_rfc3339()),
                size: image.file_size,
                url,
                rekognition: Some(DetectionView::from_rows(
                    &item.labels,
                    &item.persons,
                    &item.faces,
                )),
                processing_status: Some(image.processing_status.clone()),
                processed_at: image.processed_at.map(|ts| ts.to_rfc3339()),
                image_id: Some(image.id),
            });
        }

        Ok(images)
    }

    async fn list_from_storage(&self) -> Result<Vec<GalleryImage>, ObjectStoreError> {
        let objects = self.objects.list_objects(&self.upload_prefix).await?;
        let mut images = Vec::new();

        for summary in objects {
            // Skip directory markers
            if summary.key.ends_with('/') {
                continue;
            }

            let info = match self.objects.object_info(&summary.key).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(key = %summary.key, error = %e, "Skipping object without readable metadata");
                    continue;
                }
            };

            let url = match self.objects.presign_get(&summary.key, self.url_expiry).await {
                Ok(url) => url,
                Err(e) => {
                    warn!(key = %summary.key, error = %e, "Skipping object without presigned URL");
                    continue;
                }
            };

            // Degraded mode recomputes detections per request; results
            // are not persisted here
            let rekognition = match self
                .detector
                .analyze_image(self.objects.bucket(), &summary.key)
                .await
            {
                Ok(analysis) => Some(DetectionView::from_analysis(&analysis)),
                Err(e) => {
                    warn!(key = %summary.key, error = %e, "Detection unavailable for listed object");
                    None
                }
            };

            images.push(GalleryImage {
                s3_key: summary.key.clone(),
                file_name: key_basename(&summary.key).to_string(),
                original_name: info
                    .original_name
                    .unwrap_or_else(|| key_basename(&summary.key).to_string()),
                upload_time: info
                    .upload_time
                    .or(summary.last_modified)
                    .map(|ts| ts.to_rfc3339()),
                size: summary.size,
                url,
                rekognition,
                processing_status: None,
                processed_at: None,
                image_id: None,
            });
        }

        Ok(images)
    }
}

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_rekognition::error::DisplayErrorContext;
use aws_sdk_rekognition::types::{Attribute, FaceDetail, Image, Label, S3Object};
use aws_sdk_rekognition::Client as RekognitionClient;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::DetectionConfig;

/// Label name under which the detection backend reports person instances
const PERSON_LABEL: &str = "Person";

/// Errors from the external detection capability
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Label detection failed: {0}")]
    Labels(String),

    #[error("Face detection failed: {0}")]
    Faces(String),

    #[error("Detection backend unavailable: {0}")]
    Unavailable(String),
}

/// A scene or object label detected in an image
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedLabel {
    pub name: String,
    pub confidence: f32,
}

/// Bounding box with coordinates as ratios of image dimensions (0.0-1.0)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// A single person instance located in an image. Instances reported
/// without a bounding box are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPerson {
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// One emotion reading for a detected face
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionScore {
    pub emotion: String,
    pub confidence: f32,
}

/// A detected face with demographic and emotion attributes. Faces
/// reported without a bounding box are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub age_low: Option<i32>,
    pub age_high: Option<i32>,
    pub gender: Option<String>,
    pub gender_confidence: Option<f32>,
    /// Emotion readings sorted by confidence, highest first
    pub emotions: Vec<EmotionScore>,
}

impl DetectedFace {
    /// The highest-confidence emotion reading, if any were reported
    pub fn primary_emotion(&self) -> Option<&EmotionScore> {
        self.emotions.first()
    }
}

/// Complete analysis result for one image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageAnalysis {
    pub labels: Vec<DetectedLabel>,
    pub persons: Vec<DetectedPerson>,
    pub faces: Vec<DetectedFace>,
}

/// Capability interface for image analysis backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DetectionService: Send + Sync {
    /// Analyze an image stored in an object bucket, returning labels,
    /// person instances, and face details
    async fn analyze_image(&self, bucket: &str, key: &str)
        -> Result<ImageAnalysis, DetectionError>;

    /// Verify the backend is reachable
    async fn health_check(&self) -> Result<(), DetectionError>;
}

/// Detection backed by AWS Rekognition
pub struct RekognitionDetector {
    client: RekognitionClient,
    max_labels: i32,
    min_confidence: f32,
}

impl RekognitionDetector {
    /// Create a new detector against the given region
    pub async fn new(config: &DetectionConfig, region: &str) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        let client = RekognitionClient::new(&aws_config);

        info!(
            region = %region,
            max_labels = config.max_labels,
            min_confidence = config.min_confidence,
            "Rekognition detector initialized"
        );

        Self {
            client,
            max_labels: config.max_labels,
            min_confidence: config.min_confidence,
        }
    }

    fn s3_image(bucket: &str, key: &str) -> Image {
        Image::builder()
            .s3_object(
                S3Object::builder()
                    .bucket(bucket.to_string())
                    .name(key.to_string())
                    .build(),
            )
            .build()
    }
}

#[async_trait]
impl DetectionService for RekognitionDetector {
    #[instrument(skip(self), fields(bucket = %bucket, key = %key))]
    async fn analyze_image(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ImageAnalysis, DetectionError> {
        let labels_response = self
            .client
            .detect_labels()
            .image(Self::s3_image(bucket, key))
            .max_labels(self.max_labels)
            .min_confidence(self.min_confidence)
            .send()
            .await
            .map_err(|e| DetectionError::Labels(DisplayErrorContext(&e).to_string()))?;

        let (labels, persons) = collect_labels(labels_response.labels());

        let faces_response = self
            .client
            .detect_faces()
            .image(Self::s3_image(bucket, key))
            .attributes(Attribute::All)
            .send()
            .await
            .map_err(|e| DetectionError::Faces(DisplayErrorContext(&e).to_string()))?;

        let faces: Vec<DetectedFace> = faces_response
            .face_details()
            .iter()
            .filter_map(face_from_detail)
            .collect();

        debug!(
            labels = labels.len(),
            persons = persons.len(),
            faces = faces.len(),
            "Image analysis complete"
        );

        Ok(ImageAnalysis {
            labels,
            persons,
            faces,
        })
    }

    async fn health_check(&self) -> Result<(), DetectionError> {
        self.client
            .list_collections()
            .max_results(1)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| DetectionError::Unavailable(DisplayErrorContext(&e).to_string()))
    }
}

/// Split a label response into plain labels and person instances.
/// Person instances carry their own confidence and bounding box.
fn collect_labels(labels: &[Label]) -> (Vec<DetectedLabel>, Vec<DetectedPerson>) {
    let mut detected = Vec::new();
    let mut persons = Vec::new();

    for label in labels {
        let name = match label.name() {
            Some(name) => name,
            None => continue,
        };

        detected.push(DetectedLabel {
            name: name.to_string(),
            confidence: label.confidence().unwrap_or(0.0),
        });

        if name.eq_ignore_ascii_case(PERSON_LABEL) {
            for instance in label.instances() {
                if let Some(bb) = instance.bounding_box() {
                    persons.push(DetectedPerson {
                        confidence: instance.confidence().unwrap_or(0.0),
                        bounding_box: bounding_box_from_sdk(bb),
                    });
                }
            }
        }
    }

    (detected, persons)
}

fn face_from_detail(detail: &FaceDetail) -> Option<DetectedFace> {
    let bounding_box = bounding_box_from_sdk(detail.bounding_box()?);

    let mut emotions: Vec<EmotionScore> = detail
        .emotions()
        .iter()
        .filter_map(|emotion| {
            let kind = emotion.r#type()?;
            Some(EmotionScore {
                emotion: kind.as_str().to_string(),
                confidence: emotion.confidence().unwrap_or(0.0),
            })
        })
        .collect();

    // Highest confidence first; the leading entry is the primary emotion
    emotions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Some(DetectedFace {
        confidence: detail.confidence().unwrap_or(0.0),
        bounding_box,
        age_low: detail.age_range().and_then(|range| range.low()),
        age_high: detail.age_range().and_then(|range| range.high()),
        gender: detail
            .gender()
            .and_then(|gender| gender.value())
            .map(|value| value.as_str().to_string()),
        gender_confidence: detail.gender().and_then(|gender| gender.confidence()),
        emotions,
    })
}

fn bounding_box_from_sdk(bb: &aws_sdk_rekognition::types::BoundingBox) -> BoundingBox {
    BoundingBox {
        left: bb.left().unwrap_or(0.0),
        top: bb.top().unwrap_or(0.0),
        width: bb.width().unwrap_or(0.0),
        height: bb.height().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_rekognition::types::{
        AgeRange, BoundingBox as SdkBoundingBox, Emotion, EmotionName, Gender, GenderType,
        Instance,
    };

    fn sdk_bbox(left: f32, top: f32, width: f32, height: f32) -> SdkBoundingBox {
        SdkBoundingBox::builder()
            .left(left)
            .top(top)
            .width(width)
            .height(height)
            .build()
    }

    #[test]
    fn test_collect_labels_extracts_person_instances() {
        let labels = vec![
            Label::builder().name("Cat").confidence(95.5).build(),
            Label::builder()
                .name("Person")
                .confidence(99.1)
                .instances(
                    Instance::builder()
                        .confidence(98.7)
                        .bounding_box(sdk_bbox(0.1, 0.2, 0.3, 0.4))
                        .build(),
                )
                .build(),
        ];

        let (detected, persons) = collect_labels(&labels);

        assert_eq!(detected.len(), 2);
        assert_eq!(detected[0].name, "Cat");
        assert_eq!(detected[1].name, "Person");

        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].confidence, 98.7);
        assert_eq!(persons[0].bounding_box.left, 0.1);
        assert_eq!(persons[0].bounding_box.height, 0.4);
    }

    #[test]
    fn test_person_instances_without_bbox_are_dropped() {
        let labels = vec![Label::builder()
            .name("Person")
            .confidence(99.0)
            .instances(Instance::builder().confidence(97.0).build())
            .instances(
                Instance::builder()
                    .confidence(95.0)
                    .bounding_box(sdk_bbox(0.0, 0.0, 1.0, 1.0))
                    .build(),
            )
            .build()];

        let (detected, persons) = collect_labels(&labels);

        assert_eq!(detected.len(), 1);
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].confidence, 95.0);
    }

    #[test]
    fn test_collect_labels_skips_nameless_labels() {
        let labels = vec![
            Label::builder().confidence(50.0).build(),
            Label::builder().name("Dog").confidence(88.0).build(),
        ];

        let (detected, persons) = collect_labels(&labels);

        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].name, "Dog");
        assert!(persons.is_empty());
    }

    #[test]
    fn test_non_person_instances_are_ignored() {
        let labels = vec![Label::builder()
            .name("Car")
            .confidence(97.0)
            .instances(Instance::builder().confidence(96.0).build())
            .build()];

        let (detected, persons) = collect_labels(&labels);

        assert_eq!(detected.len(), 1);
        assert!(persons.is_empty());
    }

    #[test]
    fn test_face_emotions_sorted_highest_first() {
        let detail = FaceDetail::builder()
            .confidence(99.9)
            .bounding_box(sdk_bbox(0.25, 0.25, 0.5, 0.5))
            .age_range(AgeRange::builder().low(25).high(35).build())
            .gender(
                Gender::builder()
                    .value(GenderType::Female)
                    .confidence(97.2)
                    .build(),
            )
            .emotions(
                Emotion::builder()
                    .r#type(EmotionName::Calm)
                    .confidence(10.0)
                    .build(),
            )
            .emotions(
                Emotion::builder()
                    .r#type(EmotionName::Happy)
                    .confidence(80.0)
                    .build(),
            )
            .build();

        let face = face_from_detail(&detail).unwrap();

        assert_eq!(face.emotions.len(), 2);
        assert_eq!(face.emotions[0].emotion, "HAPPY");
        assert_eq!(face.emotions[0].confidence, 80.0);
        assert_eq!(face.emotions[1].emotion, "CALM");

        let primary = face.primary_emotion().unwrap();
        assert_eq!(primary.emotion, "HAPPY");

        assert_eq!(face.age_low, Some(25));
        assert_eq!(face.age_high, Some(35));
        assert_eq!(face.gender.as_deref(), Some("Female"));
        assert_eq!(face.gender_confidence, Some(97.2));
    }

    #[test]
    fn test_face_without_attributes() {
        let detail = FaceDetail::builder()
            .confidence(88.0)
            .bounding_box(sdk_bbox(0.1, 0.1, 0.2, 0.2))
            .build();
        let face = face_from_detail(&detail).unwrap();

        assert_eq!(face.confidence, 88.0);
        assert_eq!(face.bounding_box.left, 0.1);
        assert!(face.age_low.is_none());
        assert!(face.gender.is_none());
        assert!(face.emotions.is_empty());
        assert!(face.primary_emotion().is_none());
    }

    #[test]
    fn test_face_without_bbox_is_dropped() {
        let detail = FaceDetail::builder().confidence(88.0).build();
        assert!(face_from_detail(&detail).is_none());
    }
}

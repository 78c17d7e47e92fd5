use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Length of an embedding produced by the enrolled recognition model.
pub const EMBEDDING_DIM: usize = 128;

/// A 2-D position in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Bounding box for a detected face.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Facial landmark positions for one frame, as tracked by the liveness buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LandmarkSample {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
    pub face_center: Point,
    /// Monotonic capture tick supplied by the orchestrator.
    #[serde(default)]
    pub captured_at_tick: u64,
}

impl LandmarkSample {
    /// Midpoint between the two eyes.
    pub fn mid_eye(&self) -> Point {
        Point::new(
            (self.left_eye.x + self.right_eye.x) / 2.0,
            (self.left_eye.y + self.right_eye.y) / 2.0,
        )
    }
}

/// One face as reported by the external detection/recognition provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Landmarks are absent when the detector located the face box but
    /// could not regress usable points.
    #[serde(default)]
    pub left_eye: Option<Point>,
    #[serde(default)]
    pub right_eye: Option<Point>,
    #[serde(default)]
    pub nose: Option<Point>,
    pub embedding: Embedding,
}

impl DetectedFace {
    /// Landmark sample for this detection, centred on the bounding box.
    /// `None` unless all three landmarks were reported.
    pub fn landmark_sample(&self, tick: u64) -> Option<LandmarkSample> {
        Some(LandmarkSample {
            left_eye: self.left_eye?,
            right_eye: self.right_eye?,
            nose: self.nose?,
            face_center: self.bbox.center(),
            captured_at_tick: tick,
        })
    }
}

/// Face embedding vector (128-dimensional for the attendance recognizer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding.
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Processes every dimension; callers must ensure equal lengths.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Whether two embeddings can be meaningfully compared.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// One enrolled identity in the matching gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub user_id: String,
    pub embedding: Embedding,
}

/// Kind of attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    CheckIn,
    CheckOut,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CheckIn => "check_in",
            EventType::CheckOut => "check_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "check_in" => Some(EventType::CheckIn),
            "check_out" => Some(EventType::CheckOut),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory lateness/overtime metadata attached to an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Punctuality {
    pub minutes_late: i64,
    pub minutes_early: i64,
    pub minutes_overtime: i64,
}

impl Punctuality {
    pub fn on_time(&self) -> bool {
        self.minutes_late == 0
    }
}

/// A persisted attendance event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceLogEntry {
    pub user_id: String,
    pub timestamp: NaiveDateTime,
    pub event_type: EventType,
    pub match_distance: f32,
    pub confidence: f32,
    pub device_id: String,
    pub spoof_score: f32,
    #[serde(default)]
    pub punctuality: Punctuality,
}

impl AttendanceLogEntry {
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// Shift boundaries for one user or organisation.
///
/// Wall-clock times only; shifts crossing midnight are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftConfig {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub grace_period_minutes: u32,
    pub overtime_threshold_minutes: u32,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
            grace_period_minutes: 15,
            overtime_threshold_minutes: 30,
        }
    }
}

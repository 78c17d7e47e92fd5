//! presence-core: face-based attendance verification.
//!
//! Four pure, synchronous stages decide whether one camera frame becomes an
//! attendance event: frame quality (anti-spoofing), landmark liveness,
//! Euclidean identity matching, and check-in/check-out resolution against
//! the day's log. Detection and embedding extraction happen upstream.

pub mod frame;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod resolver;
pub mod types;

pub use frame::{FrameError, FrameSample};
pub use liveness::{LivenessConfig, LivenessTracker, LivenessVerdict};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use pipeline::{
    AcceptedScan, PipelineConfig, ScanOutcome, ScanPipeline, ScanRejection, ScanRequest,
    VerifiedScan,
};
pub use quality::{QualityConfig, SpoofClass, SpoofReport};
pub use resolver::{resolve, AttendanceState, Resolution, ResolveRejection};
pub use types::{
    AttendanceLogEntry, BoundingBox, DetectedFace, Embedding, EventType, GalleryEntry,
    LandmarkSample, Point, Punctuality, ShiftConfig, EMBEDDING_DIM,
};

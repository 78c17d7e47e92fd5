//! The scan pipeline: detection gate → frame quality → liveness → identity →
//! attendance event.
//!
//! Every expected failure is a [`ScanRejection`], never an `Err`. The pipeline
//! can run in one call ([`ScanPipeline::process_scan`]) when the caller already
//! holds the shift and today's log, or in two phases ([`ScanPipeline::verify`]
//! then [`ScanPipeline::admit`]) when those are fetched after identity is
//! known.

use crate::frame::FrameSample;
use crate::liveness::{LivenessConfig, LivenessReason, LivenessTracker, LivenessVerdict};
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::quality::{self, QualityConfig, SpoofReport};
use crate::resolver::{self, ResolveRejection};
use crate::types::{
    AttendanceLogEntry, DetectedFace, EventType, GalleryEntry, Punctuality, ShiftConfig,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Tunables for every stage of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub quality: QualityConfig,
    pub liveness: LivenessConfig,
    /// Maximum Euclidean distance for an identity match.
    pub match_threshold: f32,
    /// Detections below this confidence are ignored before counting faces.
    pub min_detection_confidence: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality: QualityConfig::default(),
            liveness: LivenessConfig::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            min_detection_confidence: 0.5,
        }
    }
}

/// Why a scan attempt was refused. Terminal for the attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanRejection {
    NoFaceDetected,
    MultipleFacesDetected { count: usize },
    SpoofSuspected { report: SpoofReport },
    LivenessNotConfirmed { verdict: LivenessVerdict },
    NoConfidentMatch { result: MatchResult },
    AlreadyFinished { user_id: String, checked_out_at: NaiveDateTime },
    StaleTimestamp { user_id: String, last_event_at: NaiveDateTime },
    ConcurrentConflict { user_id: String },
    RateLimited { device_id: String, retry_after_secs: u64 },
}

impl ScanRejection {
    /// Short machine-readable name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanRejection::NoFaceDetected => "no_face_detected",
            ScanRejection::MultipleFacesDetected { .. } => "multiple_faces_detected",
            ScanRejection::SpoofSuspected { .. } => "spoof_suspected",
            ScanRejection::LivenessNotConfirmed { .. } => "liveness_not_confirmed",
            ScanRejection::NoConfidentMatch { .. } => "no_confident_match",
            ScanRejection::AlreadyFinished { .. } => "already_finished",
            ScanRejection::StaleTimestamp { .. } => "stale_timestamp",
            ScanRejection::ConcurrentConflict { .. } => "concurrent_conflict",
            ScanRejection::RateLimited { .. } => "rate_limited",
        }
    }

    /// Rejections that suggest a presentation attack or unknown person,
    /// as opposed to a bookkeeping refusal for a recognised user. A session
    /// still filling its liveness window is not suspicious.
    pub fn is_suspicious(&self) -> bool {
        match self {
            ScanRejection::SpoofSuspected { .. } | ScanRejection::NoConfidentMatch { .. } => true,
            ScanRejection::LivenessNotConfirmed { verdict } => {
                verdict.reason != LivenessReason::InsufficientSamples
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for ScanRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanRejection::NoFaceDetected => write!(f, "no face detected"),
            ScanRejection::MultipleFacesDetected { count } => {
                write!(f, "{count} faces detected; exactly one required")
            }
            ScanRejection::SpoofSuspected { report } => write!(
                f,
                "possible spoof ({:?}, score {:.1})",
                report.classification, report.score
            ),
            ScanRejection::LivenessNotConfirmed { verdict } => {
                write!(f, "liveness not confirmed: {}", verdict.reason)
            }
            ScanRejection::NoConfidentMatch { result } if result.ambiguous => {
                write!(f, "ambiguous match at distance {:.3}", result.distance)
            }
            ScanRejection::NoConfidentMatch { result } => {
                write!(f, "no enrolled face within threshold (distance {:.3})", result.distance)
            }
            ScanRejection::AlreadyFinished { user_id, .. } => {
                write!(f, "{user_id} has already checked out today")
            }
            ScanRejection::StaleTimestamp { user_id, last_event_at } => {
                write!(f, "scan for {user_id} is not after last event at {last_event_at}")
            }
            ScanRejection::ConcurrentConflict { user_id } => {
                write!(f, "concurrent scan for {user_id}; try again")
            }
            ScanRejection::RateLimited { retry_after_secs, .. } => {
                write!(f, "too many failed scans; try again in {retry_after_secs}s")
            }
        }
    }
}

impl From<ResolveRejection> for ScanRejection {
    fn from(r: ResolveRejection) -> Self {
        match r {
            ResolveRejection::AlreadyFinished {
                user_id,
                checked_out_at,
            } => ScanRejection::AlreadyFinished {
                user_id,
                checked_out_at,
            },
            ResolveRejection::StaleTimestamp {
                user_id,
                last_event_at,
            } => ScanRejection::StaleTimestamp {
                user_id,
                last_event_at,
            },
        }
    }
}

/// One scan attempt as handed over by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest<'a> {
    pub frame: &'a FrameSample,
    /// Faces reported by the external detector for this frame.
    pub faces: &'a [DetectedFace],
    pub device_id: &'a str,
    pub timestamp: NaiveDateTime,
    /// Monotonic tick stamped on the landmark sample this frame contributes.
    pub tick: u64,
}

/// A scan that passed the detection, spoof, liveness and identity stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedScan {
    pub user_id: String,
    pub spoof: SpoofReport,
    pub liveness: LivenessVerdict,
    pub matched: MatchResult,
}

/// An accepted attendance event, ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedScan {
    pub event_type: EventType,
    pub matched_user_id: String,
    pub punctuality: Punctuality,
    pub entry: AttendanceLogEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanOutcome {
    Accepted(AcceptedScan),
    Rejected(ScanRejection),
}

impl ScanOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ScanOutcome::Accepted(_))
    }
}

impl From<Result<AcceptedScan, ScanRejection>> for ScanOutcome {
    fn from(r: Result<AcceptedScan, ScanRejection>) -> Self {
        match r {
            Ok(a) => ScanOutcome::Accepted(a),
            Err(r) => ScanOutcome::Rejected(r),
        }
    }
}

/// Stateless runner for the four core stages.
#[derive(Debug, Clone)]
pub struct ScanPipeline {
    config: PipelineConfig,
    matcher: EuclideanMatcher,
}

impl ScanPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let matcher = EuclideanMatcher::new(config.match_threshold);
        Self { config, matcher }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A fresh liveness tracker configured for this pipeline.
    pub fn new_tracker(&self) -> LivenessTracker {
        LivenessTracker::new(self.config.liveness.clone())
    }

    /// Exactly one face above the detector confidence floor.
    pub fn single_face<'a>(&self, faces: &'a [DetectedFace]) -> Result<&'a DetectedFace, ScanRejection> {
        let mut usable = faces
            .iter()
            .filter(|f| f.confidence >= self.config.min_detection_confidence);
        match (usable.next(), usable.count()) {
            (None, _) => Err(ScanRejection::NoFaceDetected),
            (Some(face), 0) => Ok(face),
            (Some(_), rest) => Err(ScanRejection::MultipleFacesDetected { count: rest + 1 }),
        }
    }

    /// Run the detection, spoof, liveness and identity stages.
    ///
    /// The face's landmarks are appended to `tracker` once the frame passes
    /// the quality gate. A face without landmarks contributes its centre only.
    pub fn verify(
        &self,
        request: &ScanRequest<'_>,
        tracker: &mut LivenessTracker,
        gallery: &[GalleryEntry],
    ) -> Result<VerifiedScan, ScanRejection> {
        let face = self.single_face(request.faces)?;

        let spoof = quality::analyze(request.frame, &self.config.quality);
        if !spoof.is_likely_live {
            return Err(ScanRejection::SpoofSuspected { report: spoof });
        }

        let liveness = match face.landmark_sample(request.tick) {
            Some(sample) => tracker.update(sample),
            None => {
                tracker.observe_center(face.bbox.center());
                tracker.verdict()
            }
        };
        if !liveness.is_alive {
            return Err(ScanRejection::LivenessNotConfirmed { verdict: liveness });
        }

        let matched = self.matcher.compare(&face.embedding, gallery);
        let user_id = match (&matched.matched_id, matched.ambiguous) {
            (Some(id), false) => id.clone(),
            _ => return Err(ScanRejection::NoConfidentMatch { result: matched }),
        };

        Ok(VerifiedScan {
            user_id,
            spoof,
            liveness,
            matched,
        })
    }

    /// Resolve the attendance event for a verified scan and build its entry.
    pub fn admit(
        &self,
        verified: &VerifiedScan,
        device_id: &str,
        timestamp: NaiveDateTime,
        shift: &ShiftConfig,
        todays_logs: &[AttendanceLogEntry],
    ) -> Result<AcceptedScan, ScanRejection> {
        let resolution = resolver::resolve(&verified.user_id, timestamp, shift, todays_logs)?;

        let entry = AttendanceLogEntry {
            user_id: verified.user_id.clone(),
            timestamp,
            event_type: resolution.event_type,
            match_distance: verified.matched.distance,
            confidence: verified.matched.confidence,
            device_id: device_id.to_string(),
            spoof_score: verified.spoof.score,
            punctuality: resolution.punctuality,
        };

        Ok(AcceptedScan {
            event_type: resolution.event_type,
            matched_user_id: verified.user_id.clone(),
            punctuality: resolution.punctuality,
            entry,
        })
    }

    /// Full single-call pipeline for callers that already hold the shift
    /// and today's log for the expected user.
    pub fn process_scan(
        &self,
        request: &ScanRequest<'_>,
        tracker: &mut LivenessTracker,
        gallery: &[GalleryEntry],
        shift: &ShiftConfig,
        todays_logs: &[AttendanceLogEntry],
    ) -> ScanOutcome {
        let result = self.verify(request, tracker, gallery).and_then(|verified| {
            self.admit(
                &verified,
                request.device_id,
                request.timestamp,
                shift,
                todays_logs,
            )
        });
        match &result {
            Ok(accepted) => tracing::info!(
                user = %accepted.matched_user_id,
                event = %accepted.event_type,
                device = request.device_id,
                "scan accepted"
            ),
            Err(rejection) => tracing::warn!(
                kind = rejection.kind(),
                device = request.device_id,
                "scan rejected"
            ),
        }
        result.into()
    }
}

impl Default for ScanPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

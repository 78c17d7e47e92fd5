//! Motion-based liveness over a short landmark history.
//!
//! A photo held in front of the camera produces near-zero variance in both
//! eye geometry and face position across consecutive frames. A person standing
//! at a kiosk blinks, bobs and drifts even without being asked to, so either a
//! blink-like eye signal or measurable face-centre motion counts as alive.
//!
//! The tracker owns two bounded ring buffers: full landmark samples, and face
//! centres alone (a detector may locate the face box in frames where landmark
//! regression is unusable). A verdict needs enough history in both.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs and still screens held steady.
//! - **Does not block:** video replay (landmarks move in video), a photo waved
//!   around by hand. Pair with the frame quality analyzer.

use crate::types::{LandmarkSample, Point};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples retained per session.
pub const RING_CAPACITY: usize = 8;

/// Fixed-capacity FIFO; pushing onto a full ring evicts the oldest item.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Oldest to newest.
    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, T> {
        self.items.iter()
    }
}

/// Calibration constants for [`LivenessTracker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Minimum samples required in each buffer before a verdict is given.
    pub min_samples: usize,
    /// `|left_eye.y - right_eye.y| / interocular distance` above which a
    /// sample counts toward the eye signal.
    pub eye_separation_ratio: f32,
    /// Variance (px²) of mid-eye y above which the whole window counts.
    pub mid_eye_variance: f32,
    /// Variance (px²) of face-centre x or y above which motion is asserted.
    pub motion_variance: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            min_samples: 4,
            eye_separation_ratio: 0.22,
            mid_eye_variance: 0.1,
            motion_variance: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessReason {
    InsufficientSamples,
    NoMotion,
    EyeSignal,
    HeadMotion,
}

impl std::fmt::Display for LivenessReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LivenessReason::InsufficientSamples => "insufficient samples",
            LivenessReason::NoMotion => "no motion detected",
            LivenessReason::EyeSignal => "eye movement detected",
            LivenessReason::HeadMotion => "head motion detected",
        };
        f.write_str(s)
    }
}

/// Outcome of a liveness evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub is_alive: bool,
    pub reason: LivenessReason,
    pub landmark_samples: usize,
    pub center_samples: usize,
    /// Samples contributing to the eye signal.
    pub eye_signal_count: usize,
    pub mid_eye_variance: f32,
    pub center_variance_x: f32,
    pub center_variance_y: f32,
}

/// Per-session liveness state. Single writer; never shared across sessions.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    landmarks: RingBuffer<LandmarkSample>,
    centers: RingBuffer<Point>,
    config: LivenessConfig,
}

impl LivenessTracker {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            landmarks: RingBuffer::new(RING_CAPACITY),
            centers: RingBuffer::new(RING_CAPACITY),
            config,
        }
    }

    /// Record a full landmark sample and return the updated verdict.
    pub fn update(&mut self, sample: LandmarkSample) -> LivenessVerdict {
        self.centers.push(sample.face_center);
        self.landmarks.push(sample);
        self.verdict()
    }

    /// Record a face centre from a frame without usable landmarks.
    pub fn observe_center(&mut self, center: Point) {
        self.centers.push(center);
    }

    pub fn reset(&mut self) {
        self.landmarks.clear();
        self.centers.clear();
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    /// Evaluate the current window without recording anything.
    pub fn verdict(&self) -> LivenessVerdict {
        let landmark_samples = self.landmarks.len();
        let center_samples = self.centers.len();

        if landmark_samples < self.config.min_samples || center_samples < self.config.min_samples {
            return LivenessVerdict {
                is_alive: false,
                reason: LivenessReason::InsufficientSamples,
                landmark_samples,
                center_samples,
                eye_signal_count: 0,
                mid_eye_variance: 0.0,
                center_variance_x: 0.0,
                center_variance_y: 0.0,
            };
        }

        let mid_eye_variance = variance(self.landmarks.iter().map(|s| s.mid_eye().y));
        let eye_signal_count = if mid_eye_variance > self.config.mid_eye_variance {
            landmark_samples
        } else {
            self.landmarks
                .iter()
                .filter(|s| vertical_eye_ratio(s) > self.config.eye_separation_ratio)
                .count()
        };

        let center_variance_x = variance(self.centers.iter().map(|p| p.x));
        let center_variance_y = variance(self.centers.iter().map(|p| p.y));
        let head_motion = center_variance_x > self.config.motion_variance
            || center_variance_y > self.config.motion_variance;

        let (is_alive, reason) = if eye_signal_count >= 1 {
            (true, LivenessReason::EyeSignal)
        } else if head_motion {
            (true, LivenessReason::HeadMotion)
        } else {
            (false, LivenessReason::NoMotion)
        };

        tracing::debug!(
            is_alive,
            %reason,
            eye_signal_count,
            mid_eye_variance,
            center_variance_x,
            center_variance_y,
            "liveness evaluated"
        );

        LivenessVerdict {
            is_alive,
            reason,
            landmark_samples,
            center_samples,
            eye_signal_count,
            mid_eye_variance,
            center_variance_x,
            center_variance_y,
        }
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new(LivenessConfig::default())
    }
}

/// Vertical eye offset normalised by interocular distance.
fn vertical_eye_ratio(sample: &LandmarkSample) -> f32 {
    let interocular = sample.left_eye.distance(&sample.right_eye);
    if interocular <= f32::EPSILON {
        return 0.0;
    }
    (sample.left_eye.y - sample.right_eye.y).abs() / interocular
}

/// Population variance.
fn variance(values: impl Iterator<Item = f32> + Clone) -> f32 {
    let n = values.clone().count();
    if n == 0 {
        return 0.0;
    }
    let mean = values.clone().sum::<f32>() / n as f32;
    values.map(|v| (v - mean).powi(2)).sum::<f32>() / n as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Level eyes 40 px apart, centred on `(cx, cy)`.
    fn sample(cx: f32, cy: f32, tick: u64) -> LandmarkSample {
        LandmarkSample {
            left_eye: Point::new(cx - 20.0, cy - 10.0),
            right_eye: Point::new(cx + 20.0, cy - 10.0),
            nose: Point::new(cx, cy + 5.0),
            face_center: Point::new(cx, cy),
            captured_at_tick: tick,
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_insufficient_samples() {
        let mut tracker = LivenessTracker::default();
        for t in 0..3 {
            let v = tracker.update(sample(100.0 + t as f32 * 10.0, 100.0, t));
            assert!(!v.is_alive);
            assert_eq!(v.reason, LivenessReason::InsufficientSamples);
        }
    }

    #[test]
    fn test_centers_alone_are_not_enough() {
        let mut tracker = LivenessTracker::default();
        for i in 0..8 {
            tracker.observe_center(Point::new(100.0 + i as f32 * 5.0, 100.0));
        }
        tracker.update(sample(100.0, 100.0, 0));
        let v = tracker.verdict();
        assert_eq!(v.reason, LivenessReason::InsufficientSamples);
        assert_eq!(v.center_samples, 8);
        assert_eq!(v.landmark_samples, 1);
    }

    #[test]
    fn test_static_photo_rejected() {
        let mut tracker = LivenessTracker::default();
        let mut v = tracker.verdict();
        for t in 0..8 {
            v = tracker.update(sample(320.0, 240.0, t));
        }
        assert!(!v.is_alive);
        assert_eq!(v.reason, LivenessReason::NoMotion);
        assert_eq!(v.eye_signal_count, 0);
        assert_eq!(v.center_variance_x, 0.0);
    }

    #[test]
    fn test_horizontal_drift_is_head_motion() {
        let mut tracker = LivenessTracker::default();
        let mut v = tracker.verdict();
        for t in 0..4 {
            // y fixed so the eye signal stays silent
            v = tracker.update(sample(300.0 + t as f32, 240.0, t));
        }
        // x = 300..303 → variance 1.25
        assert!(v.is_alive);
        assert_eq!(v.reason, LivenessReason::HeadMotion);
        assert!((v.center_variance_x - 1.25).abs() < 1e-4);
    }

    #[test]
    fn test_vertical_bob_is_eye_signal() {
        let mut tracker = LivenessTracker::default();
        let mut v = tracker.verdict();
        for (t, dy) in [0.0, 1.0, 0.0, 1.0].into_iter().enumerate() {
            v = tracker.update(sample(320.0, 240.0 + dy, t as u64));
        }
        assert!(v.is_alive);
        assert_eq!(v.reason, LivenessReason::EyeSignal);
        assert_eq!(v.eye_signal_count, 4);
    }

    #[test]
    fn test_tilted_eyes_count_individually() {
        let mut tracker = LivenessTracker::default();
        for t in 0..3 {
            tracker.update(sample(320.0, 240.0, t));
        }
        let mut tilted = sample(320.0, 240.0, 3);
        // 12 px vertical offset over ~41.8 px interocular ≈ 0.29
        tilted.left_eye.y -= 6.0;
        tilted.right_eye.y += 6.0;
        let v = tracker.update(tilted);
        assert!(v.is_alive);
        assert_eq!(v.eye_signal_count, 1);
    }

    #[test]
    fn test_window_forgets_old_motion() {
        let mut tracker = LivenessTracker::default();
        for t in 0..4 {
            tracker.update(sample(100.0 + 50.0 * t as f32, 240.0, t));
        }
        assert!(tracker.verdict().is_alive);
        for t in 4..12 {
            tracker.update(sample(320.0, 240.0, t));
        }
        assert!(!tracker.verdict().is_alive);
        assert_eq!(tracker.landmark_count(), RING_CAPACITY);
    }

    #[test]
    fn test_reset_clears_both_buffers() {
        let mut tracker = LivenessTracker::default();
        for t in 0..6 {
            tracker.update(sample(100.0 + t as f32, 100.0, t));
        }
        tracker.reset();
        let v = tracker.verdict();
        assert_eq!(v.landmark_samples, 0);
        assert_eq!(v.center_samples, 0);
    }

    #[test]
    fn test_variance_known_values() {
        let v = variance([2.0f32, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].into_iter());
        assert!((v - 4.0).abs() < 1e-6);
    }
}

//! Gallery matching by Euclidean embedding distance.

use crate::types::{Embedding, GalleryEntry};
use serde::{Deserialize, Serialize};

/// Default acceptance distance for 128-dim normalised embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;

/// Distances within this of the minimum are treated as equal.
const TIE_EPSILON: f32 = 1e-6;

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Identity of the best match, present only when within threshold.
    pub matched_id: Option<String>,
    /// Distance to the closest comparable gallery entry (+∞ if none).
    pub distance: f32,
    /// `1 - distance / threshold`, clamped to [0, 1].
    pub confidence: f32,
    /// Several identities share the minimum distance.
    pub ambiguous: bool,
    /// Gallery entries actually compared.
    pub compared: usize,
}

impl MatchResult {
    fn none(compared: usize) -> Self {
        Self {
            matched_id: None,
            distance: f32::INFINITY,
            confidence: 0.0,
            ambiguous: false,
            compared,
        }
    }

    /// Accepted and unambiguous.
    pub fn is_confident(&self) -> bool {
        self.matched_id.is_some() && !self.ambiguous
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher with constant-time gallery traversal.
///
/// Always iterates ALL gallery entries so timing does not leak the gallery
/// position of the match.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    fn confidence(&self, distance: f32) -> f32 {
        if self.threshold <= 0.0 {
            return if distance <= 0.0 { 1.0 } else { 0.0 };
        }
        (1.0 - distance / self.threshold).clamp(0.0, 1.0)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchResult {
        let distances: Vec<Option<f32>> = gallery
            .iter()
            .map(|entry| {
                probe
                    .is_comparable(&entry.embedding)
                    .then(|| probe.euclidean_distance(&entry.embedding))
            })
            .collect();

        let compared = distances.iter().flatten().count();
        let best = distances
            .iter()
            .flatten()
            .copied()
            .filter(|d| d.is_finite())
            .fold(f32::INFINITY, f32::min);

        if !best.is_finite() {
            tracing::debug!(gallery = gallery.len(), compared, "no comparable gallery entries");
            return MatchResult::none(compared);
        }

        // Lexicographically first identity among the tied minimum.
        let mut tied = gallery
            .iter()
            .zip(&distances)
            .filter(|(_, d)| matches!(d, Some(d) if (d - best).abs() <= TIE_EPSILON))
            .map(|(entry, _)| entry.user_id.as_str())
            .collect::<Vec<_>>();
        tied.sort_unstable();
        tied.dedup();

        let ambiguous = tied.len() > 1;
        let accepted = best <= self.threshold;
        let matched_id = match tied.first() {
            Some(id) if accepted => Some(id.to_string()),
            _ => None,
        };

        tracing::debug!(
            distance = best,
            threshold = self.threshold,
            accepted,
            ambiguous,
            compared,
            "gallery match"
        );

        MatchResult {
            matched_id,
            distance: best,
            confidence: if accepted { self.confidence(best) } else { 0.0 },
            ambiguous,
            compared,
        }
    }
}

//! Single-frame anti-spoofing analysis.
//!
//! Five independent pixel statistics, each normalised to 0–100, are combined
//! into a weighted composite score:
//!
//! | Signal                | Weight | Direction |
//! |-----------------------|--------|-----------|
//! | Texture (Laplacian)   | 40%    | higher = live |
//! | Moiré (pattern repeat)| 20%    | inverted |
//! | Brightness variation  | 15%    | higher = live |
//! | Colour saturation     | 15%    | closeness to target band |
//! | Reflectance (gloss)   | 10%    | inverted |
//!
//! The thresholds are calibration knobs, not derived values. They are carried
//! in [`QualityConfig`] so deployments can tune them against their own cameras.
//!
//! # Threat Coverage
//!
//! - **Flags:** printed photos with halftone patterns, phone/monitor screens
//!   (moiré, glare), heavily smoothed still images.
//! - **Does not flag:** high-quality prints under diffuse light, 3D masks.

use crate::frame::FrameSample;
use serde::{Deserialize, Serialize};

const WEIGHT_TEXTURE: f32 = 0.40;
const WEIGHT_MOIRE: f32 = 0.20;
const WEIGHT_BRIGHTNESS: f32 = 0.15;
const WEIGHT_SATURATION: f32 = 0.15;
const WEIGHT_REFLECTANCE: f32 = 0.10;

/// Pixel offset used by the repeating-pattern probe.
const MOIRE_OFFSET: usize = 2;

/// Calibration constants for [`analyze`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Composite score must be strictly greater than this to pass.
    pub live_threshold: f32,
    /// Multiplier mapping raw mean |Laplacian| to the 0–100 scale.
    /// Real faces produce a raw value of roughly 15–30.
    pub texture_scale: f32,
    /// Luminance difference below which a pixel pair counts as repeating.
    pub moire_diff_threshold: f32,
    /// Sampling stride (pixels) for brightness and saturation statistics.
    pub sample_stride: usize,
    /// Target mean HSL saturation, in percent.
    pub saturation_target: f32,
    /// All three channels above this count as a specular/near-white pixel.
    pub near_white_level: u8,
    /// Moiré score above which a frame is labelled a print or screen.
    pub moire_label_threshold: f32,
    /// Reflectance score above which a frame is labelled a screen display.
    pub reflectance_label_threshold: f32,
    /// Texture score below which a frame is labelled a still image.
    pub texture_label_threshold: f32,
    /// Brightness-variation score below which a frame is labelled a replay.
    pub brightness_label_threshold: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            live_threshold: 55.0,
            texture_scale: 4.0,
            moire_diff_threshold: 2.0,
            sample_stride: 4,
            saturation_target: 55.0,
            near_white_level: 230,
            moire_label_threshold: 20.0,
            reflectance_label_threshold: 25.0,
            texture_label_threshold: 10.0,
            brightness_label_threshold: 10.0,
        }
    }
}

/// What the frame most likely shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpoofClass {
    StillImage,
    PrintOrScreen,
    ScreenDisplay,
    VideoReplay,
    RealFace,
}

/// Per-signal scores, each on a 0–100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalScores {
    pub texture: f32,
    pub moire: f32,
    pub brightness_variation: f32,
    pub saturation: f32,
    pub reflectance: f32,
}

impl SignalScores {
    /// Weighted composite, clamped to [0, 100].
    pub fn composite(&self) -> f32 {
        let score = WEIGHT_TEXTURE * self.texture
            + WEIGHT_MOIRE * (100.0 - self.moire)
            + WEIGHT_BRIGHTNESS * self.brightness_variation
            + WEIGHT_SATURATION * self.saturation
            + WEIGHT_REFLECTANCE * (100.0 - self.reflectance);
        score.clamp(0.0, 100.0)
    }

    /// Priority-ordered classification: moiré, reflectance, texture, brightness.
    pub fn classify(&self, config: &QualityConfig) -> SpoofClass {
        if self.moire > config.moire_label_threshold {
            SpoofClass::PrintOrScreen
        } else if self.reflectance > config.reflectance_label_threshold {
            SpoofClass::ScreenDisplay
        } else if self.texture < config.texture_label_threshold {
            SpoofClass::StillImage
        } else if self.brightness_variation < config.brightness_label_threshold {
            SpoofClass::VideoReplay
        } else {
            SpoofClass::RealFace
        }
    }
}

/// Result of analysing one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoofReport {
    pub score: f32,
    pub is_likely_live: bool,
    pub classification: SpoofClass,
    pub signals: SignalScores,
}

/// Score a frame for spoof indicators. Pure; never fails.
///
/// Frames narrower or shorter than 2 px produce a zero score.
pub fn analyze(frame: &FrameSample, config: &QualityConfig) -> SpoofReport {
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    if w < 2 || h < 2 {
        return SpoofReport {
            score: 0.0,
            is_likely_live: false,
            classification: SpoofClass::StillImage,
            signals: SignalScores::default(),
        };
    }

    let lum = frame.luminance();
    let stride = config.sample_stride.max(1);

    let signals = SignalScores {
        texture: (laplacian_energy(&lum, w, h) * config.texture_scale).clamp(0.0, 100.0),
        moire: moire_score(&lum, w, h, config.moire_diff_threshold),
        brightness_variation: brightness_variation(&lum, w, h, stride),
        saturation: saturation_score(frame, stride, config.saturation_target),
        reflectance: reflectance_score(frame, config.near_white_level),
    };

    let score = signals.composite();
    let classification = signals.classify(config);

    tracing::debug!(
        score,
        texture = signals.texture,
        moire = signals.moire,
        brightness = signals.brightness_variation,
        saturation = signals.saturation,
        reflectance = signals.reflectance,
        ?classification,
        "frame quality analysed"
    );

    SpoofReport {
        score,
        is_likely_live: score > config.live_threshold,
        classification,
        signals,
    }
}

/// Mean absolute 4-neighbour Laplacian over interior pixels.
fn laplacian_energy(lum: &[f32], w: usize, h: usize) -> f32 {
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut total = 0.0f64;
    let mut count = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = lum[y * w + x];
            let lap = 4.0 * c
                - lum[y * w + x - 1]
                - lum[y * w + x + 1]
                - lum[(y - 1) * w + x]
                - lum[(y + 1) * w + x];
            total += lap.abs() as f64;
            count += 1;
        }
    }
    (total / count as f64) as f32
}

/// Percentage of (+2,0) and (0,+2) pixel pairs with near-equal luminance.
fn moire_score(lum: &[f32], w: usize, h: usize, diff_threshold: f32) -> f32 {
    let mut similar = 0usize;
    let mut total = 0usize;
    for y in 0..h {
        for x in 0..w {
            let v = lum[y * w + x];
            if x + MOIRE_OFFSET < w {
                total += 1;
                if (v - lum[y * w + x + MOIRE_OFFSET]).abs() < diff_threshold {
                    similar += 1;
                }
            }
            if y + MOIRE_OFFSET < h {
                total += 1;
                if (v - lum[(y + MOIRE_OFFSET) * w + x]).abs() < diff_threshold {
                    similar += 1;
                }
            }
        }
    }
    if total == 0 {
        return 0.0;
    }
    similar as f32 / total as f32 * 100.0
}

/// Coefficient of variation of strided luminance samples, as a percentage.
fn brightness_variation(lum: &[f32], w: usize, h: usize, stride: usize) -> f32 {
    let samples: Vec<f32> = (0..h)
        .step_by(stride)
        .flat_map(|y| (0..w).step_by(stride).map(move |x| lum[y * w + x]))
        .collect();
    let n = samples.len() as f32;
    let mean = samples.iter().sum::<f32>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (variance.sqrt() / mean * 100.0).clamp(0.0, 100.0)
}

/// Closeness of mean HSL saturation to the target band.
fn saturation_score(frame: &FrameSample, stride: usize, target_pct: f32) -> f32 {
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    let mut total = 0.0f32;
    let mut count = 0usize;
    for y in (0..h).step_by(stride) {
        for x in (0..w).step_by(stride) {
            total += hsl_saturation(frame.rgb(x, y));
            count += 1;
        }
    }
    let mean_pct = total / count as f32 * 100.0;
    (100.0 - 2.0 * (mean_pct - target_pct).abs()).clamp(0.0, 100.0)
}

fn hsl_saturation([r, g, b]: [u8; 3]) -> f32 {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta <= f32::EPSILON {
        return 0.0;
    }
    let lightness = (max + min) / 2.0;
    if lightness > 0.5 {
        delta / (2.0 - max - min)
    } else {
        delta / (max + min)
    }
}

/// Percentage of pixels with every channel above `level`.
fn reflectance_score(frame: &FrameSample, level: u8) -> f32 {
    let w = frame.width() as usize;
    let h = frame.height() as usize;
    let mut bright = 0usize;
    for y in 0..h {
        for x in 0..w {
            if frame.rgb(x, y).iter().all(|&c| c > level) {
                bright += 1;
            }
        }
    }
    bright as f32 / (w * h) as f32 * 100.0
}

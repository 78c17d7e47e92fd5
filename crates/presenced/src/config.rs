use chrono::NaiveTime;
use presence_core::{PipelineConfig, ShiftConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
///
/// Loaded from the TOML file named by `PRESENCE_CONFIG` (if set), then
/// overridden field by field from `PRESENCE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Thresholds for every pipeline stage.
    pub pipeline: PipelineConfig,
    /// Shift applied to users without their own shift row.
    pub default_shift: ShiftConfig,
    /// Sessions idle longer than this are discarded by the engine.
    pub session_timeout_secs: u64,
    /// Upper bound on concurrently open scan sessions.
    pub max_sessions: usize,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("attendance.db"),
            pipeline: PipelineConfig::default(),
            default_shift: ShiftConfig::default(),
            session_timeout_secs: 30,
            max_sessions: 64,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load configuration from `PRESENCE_CONFIG` and `PRESENCE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PRESENCE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    fn apply_env(&mut self) {
        if let Ok(p) = std::env::var("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(p);
        }

        let pipeline = &mut self.pipeline;
        pipeline.match_threshold = env_f32("PRESENCE_MATCH_THRESHOLD", pipeline.match_threshold);
        pipeline.min_detection_confidence = env_f32(
            "PRESENCE_MIN_DETECTION_CONFIDENCE",
            pipeline.min_detection_confidence,
        );
        pipeline.quality.live_threshold =
            env_f32("PRESENCE_LIVE_THRESHOLD", pipeline.quality.live_threshold);
        pipeline.liveness.motion_variance =
            env_f32("PRESENCE_MOTION_VARIANCE", pipeline.liveness.motion_variance);

        let shift = &mut self.default_shift;
        shift.start_time = env_time("PRESENCE_SHIFT_START", shift.start_time);
        shift.end_time = env_time("PRESENCE_SHIFT_END", shift.end_time);
        shift.grace_period_minutes = env_u32("PRESENCE_GRACE_MINUTES", shift.grace_period_minutes);
        shift.overtime_threshold_minutes =
            env_u32("PRESENCE_OVERTIME_MINUTES", shift.overtime_threshold_minutes);

        self.session_timeout_secs =
            env_u64("PRESENCE_SESSION_TIMEOUT_SECS", self.session_timeout_secs);
        self.max_sessions = env_usize("PRESENCE_MAX_SESSIONS", self.max_sessions);
        self.session_bus = env_flag("PRESENCE_SESSION_BUS", self.session_bus);
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

fn env_time(key: &str, default: NaiveTime) -> NaiveTime {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_time(&v))
        .unwrap_or(default)
}

/// Falsey values as the CLI's `--session-bus` env fallback reads them;
/// anything else is true.
fn parse_flag(v: &str) -> bool {
    !matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "n" | "no" | "f" | "false" | "off"
    )
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| parse_flag(&v)).unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.pipeline.match_threshold, 0.45);
        assert_eq!(c.pipeline.quality.live_threshold, 55.0);
        assert_eq!(c.default_shift.grace_period_minutes, 15);
        assert!(c.db_path.ends_with("presence/attendance.db"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = Config::from_toml_str(
            r#"
            db_path = "/var/lib/presence/a.db"
            session_timeout_secs = 5

            [pipeline]
            match_threshold = 0.5

            [pipeline.quality]
            live_threshold = 60.0

            [default_shift]
            start_time = "08:30:00"
            end_time = "16:30:00"
            grace_period_minutes = 5
            overtime_threshold_minutes = 45
            "#,
        )
        .unwrap();
        assert_eq!(c.db_path, PathBuf::from("/var/lib/presence/a.db"));
        assert_eq!(c.session_timeout_secs, 5);
        assert_eq!(c.pipeline.match_threshold, 0.5);
        assert_eq!(c.pipeline.quality.live_threshold, 60.0);
        assert_eq!(c.pipeline.quality.texture_scale, 4.0);
        assert_eq!(c.pipeline.liveness.min_samples, 4);
        assert_eq!(c.default_shift.start_time, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(c.default_shift.overtime_threshold_minutes, 45);
        assert_eq!(c.max_sessions, 64);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            Config::from_toml_str("session_timeout_secs = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(parse_time("09:15"), NaiveTime::from_hms_opt(9, 15, 0));
        assert_eq!(parse_time("17:00:30"), NaiveTime::from_hms_opt(17, 0, 30));
        assert_eq!(parse_time("5pm"), None);
    }

    #[test]
    fn test_parse_flag() {
        for v in ["1", "true", "yes", "on", "TRUE"] {
            assert!(parse_flag(v), "{v}");
        }
        for v in ["0", "false", "False", "no", "off", "n", "f", ""] {
            assert!(!parse_flag(v), "{v}");
        }
    }
}

use std::path::PathBuf;

use presence_core::{DetectedFace, Embedding, LandmarkSample, ShiftConfig};
use serde::de::DeserializeOwned;
use zbus::interface;

use crate::config::Config;
use crate::scan::AttendanceService;

/// D-Bus interface for the presence attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
///
/// Structured arguments and results are JSON strings. Scan rejections are
/// ordinary results (`{"status": "rejected", ...}`); D-Bus errors are reserved
/// for malformed arguments and daemon failures.
pub struct PresenceService {
    pub service: AttendanceService,
    pub config: Config,
}

fn failed(context: &'static str, e: impl std::fmt::Display) -> zbus::fdo::Error {
    tracing::error!(error = %e, "{context} failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn parse_arg<T: DeserializeOwned>(name: &str, json: &str) -> zbus::fdo::Result<T> {
    serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{name}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.presence.Attendance1")]
impl PresenceService {
    /// Open a scan session for a device. Returns the session id.
    async fn open_session(&self, device_id: &str) -> zbus::fdo::Result<String> {
        if device_id.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("device_id is empty".into()));
        }
        self.service
            .engine()
            .open_session(device_id)
            .await
            .map_err(|e| failed("open_session", e))
    }

    /// Feed one landmark sample into the session. Returns the liveness verdict as JSON.
    async fn push_landmarks(&self, session_id: &str, sample_json: &str) -> zbus::fdo::Result<String> {
        let sample: LandmarkSample = parse_arg("sample_json", sample_json)?;
        let verdict = self
            .service
            .engine()
            .push_landmarks(session_id, sample)
            .await
            .map_err(|e| failed("push_landmarks", e))?;
        to_json(&verdict)
    }

    /// Score a frame and record the attendance event it represents.
    ///
    /// `faces_json` is the detector output for the frame: an array of faces
    /// with bounding box, confidence, optional eye/nose landmarks and
    /// embedding.
    async fn scan(
        &self,
        session_id: &str,
        frame_path: &str,
        faces_json: &str,
    ) -> zbus::fdo::Result<String> {
        let faces: Vec<DetectedFace> = parse_arg("faces_json", faces_json)?;
        tracing::debug!(session = session_id, frame_path, faces = faces.len(), "scan requested");
        let outcome = self
            .service
            .scan(session_id, PathBuf::from(frame_path), faces)
            .await
            .map_err(|e| failed("scan", e))?;
        to_json(&outcome)
    }

    async fn close_session(&self, session_id: &str) -> zbus::fdo::Result<bool> {
        self.service
            .engine()
            .close_session(session_id)
            .await
            .map_err(|e| failed("close_session", e))
    }

    /// Enroll an embedding for a user. Returns the enrollment UUID.
    async fn enroll(&self, user: &str, label: &str, embedding_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user, label, "enroll requested");
        let embedding: Embedding = parse_arg("embedding_json", embedding_json)?;
        let id = self
            .service
            .store()
            .enroll(user, label, &embedding)
            .await
            .map_err(|e| failed("enroll", e))?;
        tracing::info!(enrollment = %id, user, label, "enrolled successfully");
        Ok(id)
    }

    /// List a user's enrollments as JSON.
    async fn list_enrollments(&self, user: &str) -> zbus::fdo::Result<String> {
        let enrollments = self
            .service
            .store()
            .list_enrollments(user)
            .await
            .map_err(|e| failed("list_enrollments", e))?;
        to_json(&enrollments)
    }

    /// Remove an enrollment by ID (scoped to user).
    async fn remove_enrollment(&self, user: &str, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(user, id, "remove_enrollment requested");
        let removed = self
            .service
            .store()
            .remove_enrollment(user, id)
            .await
            .map_err(|e| failed("remove_enrollment", e))?;
        if !removed {
            tracing::warn!(id, user, "enrollment not found or not owned by user");
        }
        Ok(removed)
    }

    async fn set_shift(&self, user: &str, shift_json: &str) -> zbus::fdo::Result<()> {
        let shift: ShiftConfig = parse_arg("shift_json", shift_json)?;
        tracing::info!(
            user,
            start = %shift.start_time,
            end = %shift.end_time,
            grace = shift.grace_period_minutes,
            overtime = shift.overtime_threshold_minutes,
            "shift updated"
        );
        self.service
            .store()
            .set_shift(user, &shift)
            .await
            .map_err(|e| failed("set_shift", e))
    }

    /// The user's effective shift (own row or the daemon default) as JSON.
    async fn get_shift(&self, user: &str) -> zbus::fdo::Result<String> {
        let shift = self
            .service
            .effective_shift(user)
            .await
            .map_err(|e| failed("get_shift", e))?;
        to_json(&shift)
    }

    /// Today's attendance entries for a user.
    async fn logs_today(&self, user: &str) -> zbus::fdo::Result<String> {
        let (logs, finished) = self
            .service
            .logs_today(user)
            .await
            .map_err(|e| failed("logs_today", e))?;
        to_json(&serde_json::json!({
            "logsToday": logs,
            "finished": finished,
        }))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let store = self.service.store();
        let enrollments = store.count_enrollments().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "status: counting enrollments failed");
            0
        });
        let entries = store.count_entries().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "status: counting attendance entries failed");
            0
        });
        let engine = self
            .service
            .engine()
            .stats()
            .await
            .map_err(|e| failed("status", e))?;

        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enrollments": enrollments,
            "attendance_entries": entries,
            "open_sessions": engine.open_sessions,
            "frames_scored": engine.frames_scored,
            "locked_devices": self.service.locked_devices().await,
            "busy_users": self.service.busy_users().await,
            "match_threshold": self.config.pipeline.match_threshold,
            "live_threshold": self.config.pipeline.quality.live_threshold,
            "session_bus": self.config.session_bus,
        }))
    }
}

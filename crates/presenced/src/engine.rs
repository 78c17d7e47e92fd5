use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use presence_core::{
    DetectedFace, FrameError, FrameSample, GalleryEntry, LandmarkSample, LivenessTracker,
    LivenessVerdict, PipelineConfig, ScanPipeline, ScanRejection, ScanRequest, VerifiedScan,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("unknown or expired session: {0}")]
    UnknownSession(String),
    #[error("session limit reached ({0} open)")]
    SessionLimit(usize),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Outcome of the verification stages for one frame.
pub type VerifyOutcome = Result<VerifiedScan, ScanRejection>;

/// Engine counters reported by `Status`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineStats {
    pub open_sessions: usize,
    pub frames_scored: u64,
}

/// Messages sent from the orchestrator to the engine thread.
enum EngineRequest {
    OpenSession {
        device_id: String,
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
    PushLandmarks {
        session_id: String,
        sample: LandmarkSample,
        reply: oneshot::Sender<Result<LivenessVerdict, EngineError>>,
    },
    SessionDevice {
        session_id: String,
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
    Verify {
        session_id: String,
        frame_path: PathBuf,
        faces: Vec<DetectedFace>,
        gallery: Vec<GalleryEntry>,
        timestamp: NaiveDateTime,
        reply: oneshot::Sender<Result<VerifyOutcome, EngineError>>,
    },
    CloseSession {
        session_id: String,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Shutdown,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Open a scan session for a device. Returns the session id.
    pub async fn open_session(&self, device_id: &str) -> Result<String, EngineError> {
        let device_id = device_id.to_string();
        self.request(|reply| EngineRequest::OpenSession { device_id, reply })
            .await?
    }

    /// Feed a landmark sample captured between scans into the session's tracker.
    pub async fn push_landmarks(
        &self,
        session_id: &str,
        sample: LandmarkSample,
    ) -> Result<LivenessVerdict, EngineError> {
        let session_id = session_id.to_string();
        self.request(|reply| EngineRequest::PushLandmarks {
            session_id,
            sample,
            reply,
        })
        .await?
    }

    /// Device that opened the session.
    pub async fn session_device(&self, session_id: &str) -> Result<String, EngineError> {
        let session_id = session_id.to_string();
        self.request(|reply| EngineRequest::SessionDevice { session_id, reply })
            .await?
    }

    /// Decode the frame and run the detection, spoof, liveness and identity stages.
    pub async fn verify(
        &self,
        session_id: &str,
        frame_path: PathBuf,
        faces: Vec<DetectedFace>,
        gallery: Vec<GalleryEntry>,
        timestamp: NaiveDateTime,
    ) -> Result<VerifyOutcome, EngineError> {
        let session_id = session_id.to_string();
        self.request(|reply| EngineRequest::Verify {
            session_id,
            frame_path,
            faces,
            gallery,
            timestamp,
            reply,
        })
        .await?
    }

    pub async fn close_session(&self, session_id: &str) -> Result<bool, EngineError> {
        let session_id = session_id.to_string();
        self.request(|reply| EngineRequest::CloseSession { session_id, reply })
            .await
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        self.request(|reply| EngineRequest::Stats { reply }).await
    }

    /// Ask the engine thread to exit after draining queued requests.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineRequest::Shutdown).await;
    }
}

/// One device's scan interaction.
struct Session {
    device_id: String,
    tracker: LivenessTracker,
    last_seen: Instant,
    next_tick: u64,
}

impl Session {
    fn tick(&mut self) -> u64 {
        let t = self.next_tick;
        self.next_tick += 1;
        self.last_seen = Instant::now();
        t
    }
}

/// Session table and pipeline owned by the engine thread.
struct Engine {
    pipeline: ScanPipeline,
    sessions: HashMap<String, Session>,
    session_timeout: Duration,
    max_sessions: usize,
    frames_scored: u64,
}

impl Engine {
    fn new(pipeline: PipelineConfig, session_timeout: Duration, max_sessions: usize) -> Self {
        Self {
            pipeline: ScanPipeline::new(pipeline),
            sessions: HashMap::new(),
            session_timeout,
            max_sessions,
            frames_scored: 0,
        }
    }

    fn prune_expired(&mut self) {
        let timeout = self.session_timeout;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.last_seen.elapsed() < timeout);
        let dropped = before - self.sessions.len();
        if dropped > 0 {
            tracing::debug!(dropped, "expired idle sessions");
        }
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut Session, EngineError> {
        self.prune_expired();
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }

    fn open_session(&mut self, device_id: String) -> Result<String, EngineError> {
        self.prune_expired();
        if self.sessions.len() >= self.max_sessions {
            return Err(EngineError::SessionLimit(self.sessions.len()));
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session = %session_id, device = %device_id, "session opened");
        self.sessions.insert(
            session_id.clone(),
            Session {
                device_id,
                tracker: self.pipeline.new_tracker(),
                last_seen: Instant::now(),
                next_tick: 0,
            },
        );
        Ok(session_id)
    }

    fn push_landmarks(
        &mut self,
        session_id: &str,
        mut sample: LandmarkSample,
    ) -> Result<LivenessVerdict, EngineError> {
        let session = self.session_mut(session_id)?;
        sample.captured_at_tick = session.tick();
        Ok(session.tracker.update(sample))
    }

    fn verify(
        &mut self,
        session_id: &str,
        frame_path: &std::path::Path,
        faces: &[DetectedFace],
        gallery: &[GalleryEntry],
        timestamp: NaiveDateTime,
    ) -> Result<VerifyOutcome, EngineError> {
        // Reject unknown sessions before paying for the decode.
        self.session_mut(session_id)?;
        let frame = FrameSample::open(frame_path)?;
        tracing::debug!(
            path = %frame_path.display(),
            width = frame.width(),
            height = frame.height(),
            faces = faces.len(),
            "frame decoded"
        );

        let pipeline = &self.pipeline;
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
        let tick = session.tick();
        let request = ScanRequest {
            frame: &frame,
            faces,
            device_id: &session.device_id,
            timestamp,
            tick,
        };
        let outcome = pipeline.verify(&request, &mut session.tracker, gallery);
        self.frames_scored += 1;
        Ok(outcome)
    }

    fn close_session(&mut self, session_id: &str) -> bool {
        let closed = self.sessions.remove(session_id).is_some();
        if closed {
            tracing::info!(session = session_id, "session closed");
        }
        closed
    }

    fn stats(&mut self) -> EngineStats {
        self.prune_expired();
        EngineStats {
            open_sessions: self.sessions.len(),
            frames_scored: self.frames_scored,
        }
    }
}

/// Spawn the scoring engine on a dedicated OS thread.
///
/// The thread owns every session's liveness tracker; nothing outside it
/// touches them. It exits on [`EngineHandle::shutdown`] or once every
/// handle is dropped.
pub fn spawn_engine(
    pipeline: PipelineConfig,
    session_timeout: Duration,
    max_sessions: usize,
) -> Result<EngineHandle, EngineError> {
    let mut engine = Engine::new(pipeline, session_timeout, max_sessions);
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::OpenSession { device_id, reply } => {
                        let _ = reply.send(engine.open_session(device_id));
                    }
                    EngineRequest::PushLandmarks {
                        session_id,
                        sample,
                        reply,
                    } => {
                        let _ = reply.send(engine.push_landmarks(&session_id, sample));
                    }
                    EngineRequest::SessionDevice { session_id, reply } => {
                        let device = engine
                            .session_mut(&session_id)
                            .map(|s| s.device_id.clone());
                        let _ = reply.send(device);
                    }
                    EngineRequest::Verify {
                        session_id,
                        frame_path,
                        faces,
                        gallery,
                        timestamp,
                        reply,
                    } => {
                        let result =
                            engine.verify(&session_id, &frame_path, &faces, &gallery, timestamp);
                        let _ = reply.send(result);
                    }
                    EngineRequest::CloseSession { session_id, reply } => {
                        let _ = reply.send(engine.close_session(&session_id));
                    }
                    EngineRequest::Stats { reply } => {
                        let _ = reply.send(engine.stats());
                    }
                    EngineRequest::Shutdown => break,
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

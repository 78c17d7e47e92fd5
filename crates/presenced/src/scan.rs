use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use presence_core::{
    AttendanceLogEntry, DetectedFace, ScanOutcome, ScanPipeline, ScanRejection, ShiftConfig,
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::engine::{EngineError, EngineHandle};
use crate::locks::UserLocks;
use crate::rate_limiter::RateLimiter;
use crate::store::{AttendanceStore, StoreError};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Source of scan timestamps (local wall-clock time).
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Local::now().naive_local())
}

/// Runs one scan attempt end to end: rate limit, engine verification,
/// per-user serialized resolution and the conflict-checked append.
#[derive(Clone)]
pub struct AttendanceService {
    store: AttendanceStore,
    engine: EngineHandle,
    pipeline: ScanPipeline,
    default_shift: ShiftConfig,
    locks: UserLocks,
    rate_limiter: Arc<Mutex<RateLimiter>>,
    clock: Clock,
}

impl AttendanceService {
    pub fn new(
        store: AttendanceStore,
        engine: EngineHandle,
        pipeline: ScanPipeline,
        default_shift: ShiftConfig,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            engine,
            pipeline,
            default_shift,
            locks: UserLocks::new(),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new())),
            clock,
        }
    }

    pub fn store(&self) -> &AttendanceStore {
        &self.store
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    /// The user's shift, or the configured default.
    pub async fn effective_shift(&self, user: &str) -> Result<ShiftConfig, StoreError> {
        Ok(self
            .store
            .shift_for(user)
            .await?
            .unwrap_or(self.default_shift))
    }

    /// Today's entries for a user and whether the day is finished.
    pub async fn logs_today(
        &self,
        user: &str,
    ) -> Result<(Vec<AttendanceLogEntry>, bool), StoreError> {
        let logs = self.store.logs_for_day(user, self.now().date()).await?;
        let finished = presence_core::AttendanceState::from_entries(&logs).is_finished();
        Ok((logs, finished))
    }

    pub async fn locked_devices(&self) -> usize {
        self.rate_limiter.lock().await.locked_devices()
    }

    /// Users whose scans currently hold or await the serialization lock.
    pub async fn busy_users(&self) -> usize {
        self.locks.active().await
    }

    /// Process one frame from a session.
    ///
    /// Rejections are returned as [`ScanOutcome::Rejected`]; only storage or
    /// engine failures surface as errors.
    pub async fn scan(
        &self,
        session_id: &str,
        frame_path: PathBuf,
        faces: Vec<DetectedFace>,
    ) -> Result<ScanOutcome, ScanError> {
        let device_id = self.engine.session_device(session_id).await?;

        if let Err(retry_after_secs) = self.rate_limiter.lock().await.check(&device_id) {
            tracing::warn!(device = %device_id, retry_after_secs, "scan refused, device rate limited");
            return Ok(ScanOutcome::Rejected(ScanRejection::RateLimited {
                device_id,
                retry_after_secs,
            }));
        }

        let timestamp = self.now();
        let gallery = self.store.gallery().await?;
        let verified = match self
            .engine
            .verify(session_id, frame_path, faces, gallery, timestamp)
            .await?
        {
            Ok(v) => v,
            Err(rejection) => return Ok(self.reject(&device_id, rejection).await),
        };

        let user_id = verified.user_id.clone();
        let _guard = self.locks.lock(&user_id).await;

        let shift = self.effective_shift(&user_id).await?;
        let todays_logs = self.store.logs_for_day(&user_id, timestamp.date()).await?;
        let accepted = match self
            .pipeline
            .admit(&verified, &device_id, timestamp, &shift, &todays_logs)
        {
            Ok(a) => a,
            Err(rejection) => return Ok(self.reject(&device_id, rejection).await),
        };

        let expected_last = todays_logs.last().map(|e| e.timestamp);
        match self.store.append_entry(&accepted.entry, expected_last).await {
            Ok(entry_id) => {
                self.rate_limiter.lock().await.record_success(&device_id);
                tracing::info!(
                    user = %user_id,
                    event = %accepted.event_type,
                    device = %device_id,
                    entry = %entry_id,
                    minutes_late = accepted.punctuality.minutes_late,
                    minutes_early = accepted.punctuality.minutes_early,
                    minutes_overtime = accepted.punctuality.minutes_overtime,
                    "attendance recorded"
                );
                Ok(ScanOutcome::Accepted(accepted))
            }
            Err(StoreError::Conflict { user }) => Ok(self
                .reject(&device_id, ScanRejection::ConcurrentConflict { user_id: user })
                .await),
            Err(e) => Err(e.into()),
        }
    }

    async fn reject(&self, device_id: &str, rejection: ScanRejection) -> ScanOutcome {
        tracing::warn!(
            kind = rejection.kind(),
            device = device_id,
            detail = %rejection,
            "scan rejected"
        );
        if rejection.is_suspicious() {
            self.rate_limiter.lock().await.record_failure(device_id);
        }
        ScanOutcome::Rejected(rejection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use chrono::{NaiveDate, NaiveTime};
    use presence_core::liveness::LivenessReason;
    use presence_core::{
        BoundingBox, Embedding, EventType, LandmarkSample, PipelineConfig, Point, EMBEDDING_DIM,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::path::Path;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    fn unit_embedding(axis: usize) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[axis] = 1.0;
        Embedding::new(values)
    }

    fn face(cx: f32, embedding: Embedding) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: cx - 50.0,
                y: 190.0,
                width: 100.0,
                height: 100.0,
            },
            confidence: 0.9,
            left_eye: Some(Point::new(cx - 20.0, 220.0)),
            right_eye: Some(Point::new(cx + 20.0, 220.0)),
            nose: Some(Point::new(cx, 240.0)),
            embedding,
        }
    }

    fn sample(cx: f32) -> LandmarkSample {
        face(cx, Embedding::new(vec![])).landmark_sample(0).unwrap()
    }

    fn write_png(live: bool) -> PathBuf {
        let data: Vec<u8> = if live {
            let mut rng = StdRng::seed_from_u64(42);
            (0..64 * 64 * 3).map(|_| rng.gen()).collect()
        } else {
            vec![128; 64 * 64 * 3]
        };
        let img = image::RgbImage::from_raw(64, 64, data).unwrap();
        let path = std::env::temp_dir().join(format!("presence-{}.png", uuid::Uuid::new_v4()));
        img.save(&path).unwrap();
        path
    }

    /// Clock advanced by the test through a shared minute counter.
    fn test_clock(minutes: Arc<AtomicI64>) -> Clock {
        Arc::new(move || {
            NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                + chrono::Duration::minutes(minutes.load(Ordering::SeqCst))
        })
    }

    async fn service(minutes: Arc<AtomicI64>) -> AttendanceService {
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();
        store.enroll("alice", "default", &unit_embedding(0)).await.unwrap();
        store.enroll("bob", "default", &unit_embedding(1)).await.unwrap();
        let engine = spawn_engine(PipelineConfig::default(), Duration::from_secs(60), 8).unwrap();
        let shift = ShiftConfig {
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            grace_period_minutes: 10,
            overtime_threshold_minutes: 30,
        };
        AttendanceService::new(
            store,
            engine,
            ScanPipeline::default(),
            shift,
            test_clock(minutes),
        )
    }

    async fn warm_session(svc: &AttendanceService, device: &str) -> String {
        let id = svc.engine().open_session(device).await.unwrap();
        for i in 0..3 {
            svc.engine()
                .push_landmarks(&id, sample(300.0 + i as f32 * 3.0))
                .await
                .unwrap();
        }
        id
    }

    async fn scan_as(svc: &AttendanceService, session: &str, axis: usize) -> ScanOutcome {
        let path = write_png(true);
        let outcome = svc
            .scan(session, path.clone(), vec![face(310.0, unit_embedding(axis))])
            .await
            .unwrap();
        let _ = std::fs::remove_file(&path);
        outcome
    }

    #[tokio::test]
    async fn test_full_day_for_one_user() {
        let minutes = Arc::new(AtomicI64::new(9 * 60 + 25));
        let svc = service(minutes.clone()).await;
        let session = warm_session(&svc, "lobby").await;

        let ScanOutcome::Accepted(check_in) = scan_as(&svc, &session, 0).await else {
            panic!("check-in rejected");
        };
        assert_eq!(check_in.event_type, EventType::CheckIn);
        assert_eq!(check_in.matched_user_id, "alice");
        assert_eq!(check_in.punctuality.minutes_late, 15);

        minutes.store(17 * 60 + 45, Ordering::SeqCst);
        let ScanOutcome::Accepted(check_out) = scan_as(&svc, &session, 0).await else {
            panic!("check-out rejected");
        };
        assert_eq!(check_out.event_type, EventType::CheckOut);
        assert_eq!(check_out.punctuality.minutes_overtime, 15);

        minutes.store(18 * 60, Ordering::SeqCst);
        let third = scan_as(&svc, &session, 0).await;
        assert!(matches!(
            third,
            ScanOutcome::Rejected(ScanRejection::AlreadyFinished { .. })
        ));

        let (logs, finished) = svc.logs_today("alice").await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(finished);
    }

    #[tokio::test]
    async fn test_user_shift_overrides_default() {
        let minutes = Arc::new(AtomicI64::new(8 * 60));
        let svc = service(minutes).await;
        let early_shift = ShiftConfig {
            start_time: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            grace_period_minutes: 0,
            overtime_threshold_minutes: 0,
        };
        svc.store().set_shift("bob", &early_shift).await.unwrap();
        let session = warm_session(&svc, "dock").await;

        let ScanOutcome::Accepted(accepted) = scan_as(&svc, &session, 1).await else {
            panic!("scan rejected");
        };
        assert_eq!(accepted.matched_user_id, "bob");
        assert_eq!(accepted.punctuality.minutes_late, 60);
    }

    #[tokio::test]
    async fn test_spoofed_frames_lock_device() {
        let minutes = Arc::new(AtomicI64::new(9 * 60));
        let svc = service(minutes).await;
        let session = warm_session(&svc, "lobby").await;

        for _ in 0..5 {
            let path = write_png(false);
            let outcome = svc
                .scan(&session, path.clone(), vec![face(310.0, unit_embedding(0))])
                .await
                .unwrap();
            let _ = std::fs::remove_file(&path);
            assert!(matches!(
                outcome,
                ScanOutcome::Rejected(ScanRejection::SpoofSuspected { .. })
            ));
        }

        let outcome = scan_as(&svc, &session, 0).await;
        assert!(matches!(
            outcome,
            ScanOutcome::Rejected(ScanRejection::RateLimited { .. })
        ));
        assert_eq!(svc.locked_devices().await, 1);
        assert!(svc.logs_today("alice").await.unwrap().0.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_sessions_do_not_lock_device() {
        let minutes = Arc::new(AtomicI64::new(9 * 60));
        let svc = service(minutes).await;
        let a = svc.engine().open_session("lobby").await.unwrap();
        let b = svc.engine().open_session("lobby").await.unwrap();

        for (session, axis) in [(&a, 0), (&a, 0), (&a, 0), (&b, 1), (&b, 1), (&b, 1)] {
            let outcome = scan_as(&svc, session, axis).await;
            assert!(
                matches!(
                    &outcome,
                    ScanOutcome::Rejected(ScanRejection::LivenessNotConfirmed { verdict })
                        if verdict.reason == LivenessReason::InsufficientSamples
                ),
                "warm-up scan gave {outcome:?}"
            );
        }
        assert_eq!(svc.locked_devices().await, 0);

        svc.engine().push_landmarks(&b, sample(320.0)).await.unwrap();
        let ScanOutcome::Accepted(accepted) = scan_as(&svc, &b, 1).await else {
            panic!("warmed-up scan rejected");
        };
        assert_eq!(accepted.matched_user_id, "bob");
    }

    #[tokio::test]
    async fn test_no_face_is_not_persisted() {
        let minutes = Arc::new(AtomicI64::new(9 * 60));
        let svc = service(minutes).await;
        let session = warm_session(&svc, "lobby").await;
        let path = write_png(true);
        let outcome = svc.scan(&session, path.clone(), vec![]).await.unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(outcome, ScanOutcome::Rejected(ScanRejection::NoFaceDetected));
        assert_eq!(svc.store().count_entries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_is_error() {
        let minutes = Arc::new(AtomicI64::new(9 * 60));
        let svc = service(minutes).await;
        let err = svc
            .scan("missing", PathBuf::from("/tmp/none.png"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Engine(EngineError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn test_concurrent_scans_record_one_check_in() {
        let minutes = Arc::new(AtomicI64::new(9 * 60));
        let svc = service(minutes).await;
        let a = warm_session(&svc, "lobby").await;
        let b = warm_session(&svc, "dock").await;

        let (ra, rb) = tokio::join!(scan_as(&svc, &a, 0), scan_as(&svc, &b, 0));
        let accepted = [&ra, &rb].iter().filter(|o| o.is_accepted()).count();
        assert_eq!(accepted, 1);
        let rejected = if ra.is_accepted() { rb } else { ra };
        assert!(matches!(
            rejected,
            ScanOutcome::Rejected(ScanRejection::StaleTimestamp { .. })
        ));
        assert_eq!(svc.logs_today("alice").await.unwrap().0.len(), 1);
    }
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Suspicious rejections tolerated per device within WINDOW.
const MAX_FAILURES: u32 = 5;
/// Sliding window over which failures are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// Lockout duration after exceeding MAX_FAILURES.
const LOCKOUT: Duration = Duration::from_secs(300);

struct DeviceRecord {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl DeviceRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// Per-device rate limiter for scan attempts.
///
/// Only suspicious rejections (spoof suspected, liveness failing on a full
/// window, no confident match) count as failures. A session still collecting
/// liveness samples and attendance-state rejections such as `AlreadyFinished`
/// never lock a device.
///
/// Records for devices that are neither locked nor inside an open window are
/// evicted on every `check` and `record_failure`.
pub struct RateLimiter {
    records: HashMap<String, DeviceRecord>,
    max_failures: u32,
    window: Duration,
    lockout: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(MAX_FAILURES, WINDOW, LOCKOUT)
    }

    pub fn with_limits(max_failures: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            max_failures,
            window,
            lockout,
        }
    }

    /// `Ok(())` if the device may scan, otherwise `Err(retry_after_secs)`.
    pub fn check(&mut self, device: &str) -> Result<(), u64> {
        let now = Instant::now();
        self.prune(now);
        let Some(record) = self.records.get_mut(device) else {
            return Ok(());
        };

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                // Round up so callers never retry a moment too early.
                let remaining = locked_until.duration_since(now);
                return Err(remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0));
            }
            // Lockout expired
            *record = DeviceRecord::fresh(now);
        } else if now.duration_since(record.window_start) >= self.window {
            record.failures = 0;
            record.window_start = now;
        }

        Ok(())
    }

    /// Record a suspicious rejection. May trigger a lockout.
    pub fn record_failure(&mut self, device: &str) {
        let now = Instant::now();
        self.prune(now);
        let record = self
            .records
            .entry(device.to_string())
            .or_insert_with(|| DeviceRecord::fresh(now));

        if now.duration_since(record.window_start) >= self.window {
            record.failures = 0;
            record.window_start = now;
        }

        record.failures += 1;
        if record.failures >= self.max_failures {
            record.locked_until = Some(now + self.lockout);
            tracing::warn!(
                device,
                failures = record.failures,
                lockout_secs = self.lockout.as_secs(),
                "rate limit triggered, locking device"
            );
        } else {
            tracing::debug!(
                device,
                failures = record.failures,
                max = self.max_failures,
                "suspicious scan, incrementing failure counter"
            );
        }
    }

    /// Record an accepted scan and clear the device's counter.
    pub fn record_success(&mut self, device: &str) {
        self.records.remove(device);
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.records.retain(|_, r| {
            r.locked_until.is_some_and(|t| now < t) || now.duration_since(r.window_start) < window
        });
    }

    /// Devices currently locked out.
    pub fn locked_devices(&self) -> usize {
        let now = Instant::now();
        self.records
            .values()
            .filter(|r| r.locked_until.is_some_and(|t| now < t))
            .count()
    }
}

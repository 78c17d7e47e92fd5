//! Attendance event resolution.
//!
//! Per `(user, calendar day)` the log moves `NoEvent → CheckedIn → CheckedOut`.
//! `CheckedOut` is terminal: a third scan on the same day is rejected. The
//! lateness/overtime figures are advisory and never block an event.

use crate::types::{AttendanceLogEntry, EventType, Punctuality, ShiftConfig};
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceState {
    NoEvent,
    CheckedIn,
    CheckedOut,
}

impl AttendanceState {
    /// State implied by a day's entries, oldest first.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a AttendanceLogEntry>) -> Self {
        match entries.into_iter().last().map(|e| e.event_type) {
            None => AttendanceState::NoEvent,
            Some(EventType::CheckIn) => AttendanceState::CheckedIn,
            Some(EventType::CheckOut) => AttendanceState::CheckedOut,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, AttendanceState::CheckedOut)
    }
}

/// An accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub event_type: EventType,
    pub previous: AttendanceState,
    pub punctuality: Punctuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolveRejection {
    /// Both events for the day are already logged.
    AlreadyFinished {
        user_id: String,
        checked_out_at: NaiveDateTime,
    },
    /// The scan is not strictly after the day's last logged event.
    StaleTimestamp {
        user_id: String,
        last_event_at: NaiveDateTime,
    },
}

/// Decide which event a scan at `timestamp` represents.
///
/// Only entries belonging to `user_id` on the same calendar day as
/// `timestamp` are considered; the slice is expected oldest first.
pub fn resolve(
    user_id: &str,
    timestamp: NaiveDateTime,
    shift: &ShiftConfig,
    todays_logs: &[AttendanceLogEntry],
) -> Result<Resolution, ResolveRejection> {
    let day = timestamp.date();
    let relevant: Vec<&AttendanceLogEntry> = todays_logs
        .iter()
        .filter(|e| e.user_id == user_id && e.day() == day)
        .collect();

    let previous = AttendanceState::from_entries(relevant.iter().copied());

    if let Some(last) = relevant.last() {
        if previous.is_finished() {
            return Err(ResolveRejection::AlreadyFinished {
                user_id: user_id.to_string(),
                checked_out_at: last.timestamp,
            });
        }
        if timestamp <= last.timestamp {
            return Err(ResolveRejection::StaleTimestamp {
                user_id: user_id.to_string(),
                last_event_at: last.timestamp,
            });
        }
    }

    let time = timestamp.time();
    let (event_type, punctuality) = match previous {
        AttendanceState::NoEvent => (
            EventType::CheckIn,
            Punctuality {
                minutes_late: minutes_late(time, shift),
                ..Punctuality::default()
            },
        ),
        _ => (
            EventType::CheckOut,
            Punctuality {
                minutes_early: minutes_early(time, shift),
                minutes_overtime: minutes_overtime(time, shift),
                ..Punctuality::default()
            },
        ),
    };

    Ok(Resolution {
        event_type,
        previous,
        punctuality,
    })
}

/// Whole minutes past `shift_start + grace`; 0 when on time.
pub fn minutes_late(time: NaiveTime, shift: &ShiftConfig) -> i64 {
    let deadline = seconds_of_day(shift.start_time) + shift.grace_period_minutes as i64 * 60;
    whole_minutes(seconds_of_day(time) - deadline)
}

/// Whole minutes past `shift_end + overtime_threshold`; 0 otherwise.
pub fn minutes_overtime(time: NaiveTime, shift: &ShiftConfig) -> i64 {
    let start = seconds_of_day(shift.end_time) + shift.overtime_threshold_minutes as i64 * 60;
    whole_minutes(seconds_of_day(time) - start)
}

/// Whole minutes before `shift_end`; 0 otherwise.
pub fn minutes_early(time: NaiveTime, shift: &ShiftConfig) -> i64 {
    whole_minutes(seconds_of_day(shift.end_time) - seconds_of_day(time))
}

fn seconds_of_day(t: NaiveTime) -> i64 {
    t.num_seconds_from_midnight() as i64
}

fn whole_minutes(seconds: i64) -> i64 {
    seconds.max(0) / 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn shift() -> ShiftConfig {
        ShiftConfig {
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            grace_period_minutes: 10,
            overtime_threshold_minutes: 30,
        }
    }

    fn log(user: &str, ts: NaiveDateTime, event_type: EventType) -> AttendanceLogEntry {
        AttendanceLogEntry {
            user_id: user.into(),
            timestamp: ts,
            event_type,
            match_distance: 0.2,
            confidence: 0.5,
            device_id: "kiosk-1".into(),
            spoof_score: 80.0,
            punctuality: Punctuality::default(),
        }
    }

    #[test]
    fn test_first_scan_at_shift_start_is_on_time_check_in() {
        let r = resolve("U1", at(9, 0), &shift(), &[]).unwrap();
        assert_eq!(r.event_type, EventType::CheckIn);
        assert_eq!(r.previous, AttendanceState::NoEvent);
        assert_eq!(r.punctuality.minutes_late, 0);
        assert!(r.punctuality.on_time());
    }

    #[test]
    fn test_late_boundary() {
        let s = shift();
        assert_eq!(resolve("U1", at(9, 10), &s, &[]).unwrap().punctuality.minutes_late, 0);
        assert_eq!(resolve("U1", at(9, 11), &s, &[]).unwrap().punctuality.minutes_late, 1);
        assert_eq!(resolve("U1", at(10, 0), &s, &[]).unwrap().punctuality.minutes_late, 50);
    }

    #[test]
    fn test_check_out_overtime() {
        let logs = vec![log("U1", at(9, 0), EventType::CheckIn)];
        let r = resolve("U1", at(17, 45), &shift(), &logs).unwrap();
        assert_eq!(r.event_type, EventType::CheckOut);
        assert_eq!(r.previous, AttendanceState::CheckedIn);
        assert_eq!(r.punctuality.minutes_overtime, 15);
        assert_eq!(r.punctuality.minutes_early, 0);
    }

    #[test]
    fn test_check_out_early() {
        let logs = vec![log("U1", at(9, 0), EventType::CheckIn)];
        let r = resolve("U1", at(16, 20), &shift(), &logs).unwrap();
        assert_eq!(r.event_type, EventType::CheckOut);
        assert_eq!(r.punctuality.minutes_early, 40);
        assert_eq!(r.punctuality.minutes_overtime, 0);
    }

    #[test]
    fn test_third_scan_already_finished() {
        let logs = vec![
            log("U1", at(9, 0), EventType::CheckIn),
            log("U1", at(17, 0), EventType::CheckOut),
        ];
        let err = resolve("U1", at(18, 0), &shift(), &logs).unwrap_err();
        assert_eq!(
            err,
            ResolveRejection::AlreadyFinished {
                user_id: "U1".into(),
                checked_out_at: at(17, 0),
            }
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let logs = vec![log("U1", at(9, 30), EventType::CheckIn)];
        let err = resolve("U1", at(9, 30), &shift(), &logs).unwrap_err();
        assert!(matches!(err, ResolveRejection::StaleTimestamp { .. }));
    }

    #[test]
    fn test_foreign_entries_ignored() {
        let yesterday = at(9, 0) - chrono::Duration::days(1);
        let logs = vec![
            log("U2", at(8, 0), EventType::CheckIn),
            log("U1", yesterday, EventType::CheckIn),
        ];
        let r = resolve("U1", at(9, 5), &shift(), &logs).unwrap();
        assert_eq!(r.event_type, EventType::CheckIn);
    }

    #[test]
    fn test_resolve_is_idempotent_without_append() {
        let logs = vec![log("U1", at(9, 0), EventType::CheckIn)];
        let a = resolve("U1", at(12, 0), &shift(), &logs);
        let b = resolve("U1", at(12, 0), &shift(), &logs);
        assert_eq!(a, b);
        assert_eq!(a.unwrap().event_type, EventType::CheckOut);
    }

    #[test]
    fn test_seconds_floor_to_whole_minutes() {
        let s = shift();
        let t = NaiveTime::from_hms_opt(9, 11, 59).unwrap();
        assert_eq!(minutes_late(t, &s), 1);
    }

    #[test]
    fn test_alternation_invariant_under_random_scans() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let s = shift();
        for _ in 0..200 {
            let mut logs: Vec<AttendanceLogEntry> = Vec::new();
            let mut minute = rng.gen_range(0..600u32);
            for _ in 0..rng.gen_range(1..12) {
                minute += rng.gen_range(0..90);
                let ts = at(0, 0) + chrono::Duration::minutes(minute.min(1439) as i64);
                // An upstream stage (spoof, liveness, match) may reject first.
                if rng.gen_bool(0.3) {
                    continue;
                }
                if let Ok(r) = resolve("U1", ts, &s, &logs) {
                    logs.push(log("U1", ts, r.event_type));
                }
            }
            assert!(logs.len() <= 2);
            for (i, e) in logs.iter().enumerate() {
                let expected = if i % 2 == 0 { EventType::CheckIn } else { EventType::CheckOut };
                assert_eq!(e.event_type, expected);
            }
            for pair in logs.windows(2) {
                assert!(pair[0].timestamp < pair[1].timestamp);
            }
        }
    }
}

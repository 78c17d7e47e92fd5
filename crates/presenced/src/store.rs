use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use presence_core::{
    AttendanceLogEntry, Embedding, EventType, GalleryEntry, Punctuality, ShiftConfig,
    EMBEDDING_DIM,
};
use rusqlite::TransactionBehavior;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;
const NONCE_LEN: usize = 12;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const DAY_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
    #[error("attendance log for {user} changed since it was read")]
    Conflict { user: String },
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed storage for enrollments, shifts and the attendance log.
///
/// Enrollment embeddings are encrypted with AES-256-GCM. A per-installation
/// 32-byte key is generated at first use and stored at `{db_dir}/.key`
/// (mode 0600). The attendance log is append-only.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let in_memory = db_path == Path::new(":memory:");

        let enc_key = if in_memory {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
            }
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/presence"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS enrollments (
                     id TEXT PRIMARY KEY,
                     user TEXT NOT NULL,
                     label TEXT NOT NULL,
                     embedding BLOB NOT NULL,
                     model_version TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_enrollments_user ON enrollments(user);
                 CREATE TABLE IF NOT EXISTS shifts (
                     user TEXT PRIMARY KEY,
                     start_time TEXT NOT NULL,
                     end_time TEXT NOT NULL,
                     grace_minutes INTEGER NOT NULL,
                     overtime_minutes INTEGER NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS attendance_log (
                     id TEXT PRIMARY KEY,
                     user TEXT NOT NULL,
                     day TEXT NOT NULL,
                     timestamp TEXT NOT NULL,
                     event_type TEXT NOT NULL,
                     match_distance REAL NOT NULL,
                     confidence REAL NOT NULL,
                     device_id TEXT NOT NULL,
                     spoof_score REAL NOT NULL,
                     minutes_late INTEGER NOT NULL DEFAULT 0,
                     minutes_early INTEGER NOT NULL DEFAULT 0,
                     minutes_overtime INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS idx_log_user_day
                     ON attendance_log(user, day, timestamp);",
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %db_path.display(), "attendance store opened");
        Ok(Self { conn, enc_key })
    }

    // ── Enrollments ───────────────────────────────────────────────────────────

    /// Enroll an embedding for a user. Returns the generated UUID.
    pub async fn enroll(
        &self,
        user: &str,
        label: &str,
        embedding: &Embedding,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let model_version = embedding
            .model_version
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let created_at = chrono::Utc::now().to_rfc3339();

        // Encrypt before entering the SQLite closure
        let blob = self.encrypt_embedding(&embedding.values)?;

        let id_clone = id.clone();
        let user = user.to_string();
        let label = label.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO enrollments (id, user, label, embedding, model_version, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![id_clone, user, label, blob, model_version, created_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// Snapshot of every enrolled embedding, ordered by user then enrollment time.
    pub async fn gallery(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows: Vec<(String, Vec<u8>, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT user, embedding, model_version FROM enrollments
                     ORDER BY user, created_at",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut gallery = Vec::with_capacity(rows.len());
        for (user_id, blob, model_version) in rows {
            let values = self.decrypt_embedding(&blob)?;
            gallery.push(GalleryEntry {
                user_id,
                embedding: Embedding {
                    values,
                    model_version: (model_version != "unknown").then_some(model_version),
                },
            });
        }
        Ok(gallery)
    }

    /// List a user's enrollments (metadata only, no embeddings).
    pub async fn list_enrollments(&self, user: &str) -> Result<Vec<EnrollmentInfo>, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, label, model_version, created_at
                     FROM enrollments WHERE user = ?1 ORDER BY created_at",
                )?;
                let rows = stmt.query_map([&user], |row| {
                    Ok(EnrollmentInfo {
                        id: row.get(0)?,
                        label: row.get(1)?,
                        model_version: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove an enrollment by ID, scoped to a user for cross-user protection.
    pub async fn remove_enrollment(&self, user: &str, id: &str) -> Result<bool, StoreError> {
        let user = user.to_string();
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM enrollments WHERE id = ?1 AND user = ?2",
                    [&id, &user],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count enrollments across all users.
    pub async fn count_enrollments(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM enrollments", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Shifts ────────────────────────────────────────────────────────────────

    /// Create or replace a user's shift.
    pub async fn set_shift(&self, user: &str, shift: &ShiftConfig) -> Result<(), StoreError> {
        let user = user.to_string();
        let start = shift.start_time.format(TIME_FORMAT).to_string();
        let end = shift.end_time.format(TIME_FORMAT).to_string();
        let grace = shift.grace_period_minutes;
        let overtime = shift.overtime_threshold_minutes;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO shifts (user, start_time, end_time, grace_minutes, overtime_minutes)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(user) DO UPDATE SET
                         start_time = excluded.start_time,
                         end_time = excluded.end_time,
                         grace_minutes = excluded.grace_minutes,
                         overtime_minutes = excluded.overtime_minutes",
                    rusqlite::params![user, start, end, grace, overtime],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// The user's own shift, if one was set.
    pub async fn shift_for(&self, user: &str) -> Result<Option<ShiftConfig>, StoreError> {
        let user = user.to_string();
        let row: Option<(String, String, u32, u32)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT start_time, end_time, grace_minutes, overtime_minutes
                     FROM shifts WHERE user = ?1",
                )?;
                let mut rows = stmt.query_map([&user], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                Ok(rows.next().transpose()?)
            })
            .await?;

        row.map(|(start, end, grace, overtime)| {
            Ok(ShiftConfig {
                start_time: parse_time_col(&start)?,
                end_time: parse_time_col(&end)?,
                grace_period_minutes: grace,
                overtime_threshold_minutes: overtime,
            })
        })
        .transpose()
    }

    // ── Attendance log ────────────────────────────────────────────────────────

    /// A user's entries for one calendar day, oldest first.
    pub async fn logs_for_day(
        &self,
        user: &str,
        day: NaiveDate,
    ) -> Result<Vec<AttendanceLogEntry>, StoreError> {
        let user = user.to_string();
        let day = day.format(DAY_FORMAT).to_string();
        let rows: Vec<LogRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user, timestamp, event_type, match_distance, confidence,
                            device_id, spoof_score, minutes_late, minutes_early, minutes_overtime
                     FROM attendance_log WHERE user = ?1 AND day = ?2
                     ORDER BY timestamp",
                )?;
                let rows = stmt.query_map([&user, &day], |row| {
                    Ok(LogRow {
                        user: row.get(0)?,
                        timestamp: row.get(1)?,
                        event_type: row.get(2)?,
                        match_distance: row.get(3)?,
                        confidence: row.get(4)?,
                        device_id: row.get(5)?,
                        spoof_score: row.get(6)?,
                        minutes_late: row.get(7)?,
                        minutes_early: row.get(8)?,
                        minutes_overtime: row.get(9)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter().map(LogRow::into_entry).collect()
    }

    /// Append an entry if the day's log still ends at `expected_last`.
    ///
    /// The check and the insert run in one IMMEDIATE transaction, so a
    /// competing writer that appended after the caller read the log causes
    /// [`StoreError::Conflict`] instead of breaking the alternation.
    pub async fn append_entry(
        &self,
        entry: &AttendanceLogEntry,
        expected_last: Option<NaiveDateTime>,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let id_clone = id.clone();
        let user = entry.user_id.clone();
        let day = entry.day().format(DAY_FORMAT).to_string();
        let timestamp = entry.timestamp.format(TIMESTAMP_FORMAT).to_string();
        let expected = expected_last.map(|t| t.format(TIMESTAMP_FORMAT).to_string());
        let event_type = entry.event_type.as_str();
        let entry = entry.clone();
        let user_for_err = user.clone();

        let appended = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let last: Option<String> = tx
                    .prepare(
                        "SELECT timestamp FROM attendance_log
                         WHERE user = ?1 AND day = ?2
                         ORDER BY timestamp DESC LIMIT 1",
                    )?
                    .query_map([&user, &day], |row| row.get(0))?
                    .next()
                    .transpose()?;
                if last != expected {
                    return Ok(false);
                }
                tx.execute(
                    "INSERT INTO attendance_log (id, user, day, timestamp, event_type,
                         match_distance, confidence, device_id, spoof_score,
                         minutes_late, minutes_early, minutes_overtime)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    rusqlite::params![
                        id_clone,
                        user,
                        day,
                        timestamp,
                        event_type,
                        finite_or_zero(entry.match_distance),
                        entry.confidence,
                        entry.device_id,
                        entry.spoof_score,
                        entry.punctuality.minutes_late,
                        entry.punctuality.minutes_early,
                        entry.punctuality.minutes_overtime,
                    ],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !appended {
            return Err(StoreError::Conflict { user: user_for_err });
        }
        Ok(id)
    }

    /// Count attendance entries across all users.
    pub async fn count_entries(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM attendance_log", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_embedding_values(values)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding(&plaintext)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────────

struct LogRow {
    user: String,
    timestamp: String,
    event_type: String,
    match_distance: f32,
    confidence: f32,
    device_id: String,
    spoof_score: f32,
    minutes_late: i64,
    minutes_early: i64,
    minutes_overtime: i64,
}

impl LogRow {
    fn into_entry(self) -> Result<AttendanceLogEntry, StoreError> {
        let timestamp = NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT)
            .map_err(|e| StoreError::CorruptRow {
                table: "attendance_log",
                detail: format!("timestamp {:?}: {e}", self.timestamp),
            })?;
        let event_type = EventType::parse(&self.event_type).ok_or_else(|| StoreError::CorruptRow {
            table: "attendance_log",
            detail: format!("event_type {:?}", self.event_type),
        })?;
        Ok(AttendanceLogEntry {
            user_id: self.user,
            timestamp,
            event_type,
            match_distance: self.match_distance,
            confidence: self.confidence,
            device_id: self.device_id,
            spoof_score: self.spoof_score,
            punctuality: Punctuality {
                minutes_late: self.minutes_late,
                minutes_early: self.minutes_early,
                minutes_overtime: self.minutes_overtime,
            },
        })
    }
}

fn parse_time_col(s: &str) -> Result<NaiveTime, StoreError> {
    NaiveTime::parse_from_str(s, TIME_FORMAT).map_err(|e| StoreError::CorruptRow {
        table: "shifts",
        detail: format!("time {s:?}: {e}"),
    })
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    validate_embedding_values(&values)?;
    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about an enrollment (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnrollmentInfo {
    pub id: String,
    pub label: String,
    pub model_version: String,
    pub created_at: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(seed: f32) -> Embedding {
        Embedding {
            values: (0..EMBEDDING_DIM).map(|i| seed + i as f32 / 1000.0).collect(),
            model_version: Some("facenet-128".to_string()),
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn entry(user: &str, ts: NaiveDateTime, event_type: EventType) -> AttendanceLogEntry {
        AttendanceLogEntry {
            user_id: user.into(),
            timestamp: ts,
            event_type,
            match_distance: 0.12,
            confidence: 0.7,
            device_id: "lobby".into(),
            spoof_score: 77.5,
            punctuality: Punctuality {
                minutes_late: 3,
                ..Punctuality::default()
            },
        }
    }

    async fn memory_store() -> AttendanceStore {
        AttendanceStore::open(Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn test_enroll_and_gallery() {
        let store = memory_store().await;
        let e = embedding(0.1);
        store.enroll("bob", "default", &e).await.unwrap();
        store.enroll("alice", "default", &embedding(0.2)).await.unwrap();

        let gallery = store.gallery().await.unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery[0].user_id, "alice");
        assert_eq!(gallery[1].user_id, "bob");
        for (orig, rec) in e.values.iter().zip(gallery[1].embedding.values.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
        assert_eq!(gallery[1].embedding.model_version.as_deref(), Some("facenet-128"));
        assert_eq!(store.count_enrollments().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_enroll_rejects_wrong_dimension() {
        let store = memory_store().await;
        let err = store
            .enroll("alice", "x", &Embedding::new(vec![0.5; 512]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingDim(512)));
    }

    #[tokio::test]
    async fn test_enroll_rejects_nan() {
        let store = memory_store().await;
        let mut e = embedding(0.0);
        e.values[7] = f32::NAN;
        let err = store.enroll("alice", "x", &e).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbeddingValue));
    }

    #[tokio::test]
    async fn test_remove_is_user_scoped() {
        let store = memory_store().await;
        let id = store.enroll("alice", "default", &embedding(0.3)).await.unwrap();

        assert!(!store.remove_enrollment("bob", &id).await.unwrap());
        assert_eq!(store.list_enrollments("alice").await.unwrap().len(), 1);
        assert!(store.remove_enrollment("alice", &id).await.unwrap());
        assert!(store.list_enrollments("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let store1 = AttendanceStore {
            conn: Connection::open(Path::new(":memory:")).await.unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = AttendanceStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };
        let blob = store1.encrypt_embedding(&embedding(0.4).values).unwrap();
        assert!(matches!(
            store2.decrypt_embedding(&blob),
            Err(StoreError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn test_shift_upsert() {
        let store = memory_store().await;
        assert!(store.shift_for("alice").await.unwrap().is_none());

        let mut shift = ShiftConfig::default();
        store.set_shift("alice", &shift).await.unwrap();
        shift.start_time = NaiveTime::from_hms_opt(7, 30, 0).unwrap();
        shift.grace_period_minutes = 0;
        store.set_shift("alice", &shift).await.unwrap();

        assert_eq!(store.shift_for("alice").await.unwrap(), Some(shift));
    }

    #[tokio::test]
    async fn test_log_append_and_read_back() {
        let store = memory_store().await;
        let first = entry("alice", at(9, 3), EventType::CheckIn);
        store.append_entry(&first, None).await.unwrap();
        store
            .append_entry(&entry("bob", at(9, 4), EventType::CheckIn), None)
            .await
            .unwrap();

        let logs = store.logs_for_day("alice", at(0, 0).date()).await.unwrap();
        assert_eq!(logs, vec![first]);
        assert_eq!(store.count_entries().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_append_detects_conflict() {
        let store = memory_store().await;
        let check_in = entry("alice", at(9, 0), EventType::CheckIn);
        store.append_entry(&check_in, None).await.unwrap();

        // A second writer that read the empty log must not append.
        let err = store
            .append_entry(&entry("alice", at(9, 1), EventType::CheckIn), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        store
            .append_entry(&entry("alice", at(17, 0), EventType::CheckOut), Some(at(9, 0)))
            .await
            .unwrap();
        let logs = store.logs_for_day("alice", at(0, 0).date()).await.unwrap();
        assert_eq!(
            logs.iter().map(|e| e.event_type).collect::<Vec<_>>(),
            vec![EventType::CheckIn, EventType::CheckOut]
        );
    }

    #[test]
    fn test_embedding_byte_fidelity() {
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[0] = -0.0;
        values[1] = f32::MIN_POSITIVE;
        values[2] = std::f32::consts::PI;
        let recovered = bytes_to_embedding(&embedding_to_bytes(&values)).unwrap();
        for (orig, rec) in values.iter().zip(recovered.iter()) {
            assert_eq!(orig.to_bits(), rec.to_bits());
        }
    }

    #[test]
    fn test_bytes_wrong_length() {
        assert!(matches!(
            bytes_to_embedding(&[0u8; 100]),
            Err(StoreError::InvalidBlob(100))
        ));
    }
}

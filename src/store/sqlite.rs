//! SQLite-backed record store and token table.

use crate::auth::{generate_token, AuthError, Authenticator, TokenGrant};
use crate::core::{AsdFlag, GazeClass, ScreeningRecord, UserId};
use crate::store::{RecordStore, StoreError};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const CURRENT_SCHEMA_VERSION: i32 = 2;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS screening_records (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id          TEXT NOT NULL,
    timestamp        TEXT NOT NULL,
    stimulus         TEXT NOT NULL,
    gaze_direction   TEXT NOT NULL,
    left_pupil_size  REAL NOT NULL,
    right_pupil_size REAL NOT NULL,
    asd_flag         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_screening_records_user
    ON screening_records (user_id, timestamp DESC);
";

const SCHEMA_V2: &str = "
CREATE TABLE IF NOT EXISTS auth_tokens (
    token      TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    issued_at  TEXT NOT NULL,
    expires_at TEXT
);
";

/// Record store and token table in a single SQLite file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring the schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(path)?;
        if let Err(e) =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        {
            tracing::warn!("Failed to enable WAL mode: {}", e);
        }
        run_migrations(&mut conn)?;

        tracing::info!("Record store opened at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Issue a bearer token for `user_id`, optionally expiring after `ttl`.
    pub fn issue_token(
        &self,
        user_id: &UserId,
        ttl: Option<Duration>,
    ) -> Result<String, StoreError> {
        let token = generate_token();
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| format_timestamp(now + ttl));

        self.lock()?.execute(
            "INSERT INTO auth_tokens (token, user_id, issued_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![token, user_id.as_str(), format_timestamp(now), expires_at],
        )?;

        Ok(token)
    }

    /// Remove a token. Returns whether it existed.
    pub fn revoke_token(&self, token: &str) -> Result<bool, StoreError> {
        let removed = self
            .lock()?
            .execute("DELETE FROM auth_tokens WHERE token = ?1", params![token])?;
        Ok(removed > 0)
    }

    fn lookup_token(&self, token: &str) -> Result<Option<TokenGrant>, StoreError> {
        let row: Option<(String, Option<String>)> = self
            .lock()?
            .query_row(
                "SELECT user_id, expires_at FROM auth_tokens WHERE token = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(user_id, expires_at)| -> Result<TokenGrant, StoreError> {
            Ok(TokenGrant {
                user_id: UserId(user_id),
                expires_at: expires_at
                    .map(|raw| parse_timestamp(&raw, "auth_tokens"))
                    .transpose()?,
            })
        })
        .transpose()
    }
}

impl RecordStore for SqliteStore {
    fn append(&self, record: &ScreeningRecord) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO screening_records
                (user_id, timestamp, stimulus, gaze_direction, left_pupil_size, right_pupil_size, asd_flag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.user_id.as_str(),
                format_timestamp(record.timestamp),
                record.stimulus,
                record.gaze_direction.as_str(),
                record.left_pupil_size,
                record.right_pupil_size,
                record.asd_flag.as_str(),
            ],
        )?;
        Ok(())
    }

    fn list_by_user(&self, user_id: &UserId) -> Result<Vec<ScreeningRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, timestamp, stimulus, gaze_direction, left_pupil_size, right_pupil_size, asd_flag
             FROM screening_records
             WHERE user_id = ?1
             ORDER BY timestamp DESC, id DESC",
        )?;

        let rows = stmt.query_map(params![user_id.as_str()], RawRecord::from_row)?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }
}

impl Authenticator for SqliteStore {
    fn validate(&self, token: &str) -> Result<UserId, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Missing);
        }
        self.lookup_token(token)
            .map_err(|e| AuthError::Backend(e.to_string()))?
            .ok_or(AuthError::Invalid)?
            .check(Utc::now())
    }
}

/// Row as stored, before label parsing.
struct RawRecord {
    user_id: String,
    timestamp: String,
    stimulus: String,
    gaze_direction: String,
    left_pupil_size: f64,
    right_pupil_size: f64,
    asd_flag: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            timestamp: row.get(1)?,
            stimulus: row.get(2)?,
            gaze_direction: row.get(3)?,
            left_pupil_size: row.get(4)?,
            right_pupil_size: row.get(5)?,
            asd_flag: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<ScreeningRecord, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            table: "screening_records",
            message,
        };

        Ok(ScreeningRecord {
            user_id: UserId(self.user_id),
            timestamp: parse_timestamp(&self.timestamp, "screening_records")?,
            stimulus: self.stimulus,
            gaze_direction: GazeClass::parse(&self.gaze_direction)
                .ok_or_else(|| corrupt(format!("unknown gaze '{}'", self.gaze_direction)))?,
            left_pupil_size: self.left_pupil_size,
            right_pupil_size: self.right_pupil_size,
            asd_flag: AsdFlag::parse(&self.asd_flag)
                .ok_or_else(|| corrupt(format!("unknown asd flag '{}'", self.asd_flag)))?,
        })
    }
}

/// Fixed-width UTC form so lexical order matches chronological order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str, table: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            message: format!("invalid timestamp '{raw}': {e}"),
        })
}

fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        version += 1;
        apply_migration(&tx, version)?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), StoreError> {
    match version {
        1 => tx.execute_batch(SCHEMA_V1)?,
        2 => tx.execute_batch(SCHEMA_V2)?,
        _ => {}
    }
    Ok(())
}

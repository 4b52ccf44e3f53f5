//! SQLite-backed attendance ledger.
//!
//! Durable store of enrolled identities and of per-day presence events.
//! Thread-safe via an internal `Mutex<Connection>`; every mutation runs in
//! a transaction under that lock, so the presence check and insert are a
//! single atomic step. The `UNIQUE (identity_id, date)` constraint backs
//! the same rule at the storage level.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rollcall_core::{Embedding, Identity};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;

use crate::schema::{apply_schema, read_schema_version};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// How long a writer waits for another connection to release the database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("database corrupt: {0}")]
    Corrupt(String),
    #[error("ledger lock poisoned")]
    LockPoisoned,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Presence status of an attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "Present",
        }
    }
}

impl std::str::FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Present" => Ok(Self::Present),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// One durable presence record.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceEvent {
    pub id: i64,
    pub identity_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub recorded_at: String,
}

/// Result of [`Ledger::record_presence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceOutcome {
    /// `false` when the identity was already present on that date.
    pub recorded: bool,
    pub display_name: String,
}

pub struct Ledger {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        apply_schema(&conn)?;

        let ledger = Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        };

        if let Err(e) = ledger.integrity_check() {
            tracing::warn!(error = %e, "ledger integrity check failed on open");
        }
        tracing::debug!(path = %path.display(), "ledger opened");

        Ok(ledger)
    }

    /// Open a private in-memory ledger.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    /// Transactions that read before writing take the write lock up front,
    /// so a second connection makes them wait instead of failing the upgrade.
    fn write_tx(conn: &mut Connection) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
    }

    /// Run `PRAGMA quick_check`.
    pub fn integrity_check(&self) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result == "ok" {
            Ok(())
        } else {
            Err(LedgerError::Corrupt(result))
        }
    }

    pub fn schema_version(&self) -> Result<u32, LedgerError> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    /// Persist a new identity. Fails with `DuplicateIdentity` if the id exists.
    pub fn enroll(&self, identity: &Identity) -> Result<(), LedgerError> {
        let metadata = serde_json::to_string(&identity.metadata)?;
        let embedding = serde_json::to_string(&identity.embedding)?;
        let reference_image = identity.reference_image.to_string_lossy().into_owned();

        let mut conn = self.lock()?;
        let tx = Self::write_tx(&mut conn)?;

        if display_name(&tx, &identity.id)?.is_some() {
            return Err(LedgerError::DuplicateIdentity(identity.id.clone()));
        }

        tx.execute(
            "INSERT INTO identities (id, display_name, metadata, reference_image, embedding, enrolled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity.id,
                identity.display_name,
                metadata,
                reference_image,
                embedding,
                identity.enrolled_at,
            ],
        )?;
        tx.commit()?;

        tracing::debug!(id = %identity.id, "identity enrolled");
        Ok(())
    }

    /// Overwrite an existing identity's fields and embedding.
    pub fn reenroll(&self, identity: &Identity) -> Result<(), LedgerError> {
        let metadata = serde_json::to_string(&identity.metadata)?;
        let embedding = serde_json::to_string(&identity.embedding)?;
        let reference_image = identity.reference_image.to_string_lossy().into_owned();

        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE identities
             SET display_name = ?2, metadata = ?3, reference_image = ?4, embedding = ?5, enrolled_at = ?6
             WHERE id = ?1",
            params![
                identity.id,
                identity.display_name,
                metadata,
                reference_image,
                embedding,
                identity.enrolled_at,
            ],
        )?;
        if updated == 0 {
            return Err(LedgerError::UnknownIdentity(identity.id.clone()));
        }

        tracing::debug!(id = %identity.id, "identity re-enrolled");
        Ok(())
    }

    /// Replace only the stored embedding, e.g. after a model upgrade.
    pub fn update_embedding(&self, identity_id: &str, embedding: &Embedding) -> Result<(), LedgerError> {
        let embedding = serde_json::to_string(embedding)?;
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE identities SET embedding = ?2 WHERE id = ?1",
            params![identity_id, embedding],
        )?;
        if updated == 0 {
            return Err(LedgerError::UnknownIdentity(identity_id.to_string()));
        }
        Ok(())
    }

    pub fn contains(&self, identity_id: &str) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        Ok(display_name(&conn, identity_id)?.is_some())
    }

    pub fn identity(&self, identity_id: &str) -> Result<Option<Identity>, LedgerError> {
        let conn = self.lock()?;
        let identity = conn
            .query_row(
                "SELECT id, display_name, metadata, reference_image, embedding, enrolled_at
                 FROM identities WHERE id = ?1",
                params![identity_id],
                row_to_identity,
            )
            .optional()?;
        Ok(identity)
    }

    /// All identities in enrollment order.
    pub fn list_identities(&self) -> Result<Vec<Identity>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name, metadata, reference_image, embedding, enrolled_at
             FROM identities ORDER BY seq",
        )?;
        let rows = stmt.query_map([], row_to_identity)?;
        let identities = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(identities)
    }

    /// Record that `identity_id` was present on `date`, at most once per day.
    pub fn record_presence(
        &self,
        identity_id: &str,
        date: NaiveDate,
    ) -> Result<PresenceOutcome, LedgerError> {
        let recorded_at = Utc::now().to_rfc3339();
        let date = date.format(DATE_FORMAT).to_string();

        let mut conn = self.lock()?;
        let tx = Self::write_tx(&mut conn)?;

        let Some(display_name) = display_name(&tx, identity_id)? else {
            return Err(LedgerError::UnknownIdentity(identity_id.to_string()));
        };

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO attendance (identity_id, date, status, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                identity_id,
                date,
                AttendanceStatus::Present.as_str(),
                recorded_at
            ],
        )?;
        tx.commit()?;

        let recorded = inserted == 1;
        if recorded {
            tracing::info!(id = identity_id, %date, "presence recorded");
        } else {
            tracing::debug!(id = identity_id, %date, "presence already recorded");
        }
        Ok(PresenceOutcome {
            recorded,
            display_name,
        })
    }

    /// Presence events for one date, in recording order.
    pub fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, date, status, recorded_at
             FROM attendance WHERE date = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], row_to_event)?;
        let events = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Presence history of one identity, oldest first.
    pub fn attendance_for(&self, identity_id: &str) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, date, status, recorded_at
             FROM attendance WHERE identity_id = ?1 ORDER BY date, id",
        )?;
        let rows = stmt.query_map(params![identity_id], row_to_event)?;
        let events = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

fn display_name(conn: &Connection, identity_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT display_name FROM identities WHERE id = ?1",
        params![identity_id],
        |row| row.get(0),
    )
    .optional()
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<Identity> {
    let metadata: String = row.get(2)?;
    let metadata: BTreeMap<String, String> =
        serde_json::from_str(&metadata).map_err(|e| conversion_error(2, e))?;
    let reference_image: String = row.get(3)?;
    let embedding: String = row.get(4)?;
    let embedding: Embedding =
        serde_json::from_str(&embedding).map_err(|e| conversion_error(4, e))?;

    Ok(Identity {
        id: row.get(0)?,
        display_name: row.get(1)?,
        metadata,
        reference_image: PathBuf::from(reference_image),
        embedding,
        enrolled_at: row.get(5)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<AttendanceEvent> {
    let date: String = row.get(2)?;
    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| conversion_error(2, e))?;
    let status: String = row.get(3)?;
    let status = status
        .parse::<AttendanceStatus>()
        .map_err(|e| conversion_error(3, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    Ok(AttendanceEvent {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        date,
        status,
        recorded_at: row.get(4)?,
    })
}

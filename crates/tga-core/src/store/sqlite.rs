//! `SQLite`-backed state store.
//!
//! A single database file in WAL mode holds the execution log and session
//! bindings. The connection is wrapped in a mutex, which is the durable
//! single-writer discipline: appends serialize on the mutex and run inside
//! one transaction that re-checks the tail before inserting.
//!
//! File permissions are forced to 0600 on open; a process that cannot
//! restrict the file fails startup.

// SQLite returns i64 for sequence numbers and timestamps; both are
// non-negative in this schema. Mutex poisoning indicates a panic in another
// thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc
)]

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use tracing::debug;

use super::{SessionBinding, StateStore, StoreError, SCHEMA_VERSION};
use crate::chain::{Hash, GENESIS_HASH, HASH_SIZE};
use crate::record::{ExecutionRecord, ExecutionState};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// The append-only execution log backed by `SQLite`.
#[derive(Debug)]
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Opens or creates a store at the given path.
    ///
    /// The schema is applied on first open and the file mode is forced to
    /// 0600.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, the permissions
    /// cannot be restricted, or the store carries a newer schema version
    /// than this build supports.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        enforce_owner_only(path)?;
        Self::initialize_connection(&conn)?;

        debug!(path = %path.display(), "state store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Applies the schema and checks the schema-version row.
    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        // Schema includes the PRAGMA statements (WAL, synchronous=FULL)
        conn.execute_batch(SCHEMA_SQL)?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match version {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            },
            Some(found) if found > SCHEMA_VERSION => {
                return Err(StoreError::UnsupportedSchemaVersion {
                    found,
                    supported: SCHEMA_VERSION,
                });
            },
            Some(_) => {},
        }

        Ok(())
    }

    /// Reads the tail `(sequence, record_hash)` inside a transaction.
    fn tail_link(tx: &Transaction<'_>) -> Result<Option<(u64, Hash)>, StoreError> {
        let row: Option<(i64, Vec<u8>)> = tx
            .query_row(
                "SELECT sequence, record_hash FROM execution_states
                 ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(sequence, hash)| {
            let sequence = sequence as u64;
            Ok((sequence, blob_to_hash(sequence, "record_hash", &hash)?))
        })
        .transpose()
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            sequence: row.get::<_, i64>(0)? as u64,
            trace_id: row.get(1)?,
            state: row.get(2)?,
            capability_hash: row.get(3)?,
            input_hash: row.get(4)?,
            output_hash: row.get(5)?,
            prev_hash: row.get(6)?,
            record_hash: row.get(7)?,
            created_at: row.get::<_, i64>(8)? as u64,
            reason: row.get(9)?,
        })
    }
}

/// A row as read from `SQLite`, before blob and state validation.
struct RawRecord {
    sequence: u64,
    trace_id: String,
    state: String,
    capability_hash: Vec<u8>,
    input_hash: Option<Vec<u8>>,
    output_hash: Option<Vec<u8>>,
    prev_hash: Vec<u8>,
    record_hash: Vec<u8>,
    created_at: u64,
    reason: Option<String>,
}

impl RawRecord {
    fn decode(self) -> Result<ExecutionRecord, StoreError> {
        let sequence = self.sequence;
        let state =
            ExecutionState::parse(&self.state).map_err(|e| StoreError::CorruptRow {
                sequence,
                detail: e.to_string(),
            })?;

        Ok(ExecutionRecord {
            sequence,
            trace_id: self.trace_id,
            state,
            capability_hash: blob_to_hash(sequence, "capability_hash", &self.capability_hash)?,
            input_hash: self
                .input_hash
                .map(|h| blob_to_hash(sequence, "input_hash", &h))
                .transpose()?,
            output_hash: self
                .output_hash
                .map(|h| blob_to_hash(sequence, "output_hash", &h))
                .transpose()?,
            prev_hash: blob_to_hash(sequence, "prev_hash", &self.prev_hash)?,
            record_hash: blob_to_hash(sequence, "record_hash", &self.record_hash)?,
            created_at_ns: self.created_at,
            reason: self.reason,
        })
    }
}

fn blob_to_hash(sequence: u64, field: &str, blob: &[u8]) -> Result<Hash, StoreError> {
    Hash::try_from(blob).map_err(|_| StoreError::CorruptRow {
        sequence,
        detail: format!("{field} is {} bytes, expected {HASH_SIZE}", blob.len()),
    })
}

const SELECT_RECORD: &str = "SELECT sequence, trace_id, state, capability_hash, input_hash, \
                             output_hash, prev_hash, record_hash, created_at, reason \
                             FROM execution_states";

impl StateStore for SqliteStateStore {
    fn append(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let tail = Self::tail_link(&tx)?;
        let expected = tail.map_or(1, |(sequence, _)| sequence + 1);
        if record.sequence != expected {
            return Err(StoreError::SequenceConflict {
                expected,
                actual: record.sequence,
            });
        }

        let expected_prev = tail.map_or(GENESIS_HASH, |(_, hash)| hash);
        if record.prev_hash != expected_prev {
            return Err(StoreError::HashLinkMismatch {
                sequence: record.sequence,
            });
        }

        tx.execute(
            "INSERT INTO execution_states (sequence, trace_id, state, capability_hash, \
             input_hash, output_hash, prev_hash, record_hash, created_at, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.sequence as i64,
                record.trace_id,
                record.state.as_str(),
                record.capability_hash.as_slice(),
                record.input_hash.as_ref().map(<[u8; HASH_SIZE]>::as_slice),
                record.output_hash.as_ref().map(<[u8; HASH_SIZE]>::as_slice),
                record.prev_hash.as_slice(),
                record.record_hash.as_slice(),
                record.created_at_ns as i64,
                record.reason,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{SELECT_RECORD} ORDER BY sequence ASC"))?;

        let raw_rows = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        raw_rows.into_iter().map(RawRecord::decode).collect()
    }

    fn tail(&self) -> Result<Option<ExecutionRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("{SELECT_RECORD} ORDER BY sequence DESC LIMIT 1"))?;

        let raw = stmt.query_row([], Self::row_to_record).optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    fn traces_in_state(&self, state: ExecutionState) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT trace_id FROM execution_states e
             WHERE sequence = (SELECT MAX(sequence) FROM execution_states
                               WHERE trace_id = e.trace_id)
               AND state = ?1
             ORDER BY sequence ASC",
        )?;

        let traces = stmt
            .query_map(params![state.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(traces)
    }

    fn put_session(&self, binding: &SessionBinding) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (session_id, capability_hash, expires_at, trace_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                binding.session_id,
                binding.capability_hash.as_slice(),
                binding.expires_at as i64,
                binding.trace_id,
                binding.created_at_ns as i64,
            ],
        )?;
        Ok(())
    }

    fn session_for_capability(
        &self,
        capability_hash: &Hash,
    ) -> Result<Option<SessionBinding>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, capability_hash, expires_at, trace_id, created_at
             FROM sessions
             WHERE capability_hash = ?1
             ORDER BY created_at DESC LIMIT 1",
        )?;

        let row: Option<(String, Vec<u8>, i64, String, i64)> = stmt
            .query_row(params![capability_hash.as_slice()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .optional()?;

        row.map(|(session_id, hash, expires_at, trace_id, created_at)| {
            Ok(SessionBinding {
                session_id,
                capability_hash: blob_to_hash(0, "capability_hash", &hash)?,
                expires_at: expires_at as u64,
                trace_id,
                created_at_ns: created_at as u64,
            })
        })
        .transpose()
    }

    fn capability_authorized(&self, capability_hash: &Hash) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM execution_states
                 WHERE capability_hash = ?1 AND state = 'AUTHORIZED'
                 LIMIT 1",
                params![capability_hash.as_slice()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(found.is_some())
    }
}

/// Restricts the store file to owner read/write.
#[cfg(unix)]
fn enforce_owner_only(path: &Path) -> Result<(), StoreError> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|_| {
        StoreError::InsecurePermissions {
            path: path.display().to_string(),
        }
    })?;

    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(StoreError::InsecurePermissions {
            path: path.display().to_string(),
        });
    }

    Ok(())
}

#[cfg(not(unix))]
fn enforce_owner_only(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

//! Database module for SI record storage.
//!
//! This module provides a transactional key/value store on top of SQLite:
//! - one table per record type, keyed by an order-preserving binary key
//! - exact lookups, "find >=" and prefix range scans
//! - an optional secondary index per table
//! - write transactions with nested child transactions (savepoints)
//!
//! Domain helpers (muxes, services, bouquets, EPG, spectra) are extension
//! traits over [`KvRead`] and [`KvWrite`]; import them with
//! `use crate::database::prelude::*`.

mod mux;
mod records;
mod schema;
mod service;

pub use mux::{MuxRead, MuxWrite, UpdateMuxResult};
pub use records::{mux_network_index, service_network_index, KeyWriter, Record};
pub use service::{ServiceRead, ServiceWrite};

use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use neumo_protocol::RecordError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Savepoint, Transaction, TransactionBehavior};
use thiserror::Error;

/// Everything needed to use the database from other modules.
pub mod prelude {
    pub use super::{KvRead, KvWrite, MuxRead, MuxWrite, ServiceRead, ServiceWrite};
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] RecordError),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Shared handle used by tuner threads and the receiver.
pub type DatabaseHandle = Arc<Mutex<Database>>;

/// Main database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;

        let db = Self { conn };
        db.initialize_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let db = Self { conn };
        db.initialize_schema()?;

        Ok(db)
    }

    /// Wrap into a handle that can be shared between threads.
    pub fn into_handle(self) -> DatabaseHandle {
        Arc::new(Mutex::new(self))
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA_SQL)?;
        self.apply_migrations()?;
        Ok(())
    }

    fn user_version(&self) -> Result<i32> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Add a column to a table if it doesn't exist.
    fn add_column_if_not_exists(&self, table: &str, column: &str, column_type: &str) -> Result<()> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let column_exists = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .any(|name| name == column);

        if !column_exists {
            let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type);
            self.conn.execute(&sql, [])?;
            info!("Migration: Added column {} to table {}", column, table);
        }

        Ok(())
    }

    fn apply_migrations(&self) -> Result<()> {
        let version = self.user_version()?;
        if version > schema::SCHEMA_VERSION {
            return Err(DatabaseError::MigrationFailed(format!(
                "database schema version {} is newer than supported version {}",
                version,
                schema::SCHEMA_VERSION
            )));
        }

        // Migration 002: secondary index column on every record table
        if version < 2 {
            for table in schema::RECORD_TABLES {
                self.add_column_if_not_exists(table, "idx", "BLOB")?;
            }
        }

        if version != schema::SCHEMA_VERSION {
            self.conn
                .execute_batch(&format!("PRAGMA user_version = {}", schema::SCHEMA_VERSION))?;
            debug!("Database schema at version {}", schema::SCHEMA_VERSION);
        }
        Ok(())
    }

    /// Start a write transaction. Only one can be open at a time.
    pub fn write_txn(&mut self) -> Result<WriteTxn<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(WriteTxn { tx })
    }

    /// Start a read transaction, giving a consistent view until dropped.
    pub fn read_txn(&mut self) -> Result<ReadTxn<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        Ok(ReadTxn { tx })
    }

    /// Make every write fail with `SQLITE_READONLY`.
    #[cfg(test)]
    pub(crate) fn set_query_only(&self, on: bool) -> Result<()> {
        self.conn.pragma_update(None, "query_only", on)?;
        Ok(())
    }

    /// Allocate a fresh scan id.
    pub fn new_scan_id(&mut self) -> Result<i32> {
        self.conn
            .execute("INSERT INTO scan_ids DEFAULT VALUES", [])?;
        Ok(self.conn.last_insert_rowid() as i32)
    }
}

/// Read half of the key/value interface.
pub trait KvRead {
    fn conn(&self) -> &Connection;

    /// Exact lookup by primary key.
    fn get<R: Record>(&self, key: &R::Key) -> Result<Option<R>> {
        let sql = format!("SELECT data FROM {} WHERE key = ?1", R::TABLE);
        let data: Option<String> = self
            .conn()
            .query_row(&sql, params![R::encode_key(key)], |row| row.get(0))
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(DatabaseError::from))
            .transpose()
    }

    /// First record whose key is greater than or equal to `start`.
    fn find_geq<R: Record>(&self, start: &[u8]) -> Result<Option<R>> {
        let sql = format!(
            "SELECT data FROM {} WHERE key >= ?1 ORDER BY key LIMIT 1",
            R::TABLE
        );
        let data: Option<String> = self
            .conn()
            .query_row(&sql, params![start], |row| row.get(0))
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(DatabaseError::from))
            .transpose()
    }

    /// All records whose key starts with `prefix`, in key order.
    fn range_prefix<R: Record>(&self, prefix: &[u8]) -> Result<Vec<R>> {
        let sql = format!("SELECT key, data FROM {} WHERE key >= ?1 ORDER BY key", R::TABLE);
        let mut stmt = self.conn().prepare(&sql)?;
        let mut rows = stmt.query(params![prefix])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            if !key.starts_with(prefix) {
                break;
            }
            let data: String = row.get(1)?;
            out.push(serde_json::from_str(&data)?);
        }
        Ok(out)
    }

    /// All records whose secondary index starts with `prefix`, in index order.
    fn find_by_index<R: Record>(&self, prefix: &[u8]) -> Result<Vec<R>> {
        let sql = format!(
            "SELECT idx, data FROM {} WHERE idx >= ?1 ORDER BY idx, key",
            R::TABLE
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let mut rows = stmt.query(params![prefix])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let idx: Option<Vec<u8>> = row.get(0)?;
            match idx {
                Some(idx) if idx.starts_with(prefix) => {
                    let data: String = row.get(1)?;
                    out.push(serde_json::from_str(&data)?);
                }
                _ => break,
            }
        }
        Ok(out)
    }

    /// Every record of a table.
    fn all<R: Record>(&self) -> Result<Vec<R>> {
        self.range_prefix(&[])
    }
}

/// Write half of the key/value interface.
pub trait KvWrite: KvRead {
    fn put<R: Record>(&self, record: &R) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (key, idx, data) VALUES (?1, ?2, ?3)",
            R::TABLE
        );
        let data = serde_json::to_string(record)?;
        self.conn().execute(
            &sql,
            params![R::encode_key(&record.key()), record.secondary_key(), data],
        )?;
        Ok(())
    }

    /// Delete by primary key. Returns true if a record was removed.
    fn delete<R: Record>(&self, key: &R::Key) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE key = ?1", R::TABLE);
        let n = self.conn().execute(&sql, params![R::encode_key(key)])?;
        Ok(n > 0)
    }
}

/// A write transaction. Dropping it without [`WriteTxn::commit`] rolls back.
pub struct WriteTxn<'a> {
    tx: Transaction<'a>,
}

impl<'a> WriteTxn<'a> {
    /// Nested transaction which can be aborted without affecting the parent.
    pub fn child(&mut self) -> Result<ChildTxn<'_>> {
        Ok(ChildTxn {
            sp: self.tx.savepoint()?,
        })
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn abort(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

impl KvRead for WriteTxn<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }
}

impl KvWrite for WriteTxn<'_> {}

/// Child of a [`WriteTxn`], backed by a savepoint.
pub struct ChildTxn<'a> {
    sp: Savepoint<'a>,
}

impl ChildTxn<'_> {
    pub fn commit(self) -> Result<()> {
        self.sp.commit()?;
        Ok(())
    }

    pub fn abort(mut self) -> Result<()> {
        self.sp.rollback()?;
        Ok(())
    }
}

impl KvRead for ChildTxn<'_> {
    fn conn(&self) -> &Connection {
        &self.sp
    }
}

impl KvWrite for ChildTxn<'_> {}

/// A read-only transaction.
pub struct ReadTxn<'a> {
    tx: Transaction<'a>,
}

impl KvRead for ReadTxn<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }
}

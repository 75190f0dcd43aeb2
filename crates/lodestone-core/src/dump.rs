//! SQLite connection wrapper for converted dump databases.
//!
//! The converter writes through [`DumpConnection`] into a scratch file; the
//! query layer reads through the same wrapper after the file has been moved
//! to its content-addressed location. Document payloads are stored as
//! gzip-compressed JSON blobs and decoded on read.

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use thiserror::Error;

use crate::model::{DocumentData, DumpLocation, Moniker};
use crate::schema::{
    DUMP_SCHEMA_VERSION, SCHEMA_CREATE_DEFS, SCHEMA_CREATE_DOCUMENTS, SCHEMA_CREATE_INDEXES,
    SCHEMA_CREATE_META, SCHEMA_CREATE_REFS,
};

/// Errors that can occur reading or writing a dump database.
#[derive(Debug, Error)]
pub enum DumpDbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: String, found: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connection to one dump database.
#[derive(Debug)]
pub struct DumpConnection {
    conn: Connection,
}

impl DumpConnection {
    /// Open an existing dump database and verify its schema version.
    pub fn open(path: &Path) -> Result<Self, DumpDbError> {
        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;

        let dc = Self { conn };
        if let Some(version) = dc.get_meta("schema_version")? {
            if version != DUMP_SCHEMA_VERSION {
                return Err(DumpDbError::SchemaVersionMismatch {
                    expected: DUMP_SCHEMA_VERSION.to_string(),
                    found: version,
                });
            }
        }
        Ok(dc)
    }

    /// Create a new dump database with schema.
    pub fn create(path: &Path) -> Result<Self, DumpDbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;

        conn.execute(SCHEMA_CREATE_META, [])?;
        conn.execute(SCHEMA_CREATE_DOCUMENTS, [])?;
        conn.execute(SCHEMA_CREATE_DEFS, [])?;
        conn.execute(SCHEMA_CREATE_REFS, [])?;
        conn.execute_batch(SCHEMA_CREATE_INDEXES)?;

        let dc = Self { conn };
        dc.set_meta("schema_version", DUMP_SCHEMA_VERSION)?;
        Ok(dc)
    }

    /// Configure connection pragmas.
    fn configure_connection(conn: &Connection) -> SqliteResult<()> {
        // WAL for concurrent readers while a conversion writes elsewhere
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, DumpDbError> {
        let result = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(result)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), DumpDbError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Insert a document's payload, replacing any previous row for the path.
    pub fn insert_document(&self, path: &str, data: &DocumentData) -> Result<(), DumpDbError> {
        let blob = encode_document(data)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO documents (path, data) VALUES (?1, ?2)",
            params![path, blob],
        )?;
        Ok(())
    }

    /// Load and decode a document payload. Returns the decoded data together
    /// with the stored blob size, which callers use as the cache cost.
    pub fn get_document(&self, path: &str) -> Result<Option<(DocumentData, u64)>, DumpDbError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT data FROM documents WHERE path = ?1", [path], |row| row.get(0))
            .optional()?;

        match blob {
            Some(blob) => {
                let size = blob.len() as u64;
                Ok(Some((decode_document(&blob)?, size)))
            }
            None => Ok(None),
        }
    }

    /// Whether a document exists at the given path.
    pub fn document_exists(&self, path: &str) -> Result<bool, DumpDbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE path = ?1",
            [path],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn document_count(&self) -> Result<i64, DumpDbError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Insert a moniker-addressed definition location.
    pub fn insert_def(&self, moniker: &Moniker, loc: &DumpLocation) -> Result<(), DumpDbError> {
        self.insert_moniker_location("defs", moniker, loc)
    }

    /// Insert a moniker-addressed reference location.
    pub fn insert_ref(&self, moniker: &Moniker, loc: &DumpLocation) -> Result<(), DumpDbError> {
        self.insert_moniker_location("refs", moniker, loc)
    }

    fn insert_moniker_location(
        &self,
        table: &str,
        moniker: &Moniker,
        loc: &DumpLocation,
    ) -> Result<(), DumpDbError> {
        let sql = format!(
            "INSERT INTO {table} (scheme, identifier, path, start_line, start_character, end_line, end_character) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        );
        self.conn.execute(
            &sql,
            params![
                moniker.scheme,
                moniker.identifier,
                loc.path,
                loc.range.start_line as i64,
                loc.range.start_character as i64,
                loc.range.end_line as i64,
                loc.range.end_character as i64,
            ],
        )?;
        Ok(())
    }

    /// Look up definition locations by moniker.
    pub fn moniker_defs(
        &self,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<DumpLocation>, DumpDbError> {
        self.moniker_locations("defs", scheme, identifier)
    }

    /// Look up reference locations by moniker.
    pub fn moniker_refs(
        &self,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<DumpLocation>, DumpDbError> {
        self.moniker_locations("refs", scheme, identifier)
    }

    fn moniker_locations(
        &self,
        table: &str,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<DumpLocation>, DumpDbError> {
        let sql = format!(
            "SELECT path, start_line, start_character, end_line, end_character \
             FROM {table} WHERE scheme = ?1 AND identifier = ?2 ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![scheme, identifier], |row| {
            Ok(DumpLocation {
                path: row.get(0)?,
                range: crate::model::Range {
                    start_line: row.get::<_, i64>(1)? as u32,
                    start_character: row.get::<_, i64>(2)? as u32,
                    end_line: row.get::<_, i64>(3)? as u32,
                    end_character: row.get::<_, i64>(4)? as u32,
                },
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

/// Gzip-compress a document payload for storage.
fn encode_document(data: &DocumentData) -> Result<Vec<u8>, DumpDbError> {
    let json = serde_json::to_vec(data)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decompress and decode a stored document payload.
fn decode_document(blob: &[u8]) -> Result<DocumentData, DumpDbError> {
    let mut decoder = GzDecoder::new(blob);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

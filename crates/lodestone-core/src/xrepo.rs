//! Cross-repository package index and dump registry.
//!
//! A single SQLite database (`xrepo.db`) records every dump, the packages
//! each dump exports, the package references each dump imports, and the
//! per-repository commit graph edges used for nearest-dump resolution.
//!
//! All writes for one (repository, commit, root) happen in a single
//! transaction: a crash mid-write leaves no partially visible dump, and
//! re-ingesting an identical key replaces the previous rows instead of
//! duplicating them.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::model::{CommitEdge, Dump, DumpState, PackageInformation, PackageReference};

const SCHEMA_CREATE_DUMPS: &str = r#"
CREATE TABLE IF NOT EXISTS dumps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    root TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(repository, commit_hash, root)
)
"#;

const SCHEMA_CREATE_PACKAGES: &str = r#"
CREATE TABLE IF NOT EXISTS packages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dump_id INTEGER NOT NULL REFERENCES dumps(id) ON DELETE CASCADE,
    scheme TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL
)
"#;

const SCHEMA_CREATE_PACKAGE_REFS: &str = r#"
CREATE TABLE IF NOT EXISTS package_refs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dump_id INTEGER NOT NULL REFERENCES dumps(id) ON DELETE CASCADE,
    scheme TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    filter BLOB NOT NULL
)
"#;

const SCHEMA_CREATE_COMMITS: &str = r#"
CREATE TABLE IF NOT EXISTS commits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    UNIQUE(repository, commit_hash, parent_hash)
)
"#;

const SCHEMA_CREATE_XREPO_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_dumps_key ON dumps(repository, commit_hash);
CREATE INDEX IF NOT EXISTS idx_packages_pkg ON packages(scheme, name, version);
CREATE INDEX IF NOT EXISTS idx_package_refs_pkg ON package_refs(scheme, name, version);
CREATE INDEX IF NOT EXISTS idx_commits_commit ON commits(repository, commit_hash);
CREATE INDEX IF NOT EXISTS idx_commits_parent ON commits(repository, parent_hash);
"#;

/// Errors that can occur during xrepo index operations.
#[derive(Debug, Error)]
pub enum XrepoError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("dump not found: {0}")]
    DumpNotFound(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The cross-repository index store.
///
/// Thread-safe via a mutex around the single connection; every method takes
/// `&self`.
pub struct XrepoIndex {
    conn: Mutex<Connection>,
}

impl XrepoIndex {
    /// Open (creating if necessary) the index at the given path.
    pub fn open(path: &Path) -> Result<Self, XrepoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::initialize(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory index (for testing).
    pub fn in_memory() -> Result<Self, XrepoError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn initialize(conn: &Connection) -> Result<(), XrepoError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Cascade package/reference rows when a dump row is replaced
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute(SCHEMA_CREATE_DUMPS, [])?;
        conn.execute(SCHEMA_CREATE_PACKAGES, [])?;
        conn.execute(SCHEMA_CREATE_PACKAGE_REFS, [])?;
        conn.execute(SCHEMA_CREATE_COMMITS, [])?;
        conn.execute_batch(SCHEMA_CREATE_XREPO_INDEXES)?;
        Ok(())
    }

    /// Register a converted dump and everything it exports and imports in
    /// one transaction. A previous dump for the identical (repository,
    /// commit, root) is replaced; the displaced row is returned so the
    /// caller can remove its backing file.
    ///
    /// The new dump starts in `Queued` state: its database file is not yet
    /// at its final location. [`mark_complete`](Self::mark_complete) flips
    /// it once the file has landed.
    pub fn add_packages_and_references(
        &self,
        repository: &str,
        commit: &str,
        root: &str,
        packages: &[PackageInformation],
        references: &[PackageReference],
    ) -> Result<(i64, Option<Dump>), XrepoError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let replaced = tx
            .query_row(
                "SELECT id, repository, commit_hash, root, state, created_at FROM dumps \
                 WHERE repository = ?1 AND commit_hash = ?2 AND root = ?3",
                params![repository, commit, root],
                map_dump,
            )
            .optional()?;
        if let Some(previous) = &replaced {
            tx.execute("DELETE FROM dumps WHERE id = ?1", [previous.id])?;
        }

        tx.execute(
            "INSERT INTO dumps (repository, commit_hash, root, state, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![repository, commit, root, DumpState::Queued.as_str(), now_unix()],
        )?;
        let dump_id = tx.last_insert_rowid();

        {
            let mut insert_package = tx.prepare(
                "INSERT INTO packages (dump_id, scheme, name, version) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for package in packages {
                insert_package.execute(params![
                    dump_id,
                    package.scheme,
                    package.name,
                    package.version
                ])?;
            }

            let mut insert_reference = tx.prepare(
                "INSERT INTO package_refs (dump_id, scheme, name, version, filter) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for reference in references {
                insert_reference.execute(params![
                    dump_id,
                    reference.scheme,
                    reference.name,
                    reference.version,
                    reference.filter
                ])?;
            }
        }

        tx.commit()?;
        debug!(
            dump_id,
            repository,
            commit,
            root,
            packages = packages.len(),
            references = references.len(),
            replaced = replaced.is_some(),
            "registered dump"
        );
        Ok((dump_id, replaced))
    }

    /// Mark a dump completed once its database file is in place.
    pub fn mark_complete(&self, dump_id: i64) -> Result<(), XrepoError> {
        self.set_dump_state(dump_id, DumpState::Completed)
    }

    /// Mark a dump failed; its file never landed.
    pub fn mark_failed(&self, dump_id: i64) -> Result<(), XrepoError> {
        self.set_dump_state(dump_id, DumpState::Failed)
    }

    fn set_dump_state(&self, dump_id: i64, state: DumpState) -> Result<(), XrepoError> {
        let updated = self.conn.lock().execute(
            "UPDATE dumps SET state = ?1 WHERE id = ?2",
            params![state.as_str(), dump_id],
        )?;
        if updated == 0 {
            return Err(XrepoError::DumpNotFound(dump_id));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_dump_created_at(&self, dump_id: i64, created_at: i64) -> Result<(), XrepoError> {
        self.conn.lock().execute(
            "UPDATE dumps SET created_at = ?1 WHERE id = ?2",
            params![created_at, dump_id],
        )?;
        Ok(())
    }

    pub fn dump_by_id(&self, dump_id: i64) -> Result<Option<Dump>, XrepoError> {
        let dump = self
            .conn
            .lock()
            .query_row(
                "SELECT id, repository, commit_hash, root, state, created_at FROM dumps WHERE id = ?1",
                [dump_id],
                map_dump,
            )
            .optional()?;
        Ok(dump)
    }

    /// Find the completed dump at exactly (repository, commit) that covers
    /// `path`, preferring the most recently created. An empty path matches
    /// any dump at the commit.
    pub fn find_dump(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
    ) -> Result<Option<Dump>, XrepoError> {
        let dumps = self.completed_dumps_at(repository, commit)?;
        Ok(dumps
            .into_iter()
            .filter(|dump| path.is_empty() || dump.covers(path))
            .max_by_key(|dump| (dump.created_at, dump.id)))
    }

    /// All completed dumps at (repository, commit).
    pub fn completed_dumps_at(&self, repository: &str, commit: &str) -> Result<Vec<Dump>, XrepoError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, repository, commit_hash, root, state, created_at FROM dumps \
             WHERE repository = ?1 AND commit_hash = ?2 AND state = 'completed' \
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![repository, commit], map_dump)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Find the completed dump exporting a matching package. When multiple
    /// dumps republish the same package/version, the most recently added
    /// wins.
    pub fn resolve_package(
        &self,
        scheme: &str,
        name: &str,
        version: &str,
    ) -> Result<Option<Dump>, XrepoError> {
        let dump = self
            .conn
            .lock()
            .query_row(
                "SELECT d.id, d.repository, d.commit_hash, d.root, d.state, d.created_at \
                 FROM packages p JOIN dumps d ON d.id = p.dump_id \
                 WHERE p.scheme = ?1 AND p.name = ?2 AND p.version = ?3 AND d.state = 'completed' \
                 ORDER BY d.created_at DESC, d.id DESC LIMIT 1",
                params![scheme, name, version],
                map_dump,
            )
            .optional()?;
        Ok(dump)
    }

    /// All completed dumps importing a matching package.
    pub fn find_referencing_dumps(
        &self,
        scheme: &str,
        name: &str,
        version: &str,
    ) -> Result<Vec<Dump>, XrepoError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT d.id, d.repository, d.commit_hash, d.root, d.state, d.created_at \
             FROM package_refs r JOIN dumps d ON d.id = r.dump_id \
             WHERE r.scheme = ?1 AND r.name = ?2 AND r.version = ?3 AND d.state = 'completed' \
             ORDER BY d.created_at DESC, d.id DESC",
        )?;
        let rows = stmt.query_map(params![scheme, name, version], map_dump)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All completed dumps importing a matching package, paired with the
    /// identifier filter each recorded at conversion time.
    pub fn find_referencing_dumps_with_filters(
        &self,
        scheme: &str,
        name: &str,
        version: &str,
    ) -> Result<Vec<(Dump, Vec<u8>)>, XrepoError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.repository, d.commit_hash, d.root, d.state, d.created_at, r.filter \
             FROM package_refs r JOIN dumps d ON d.id = r.dump_id \
             WHERE r.scheme = ?1 AND r.name = ?2 AND r.version = ?3 AND d.state = 'completed' \
             ORDER BY d.created_at DESC, d.id DESC",
        )?;
        let rows = stmt.query_map(params![scheme, name, version], |row| {
            Ok((map_dump(row)?, row.get::<_, Vec<u8>>(6)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Commit graph storage
    // =========================================================================

    /// Merge newly discovered commit edges into the stored graph. A commit
    /// with no known parent is recorded with an empty parent hash so its
    /// presence is still visible.
    pub fn insert_commit_edges(
        &self,
        repository: &str,
        edges: &[CommitEdge],
    ) -> Result<usize, XrepoError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO commits (repository, commit_hash, parent_hash) \
                 VALUES (?1, ?2, ?3)",
            )?;
            for edge in edges {
                inserted += stmt.execute(params![repository, edge.commit, edge.parent_commit])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Whether any edge mentioning this commit has been stored.
    pub fn has_commit_data(&self, repository: &str, commit: &str) -> Result<bool, XrepoError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM commits \
             WHERE repository = ?1 AND (commit_hash = ?2 OR parent_hash = ?2)",
            params![repository, commit],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Parents and children of a commit in the stored graph.
    pub fn commit_neighbors(
        &self,
        repository: &str,
        commit: &str,
    ) -> Result<(Vec<String>, Vec<String>), XrepoError> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT parent_hash FROM commits \
             WHERE repository = ?1 AND commit_hash = ?2 AND parent_hash != '' ORDER BY id",
        )?;
        let parents = stmt
            .query_map(params![repository, commit], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT commit_hash FROM commits \
             WHERE repository = ?1 AND parent_hash = ?2 ORDER BY id",
        )?;
        let children = stmt
            .query_map(params![repository, commit], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok((parents, children))
    }
}

fn map_dump(row: &Row<'_>) -> rusqlite::Result<Dump> {
    let state: String = row.get(4)?;
    Ok(Dump {
        id: row.get(0)?,
        repository: row.get(1)?,
        commit: row.get(2)?,
        root: row.get(3)?,
        state: DumpState::parse(&state).unwrap_or(DumpState::Failed),
        created_at: row.get(5)?,
    })
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

//! SQLite schema for converted dump databases.
//!
//! Each completed dump is a self-contained SQLite database holding the
//! flattened query data for one (repository, commit, root): per-document
//! payload blobs plus moniker lookup tables for definitions and references.

/// Schema version for dump databases.
pub const DUMP_SCHEMA_VERSION: &str = "1.0";

/// SQL to create the metadata table.
pub const SCHEMA_CREATE_META: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
)
"#;

/// SQL to create the documents table.
///
/// `data` is a gzip-compressed JSON encoding of the document's ordered
/// range payloads (`DocumentData`). Paths are relative to the dump root.
pub const SCHEMA_CREATE_DOCUMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    path TEXT PRIMARY KEY NOT NULL,
    data BLOB NOT NULL
)
"#;

/// SQL to create the definitions table.
///
/// One row per definition range carrying an exported moniker, keyed by
/// (scheme, identifier) so other dumps can land here by package symbol.
pub const SCHEMA_CREATE_DEFS: &str = r#"
CREATE TABLE IF NOT EXISTS defs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scheme TEXT NOT NULL,
    identifier TEXT NOT NULL,
    path TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    start_character INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    end_character INTEGER NOT NULL
)
"#;

/// SQL to create the references table (refs: REFERENCES is reserved).
pub const SCHEMA_CREATE_REFS: &str = r#"
CREATE TABLE IF NOT EXISTS refs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scheme TEXT NOT NULL,
    identifier TEXT NOT NULL,
    path TEXT NOT NULL,
    start_line INTEGER NOT NULL,
    start_character INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    end_character INTEGER NOT NULL
)
"#;

/// SQL to create indexes for moniker lookups.
pub const SCHEMA_CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_defs_moniker ON defs(scheme, identifier);
CREATE INDEX IF NOT EXISTS idx_refs_moniker ON refs(scheme, identifier);
"#;

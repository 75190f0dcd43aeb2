//! Per-dump query execution.
//!
//! A [`Database`] answers exists/definitions/references/hover against one
//! converted dump. Its SQLite handle and decoded document payloads are
//! routed through the two shared [`ResourceCache`]s, so repeated queries
//! against the same dump reuse one open handle and hot documents stay
//! decoded in memory within the configured byte budget.
//!
//! Queries are strictly single-dump: when an answer lives in another dump
//! the result carries the moniker tagged as external, and the caller
//! decides whether and how to chase it.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::{CacheError, ResourceCache};
use crate::dump::{DumpConnection, DumpDbError};
use crate::model::{DocumentData, Dump, DumpLocation, Moniker, MonikerKind, Position};

/// Shared cache of open dump database handles, one cost unit per handle.
pub type ConnectionCache = ResourceCache<PathBuf, Arc<Mutex<DumpConnection>>>;

/// Shared cache of decoded document payloads, cost counted in stored blob
/// bytes. Keyed by (dump database path, document path).
pub type DocumentCache = ResourceCache<(PathBuf, String), Arc<DocumentData>>;

/// Errors that can occur executing a query against a dump.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Dump(#[from] DumpDbError),
}

/// Outcome of a definitions query against one dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionsOutcome {
    /// Definitions found within this dump.
    Resolved(Vec<DumpLocation>),
    /// The symbol is defined elsewhere; the import moniker names the
    /// package to resolve.
    External(Moniker),
}

/// Outcome of a references query against one dump: the local use sites
/// plus any monikers whose packages other dumps may reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferencesOutcome {
    pub locations: Vec<DumpLocation>,
    pub external: Vec<Moniker>,
}

/// Query access to one dump.
pub struct Database {
    dump: Dump,
    db_path: PathBuf,
    connections: Arc<ConnectionCache>,
    documents: Arc<DocumentCache>,
}

impl Database {
    pub fn new(
        dump: Dump,
        db_path: PathBuf,
        connections: Arc<ConnectionCache>,
        documents: Arc<DocumentCache>,
    ) -> Self {
        Self { dump, db_path, connections, documents }
    }

    pub fn dump(&self) -> &Dump {
        &self.dump
    }

    /// Whether the dump contains a document at `path` (relative to the
    /// dump root).
    pub async fn exists(&self, path: &str) -> Result<bool, DatabaseError> {
        self.with_connection(|db| db.document_exists(path)).await
    }

    /// Definitions for the symbol at `position`, or `None` when the dump
    /// has no data for the location.
    pub async fn definitions(
        &self,
        path: &str,
        position: Position,
    ) -> Result<Option<DefinitionsOutcome>, DatabaseError> {
        let Some(doc) = self.document(path).await? else {
            return Ok(None);
        };
        let Some(range) = doc.find_range(position) else {
            return Ok(None);
        };

        if !range.definitions.is_empty() {
            return Ok(Some(DefinitionsOutcome::Resolved(range.definitions.clone())));
        }

        // No local result. Monikers are ordered import-first, so a symbol
        // defined in another dump surfaces as External before any same-dump
        // moniker lookup is attempted.
        for moniker in &range.monikers {
            match moniker.kind {
                MonikerKind::Import if moniker.package.is_some() => {
                    return Ok(Some(DefinitionsOutcome::External(moniker.clone())));
                }
                MonikerKind::Local => {}
                _ => {
                    let defs = self
                        .with_connection(|db| db.moniker_defs(&moniker.scheme, &moniker.identifier))
                        .await?;
                    if !defs.is_empty() {
                        return Ok(Some(DefinitionsOutcome::Resolved(defs)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// References to the symbol at `position`, or `None` when the dump has
    /// no data for the location.
    pub async fn references(
        &self,
        path: &str,
        position: Position,
    ) -> Result<Option<ReferencesOutcome>, DatabaseError> {
        let Some(doc) = self.document(path).await? else {
            return Ok(None);
        };
        let Some(range) = doc.find_range(position) else {
            return Ok(None);
        };

        let mut locations = range.references.clone();
        let mut external = Vec::new();
        for moniker in &range.monikers {
            if moniker.kind == MonikerKind::Local {
                continue;
            }
            let more = self
                .with_connection(|db| db.moniker_refs(&moniker.scheme, &moniker.identifier))
                .await?;
            locations.extend(more);
            if moniker.package.is_some() {
                external.push(moniker.clone());
            }
        }
        dedup_locations(&mut locations);

        if locations.is_empty() && external.is_empty() {
            return Ok(None);
        }
        Ok(Some(ReferencesOutcome { locations, external }))
    }

    /// Hover text for the symbol at `position`.
    pub async fn hover(&self, path: &str, position: Position) -> Result<Option<String>, DatabaseError> {
        let Some(doc) = self.document(path).await? else {
            return Ok(None);
        };
        Ok(doc.find_range(position).and_then(|range| range.hover.clone()))
    }

    /// Look up definition locations for a moniker, used when another dump
    /// resolves an external symbol into this one.
    pub async fn moniker_definitions(
        &self,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<DumpLocation>, DatabaseError> {
        self.with_connection(|db| db.moniker_defs(scheme, identifier)).await
    }

    /// Look up reference locations for a moniker.
    pub async fn moniker_references(
        &self,
        scheme: &str,
        identifier: &str,
    ) -> Result<Vec<DumpLocation>, DatabaseError> {
        self.with_connection(|db| db.moniker_refs(scheme, identifier)).await
    }

    /// Load a document through the document cache. Existence is checked
    /// against the dump first so a missing path never occupies the cache.
    async fn document(&self, path: &str) -> Result<Option<Arc<DocumentData>>, DatabaseError> {
        if !self.exists(path).await? {
            return Ok(None);
        }

        let key = (self.db_path.clone(), path.to_string());
        let doc = self
            .documents
            .get(key.clone(), || async {
                let loaded = self
                    .with_connection(|db| db.get_document(path))
                    .await
                    .map_err(anyhow::Error::new)?
                    .ok_or_else(|| anyhow::anyhow!("document vanished during load: {path}"))?;
                let (data, size) = loaded;
                Ok((Arc::new(data), size))
            })
            .await?;
        self.documents.release(&key);
        Ok(Some(doc))
    }

    /// Run `f` against the dump's connection, checked out of the handle
    /// cache for the duration of the call.
    async fn with_connection<T>(
        &self,
        f: impl FnOnce(&DumpConnection) -> Result<T, DumpDbError>,
    ) -> Result<T, DatabaseError> {
        let handle = self
            .connections
            .get(self.db_path.clone(), || async {
                let conn = DumpConnection::open(&self.db_path).map_err(anyhow::Error::new)?;
                Ok((Arc::new(Mutex::new(conn)), 1))
            })
            .await?;

        let result = f(&handle.lock());
        self.connections.release(&self.db_path);
        Ok(result?)
    }
}

fn dedup_locations(locations: &mut Vec<DumpLocation>) {
    locations.sort_by(|a, b| {
        (&a.path, a.range.start_line, a.range.start_character)
            .cmp(&(&b.path, b.range.start_line, b.range.start_character))
    });
    locations.dedup();
}

//! The query and ingestion surface consumed by the HTTP layer.
//!
//! Uploads land as raw files and a convert job is enqueued; queries resolve
//! a dump for the requested (repository, commit), falling back to the
//! nearest indexed commit, then execute against that dump through the
//! shared caches. Results tagged external by the per-dump layer are chased
//! here through the cross-repository package index.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use lodestone_config::LodestoneConfig;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::cache::{CacheError, ResourceCache};
use crate::commits::{CommitGraph, CommitGraphError};
use crate::convert::filter_may_contain;
use crate::database::{
    ConnectionCache, Database, DatabaseError, DefinitionsOutcome, DocumentCache,
};
use crate::model::{Dump, DumpLocation, Location, Moniker, Position};
use crate::queue::{JobKind, JobQueue, QueueError};
use crate::storage::StorageLayout;
use crate::xrepo::{XrepoError, XrepoIndex};

/// Errors surfaced to the HTTP layer.
///
/// `NoData` is distinct so a missing dump or document maps to a not-found
/// response instead of a generic failure.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no data for the requested repository and commit")]
    NoData,

    #[error("upload exceeds the maximum size of {limit} bytes")]
    UploadTooLarge { limit: u64 },

    #[error(transparent)]
    Xrepo(#[from] XrepoError),

    #[error(transparent)]
    CommitGraph(#[from] CommitGraphError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for the service surface.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Reject uploads larger than this many bytes.
    pub max_upload_bytes: u64,
    /// Retry budget for enqueued convert jobs.
    pub max_job_attempts: u32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_upload_bytes: 512 * 1024 * 1024,
            max_job_attempts: 3,
        }
    }
}

impl From<&LodestoneConfig> for ServiceOptions {
    fn from(config: &LodestoneConfig) -> Self {
        Self {
            max_upload_bytes: config.storage.max_upload_bytes,
            max_job_attempts: config.worker.max_job_attempts,
        }
    }
}

/// Ingestion and query operations over the whole dump collection.
pub struct CodeIntelService {
    storage: StorageLayout,
    xrepo: Arc<XrepoIndex>,
    commit_graph: Arc<CommitGraph>,
    queue: Arc<JobQueue>,
    connections: Arc<ConnectionCache>,
    documents: Arc<DocumentCache>,
    options: ServiceOptions,
}

impl CodeIntelService {
    pub fn new(
        storage: StorageLayout,
        xrepo: Arc<XrepoIndex>,
        commit_graph: Arc<CommitGraph>,
        queue: Arc<JobQueue>,
        connections: Arc<ConnectionCache>,
        documents: Arc<DocumentCache>,
        options: ServiceOptions,
    ) -> Self {
        Self { storage, xrepo, commit_graph, queue, connections, documents, options }
    }

    /// Build a service with caches and limits sized from the daemon
    /// configuration.
    pub fn from_config(
        config: &LodestoneConfig,
        xrepo: Arc<XrepoIndex>,
        commit_graph: Arc<CommitGraph>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self::new(
            StorageLayout::new(config.storage.root.clone()),
            xrepo,
            commit_graph,
            queue,
            Arc::new(ResourceCache::new(config.cache.connection_capacity)),
            Arc::new(ResourceCache::new(config.cache.document_cache_bytes)),
            ServiceOptions::from(config),
        )
    }

    /// Store an uploaded index payload and enqueue its conversion. Returns
    /// the job id.
    ///
    /// The payload is spooled to the uploads directory unparsed; validation
    /// happens in the convert job so a slow parse never occupies a request
    /// handler.
    pub async fn insert_dump<R>(
        &self,
        mut payload: R,
        repository: &str,
        commit: &str,
        root: &str,
    ) -> Result<i64, ServiceError>
    where
        R: AsyncRead + Unpin,
    {
        let upload_path = self.storage.fresh_upload_path();
        let mut file = tokio::fs::File::create(&upload_path).await?;

        let mut total: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = payload.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > self.options.max_upload_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&upload_path).await;
                return Err(ServiceError::UploadTooLarge {
                    limit: self.options.max_upload_bytes,
                });
            }
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        drop(file);

        let mut tracing_context = HashMap::new();
        tracing_context.insert("repository".to_string(), repository.to_string());
        tracing_context.insert("commit".to_string(), commit.to_string());

        let job_id = self.queue.enqueue(
            &JobKind::Convert {
                repository: repository.to_string(),
                commit: commit.to_string(),
                root: root.to_string(),
                filename: upload_path.clone(),
            },
            &tracing_context,
            self.options.max_job_attempts,
        )?;

        info!(job_id, repository, commit, root, bytes = total, "upload accepted");
        Ok(job_id)
    }

    /// Whether converted data exists for `path` at (repository, commit),
    /// serving from the nearest indexed commit when the exact one has no
    /// dump. An empty path asks whether any data exists at the commit at
    /// all, which dump resolution already answers.
    pub async fn exists(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
    ) -> Result<bool, ServiceError> {
        let dump = self.resolve_dump(repository, commit, path).await?;
        if path.is_empty() {
            return Ok(true);
        }
        let db = self.open_database(&dump);
        Ok(db.exists(strip_root(&dump, path)).await?)
    }

    /// Definition locations for the symbol at `position`.
    pub async fn definitions(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
        position: Position,
    ) -> Result<Vec<Location>, ServiceError> {
        let dump = self.resolve_dump(repository, commit, path).await?;
        let db = self.open_database(&dump);
        let rel = strip_root(&dump, path);
        if !db.exists(rel).await? {
            return Err(ServiceError::NoData);
        }

        match db.definitions(rel, position).await? {
            Some(DefinitionsOutcome::Resolved(locations)) => {
                Ok(locations.into_iter().map(|loc| qualify(&dump, loc)).collect())
            }
            Some(DefinitionsOutcome::External(moniker)) => {
                self.remote_definitions(&moniker).await
            }
            None => Ok(Vec::new()),
        }
    }

    /// Reference locations for the symbol at `position`, fanned out across
    /// every dump importing the symbol's package.
    pub async fn references(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
        position: Position,
    ) -> Result<Vec<Location>, ServiceError> {
        let dump = self.resolve_dump(repository, commit, path).await?;
        let db = self.open_database(&dump);
        let rel = strip_root(&dump, path);
        if !db.exists(rel).await? {
            return Err(ServiceError::NoData);
        }

        let Some(outcome) = db.references(rel, position).await? else {
            return Ok(Vec::new());
        };

        let mut results: Vec<Location> = outcome
            .locations
            .into_iter()
            .map(|loc| qualify(&dump, loc))
            .collect();

        for moniker in &outcome.external {
            let Some(package) = &moniker.package else { continue };
            let referencing = self.xrepo.find_referencing_dumps_with_filters(
                &package.scheme,
                &package.name,
                &package.version,
            )?;
            for (remote, filter) in referencing {
                if remote.id == dump.id || !filter_may_contain(&filter, &moniker.identifier) {
                    continue;
                }
                let remote_db = self.open_database(&remote);
                let locations = remote_db
                    .moniker_references(&moniker.scheme, &moniker.identifier)
                    .await?;
                results.extend(locations.into_iter().map(|loc| qualify(&remote, loc)));
            }
            // The defining dump's own use sites are not in any refs table;
            // pull them from the definition ranges there.
            if let Some(defining) =
                self.xrepo.resolve_package(&package.scheme, &package.name, &package.version)?
            {
                if defining.id != dump.id {
                    let remote_db = self.open_database(&defining);
                    let defs = remote_db
                        .moniker_definitions(&moniker.scheme, &moniker.identifier)
                        .await?;
                    results.extend(defs.into_iter().map(|loc| qualify(&defining, loc)));
                }
            }
        }

        dedup_qualified(&mut results);
        Ok(results)
    }

    /// Hover text for the symbol at `position`. When the symbol is defined
    /// in another dump the hover is read from its definition site there.
    pub async fn hover(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
        position: Position,
    ) -> Result<Option<String>, ServiceError> {
        let dump = self.resolve_dump(repository, commit, path).await?;
        let db = self.open_database(&dump);
        let rel = strip_root(&dump, path);
        if !db.exists(rel).await? {
            return Err(ServiceError::NoData);
        }

        if let Some(text) = db.hover(rel, position).await? {
            return Ok(Some(text));
        }

        match db.definitions(rel, position).await? {
            Some(DefinitionsOutcome::External(moniker)) => self.remote_hover(&moniker).await,
            _ => Ok(None),
        }
    }

    /// Resolve the dump serving (repository, commit, path): the exact
    /// commit's dump when present, otherwise the nearest indexed commit
    /// after an on-demand ancestry discovery.
    async fn resolve_dump(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
    ) -> Result<Dump, ServiceError> {
        if let Some(dump) = self.xrepo.find_dump(repository, commit, path)? {
            return Ok(dump);
        }

        self.commit_graph.discover_and_update_commit(repository, commit).await?;
        match self.commit_graph.find_closest_dump(repository, commit, path)? {
            Some(dump) => {
                debug!(
                    repository,
                    commit,
                    served_by = %dump.commit,
                    "serving query from nearest indexed commit"
                );
                Ok(dump)
            }
            None => Err(ServiceError::NoData),
        }
    }

    fn open_database(&self, dump: &Dump) -> Database {
        Database::new(
            dump.clone(),
            self.dump_db_path(dump),
            Arc::clone(&self.connections),
            Arc::clone(&self.documents),
        )
    }

    fn dump_db_path(&self, dump: &Dump) -> PathBuf {
        self.storage.dump_path(dump.id, &dump.repository, &dump.commit)
    }

    async fn remote_definitions(&self, moniker: &Moniker) -> Result<Vec<Location>, ServiceError> {
        let Some(package) = &moniker.package else {
            return Ok(Vec::new());
        };
        let Some(remote) =
            self.xrepo.resolve_package(&package.scheme, &package.name, &package.version)?
        else {
            return Ok(Vec::new());
        };

        let remote_db = self.open_database(&remote);
        let locations = remote_db
            .moniker_definitions(&moniker.scheme, &moniker.identifier)
            .await?;
        Ok(locations.into_iter().map(|loc| qualify(&remote, loc)).collect())
    }

    async fn remote_hover(&self, moniker: &Moniker) -> Result<Option<String>, ServiceError> {
        let Some(package) = &moniker.package else {
            return Ok(None);
        };
        let Some(remote) =
            self.xrepo.resolve_package(&package.scheme, &package.name, &package.version)?
        else {
            return Ok(None);
        };

        let remote_db = self.open_database(&remote);
        let defs = remote_db
            .moniker_definitions(&moniker.scheme, &moniker.identifier)
            .await?;
        let Some(def) = defs.first() else {
            return Ok(None);
        };
        let position = Position {
            line: def.range.start_line,
            character: def.range.start_character,
        };
        Ok(remote_db.hover(&def.path, position).await?)
    }
}

/// A dump stores paths relative to its root; queries arrive repo-relative.
fn strip_root<'a>(dump: &Dump, path: &'a str) -> &'a str {
    path.strip_prefix(dump.root.as_str())
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(path)
}

/// Re-qualify a dump-relative location for API consumers.
fn qualify(dump: &Dump, loc: DumpLocation) -> Location {
    let path = if dump.root.is_empty() {
        loc.path
    } else {
        format!("{}{}", dump.root, loc.path)
    };
    Location {
        repository: dump.repository.clone(),
        commit: dump.commit.clone(),
        path,
        range: loc.range,
    }
}

fn dedup_qualified(locations: &mut Vec<Location>) {
    locations.sort_by(|a, b| {
        (&a.repository, &a.commit, &a.path, a.range.start_line, a.range.start_character).cmp(&(
            &b.repository,
            &b.commit,
            &b.path,
            b.range.start_line,
            b.range.start_character,
        ))
    });
    locations.dedup();
}

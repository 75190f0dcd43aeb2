//! Lodestone Core - precise code intelligence over LSIF dumps
//!
//! This crate provides the backend behind the code intelligence API:
//! - LSIF upload conversion into per-commit SQLite dump databases
//! - A cross-repository package export/import index and dump registry
//! - Commit ancestry tracking with bounded nearest-dump resolution
//! - Resource-bounded caches with singleflight for handles and documents
//! - A crash-safe job queue and the conversion worker pool
//! - The query surface answering exists/definitions/references/hover

pub mod cache;
pub mod commits;
pub mod convert;
pub mod database;
pub mod dump;
pub mod model;
pub mod queue;
pub mod schema;
pub mod service;
pub mod storage;
pub mod worker;
pub mod xrepo;

// Cache re-exports
pub use cache::{CacheError, CacheMetrics, ResourceCache};

// Model re-exports
pub use model::{
    CommitEdge, DocumentData, Dump, DumpLocation, DumpState, Location, Moniker, MonikerKind,
    PackageInformation, PackageReference, Position, Range, RangeData,
};

// Storage and persistence re-exports
pub use dump::{DumpConnection, DumpDbError};
pub use schema::DUMP_SCHEMA_VERSION;
pub use storage::StorageLayout;
pub use xrepo::{XrepoError, XrepoIndex};

// Commit graph re-exports
pub use commits::{
    CommitGraph, CommitGraphError, GitClient, HttpGitClient, MAX_COMMITS_PER_UPDATE,
    MAX_TRAVERSAL_LIMIT,
};

// Conversion pipeline re-exports
pub use convert::{convert_lsif, ConversionOutput, ConvertError};
pub use queue::{Job, JobKind, JobQueue, JobState, QueueError};
pub use worker::{spawn_cleanup_scheduler, spawn_pool, JobMetrics, Worker};

// Query surface re-exports
pub use database::{
    ConnectionCache, Database, DatabaseError, DefinitionsOutcome, DocumentCache, ReferencesOutcome,
};
pub use service::{CodeIntelService, ServiceError, ServiceOptions};

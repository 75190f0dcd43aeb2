//! End-to-end pipeline tests: upload through conversion to queries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use pretty_assertions::assert_eq;
use std::io::Write;
use tempfile::TempDir;

use lodestone_core::{
    CodeIntelService, CommitEdge, CommitGraph, DumpState, GitClient, JobQueue, JobState, Position,
    ResourceCache, ServiceError, ServiceOptions, StorageLayout, Worker, XrepoIndex,
};

/// Serves a fixed edge set, standing in for the version-control host.
struct FakeGit {
    edges: Vec<CommitEdge>,
}

#[async_trait]
impl GitClient for FakeGit {
    async fn commit_edges(
        &self,
        _repository: &str,
        _commit: &str,
        _limit: usize,
    ) -> anyhow::Result<Vec<CommitEdge>> {
        Ok(self.edges.clone())
    }
}

fn commit(c: char) -> String {
    std::iter::repeat(c).take(40).collect()
}

/// A small but real index: one document, a hovered definition range
/// exporting widget:foo, and a second range referencing it.
fn widget_index() -> Vec<u8> {
    use serde_json::json;
    let lines = [
        json!({"id": 1, "type": "vertex", "label": "metaData", "projectRoot": "file:///repo"}),
        json!({"id": 2, "type": "vertex", "label": "document", "uri": "file:///repo/src/index.ts"}),
        json!({"id": 3, "type": "vertex", "label": "range",
               "start": {"line": 0, "character": 9}, "end": {"line": 0, "character": 12}}),
        json!({"id": 4, "type": "vertex", "label": "resultSet"}),
        json!({"id": 5, "type": "edge", "label": "next", "outV": 3, "inV": 4}),
        json!({"id": 6, "type": "vertex", "label": "hoverResult",
               "result": {"contents": {"language": "typescript", "value": "function foo(): void"}}}),
        json!({"id": 7, "type": "edge", "label": "textDocument/hover", "outV": 4, "inV": 6}),
        json!({"id": 8, "type": "vertex", "label": "definitionResult"}),
        json!({"id": 9, "type": "edge", "label": "textDocument/definitions", "outV": 4, "inV": 8}),
        json!({"id": 10, "type": "edge", "label": "item", "outV": 8, "inVs": [3], "document": 2}),
        json!({"id": 11, "type": "vertex", "label": "referenceResult"}),
        json!({"id": 12, "type": "edge", "label": "textDocument/references", "outV": 4, "inV": 11}),
        json!({"id": 13, "type": "edge", "label": "item", "outV": 11, "inVs": [3, 14], "document": 2}),
        json!({"id": 14, "type": "vertex", "label": "range",
               "start": {"line": 4, "character": 0}, "end": {"line": 4, "character": 3}}),
        json!({"id": 15, "type": "edge", "label": "next", "outV": 14, "inV": 4}),
        json!({"id": 16, "type": "vertex", "label": "packageInformation", "name": "widget", "version": "1.0.0"}),
        json!({"id": 17, "type": "vertex", "label": "moniker", "kind": "export",
               "scheme": "npm", "identifier": "widget:foo"}),
        json!({"id": 18, "type": "edge", "label": "packageInformation", "outV": 17, "inV": 16}),
        json!({"id": 19, "type": "edge", "label": "moniker", "outV": 4, "inV": 17}),
        json!({"id": 20, "type": "edge", "label": "contains", "outV": 2, "inVs": [3, 14]}),
    ];
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for line in lines {
        writeln!(encoder, "{line}").unwrap();
    }
    encoder.finish().unwrap()
}

struct Harness {
    _dir: TempDir,
    service: CodeIntelService,
    worker: Worker,
    queue: Arc<JobQueue>,
    xrepo: Arc<XrepoIndex>,
    storage: StorageLayout,
}

fn harness(git_edges: Vec<CommitEdge>) -> Harness {
    let dir = TempDir::new().unwrap();
    let storage = StorageLayout::new(dir.path());
    storage.bootstrap().unwrap();

    let xrepo = Arc::new(XrepoIndex::open(&storage.xrepo_db_path()).unwrap());
    let commit_graph = Arc::new(CommitGraph::new(
        Arc::clone(&xrepo),
        Arc::new(FakeGit { edges: git_edges }),
    ));
    let queue = Arc::new(JobQueue::open(&storage.jobs_db_path()).unwrap());

    let service = CodeIntelService::new(
        storage.clone(),
        Arc::clone(&xrepo),
        Arc::clone(&commit_graph),
        Arc::clone(&queue),
        Arc::new(ResourceCache::new(8)),
        Arc::new(ResourceCache::new(4 * 1024 * 1024)),
        ServiceOptions::default(),
    );
    let worker = Worker::new(
        storage.clone(),
        Arc::clone(&xrepo),
        commit_graph,
        Arc::clone(&queue),
        Duration::from_secs(3600),
    );

    Harness { _dir: dir, service, worker, queue, xrepo, storage }
}

#[tokio::test]
async fn test_upload_convert_exists_hover() {
    let h = harness(Vec::new());
    let repo = "github.com/acme/widget";
    let zeros = "0".repeat(40);

    // Before conversion the data is not there.
    let err = h.service.exists(repo, &zeros, "src/index.ts").await.unwrap_err();
    assert!(matches!(err, ServiceError::NoData));

    let payload = widget_index();
    h.service.insert_dump(&payload[..], repo, &zeros, "").await.unwrap();

    // Poll until the worker has drained the queue, as an HTTP client would.
    loop {
        if !h.worker.process_next().await.unwrap() {
            break;
        }
    }

    assert!(h.service.exists(repo, &zeros, "src/index.ts").await.unwrap());

    let hover = h
        .service
        .hover(repo, &zeros, "src/index.ts", Position { line: 0, character: 10 })
        .await
        .unwrap();
    assert_eq!(hover.as_deref(), Some("```typescript\nfunction foo(): void\n```"));

    let defs = h
        .service
        .definitions(repo, &zeros, "src/index.ts", Position { line: 4, character: 1 })
        .await
        .unwrap();
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].range.start_line, 0);

    let refs = h
        .service
        .references(repo, &zeros, "src/index.ts", Position { line: 0, character: 10 })
        .await
        .unwrap();
    assert_eq!(refs.len(), 2);
}

#[tokio::test]
async fn test_child_commit_served_from_ancestor_dump() {
    let repo = "github.com/acme/widget";
    // The host knows c2 is a child of c1; only c1 gets indexed.
    let h = harness(vec![CommitEdge {
        commit: commit('2'),
        parent_commit: commit('1'),
    }]);

    let payload = widget_index();
    h.service.insert_dump(&payload[..], repo, &commit('1'), "").await.unwrap();
    while h.worker.process_next().await.unwrap() {}

    let hover = h
        .service
        .hover(repo, &commit('2'), "src/index.ts", Position { line: 0, character: 10 })
        .await
        .unwrap();
    assert_eq!(hover.as_deref(), Some("```typescript\nfunction foo(): void\n```"));

    let defs = h
        .service
        .definitions(repo, &commit('2'), "src/index.ts", Position { line: 4, character: 1 })
        .await
        .unwrap();
    assert_eq!(defs[0].commit, commit('1'));
}

#[tokio::test]
async fn test_concurrent_duplicate_uploads_converge_to_one_dump() {
    let h = harness(Vec::new());
    let repo = "github.com/acme/widget";
    let zeros = "0".repeat(40);
    let payload = widget_index();

    // Both uploads are accepted.
    let first = h.service.insert_dump(&payload[..], repo, &zeros, "").await.unwrap();
    let second = h.service.insert_dump(&payload[..], repo, &zeros, "").await.unwrap();
    assert_ne!(first, second);

    while h.worker.process_next().await.unwrap() {}
    assert_eq!(h.queue.count_in_state(JobState::Completed).unwrap(), 2);

    // Replace semantics leave exactly one queryable dump.
    let dumps = h.xrepo.completed_dumps_at(repo, &zeros).unwrap();
    assert_eq!(dumps.len(), 1);
    assert_eq!(dumps[0].state, DumpState::Completed);

    // Exactly one database file remains on disk.
    assert_eq!(std::fs::read_dir(h.storage.dumps_dir()).unwrap().count(), 1);
    assert!(h.service.exists(repo, &zeros, "src/index.ts").await.unwrap());
}

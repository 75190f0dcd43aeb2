//! Commit ancestry tracking and nearest-dump resolution.
//!
//! Most queried commits are not directly indexed. The commit graph walks
//! outward from the requested commit over both ancestor and descendant
//! edges, visiting nearer commits first, and stops at the first commit with
//! a completed dump covering the requested path. The walk is bounded: past
//! the traversal limit the answer degrades to "none" instead of scanning an
//! unbounded history.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{CommitEdge, Dump};
use crate::xrepo::{XrepoError, XrepoIndex};

/// Upper bound on commits fetched from the version-control host per
/// discovery call.
pub const MAX_COMMITS_PER_UPDATE: usize = 5000;

/// Upper bound on commits visited by a nearest-dump search.
pub const MAX_TRAVERSAL_LIMIT: usize = 100;

/// Errors that can occur during commit graph operations.
#[derive(Debug, Error)]
pub enum CommitGraphError {
    #[error("xrepo index error: {0}")]
    Xrepo(#[from] XrepoError),

    #[error("gitserver error: {0}")]
    Git(#[source] anyhow::Error),
}

/// External collaborator: the version-control host that knows commit
/// parentage.
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Fetch up to `limit` (commit, parent) edges reachable from `commit`.
    /// A commit without parents is reported with an empty parent hash.
    async fn commit_edges(
        &self,
        repository: &str,
        commit: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<CommitEdge>>;
}

/// Per-repository commit ancestry store and nearest-dump search.
pub struct CommitGraph {
    xrepo: Arc<XrepoIndex>,
    git: Arc<dyn GitClient>,
    /// Memoized nearest-dump answers keyed by (repository, commit, path).
    memo: DashMap<(String, String, String), Option<Dump>>,
}

impl CommitGraph {
    pub fn new(xrepo: Arc<XrepoIndex>, git: Arc<dyn GitClient>) -> Self {
        Self {
            xrepo,
            git,
            memo: DashMap::new(),
        }
    }

    /// Fetch ancestor edges for a newly indexed commit from the
    /// version-control host and merge them into the stored graph. Skipped
    /// when the commit is already known; new edges invalidate the
    /// repository's memoized answers.
    pub async fn discover_and_update_commit(
        &self,
        repository: &str,
        commit: &str,
    ) -> Result<(), CommitGraphError> {
        if self.xrepo.has_commit_data(repository, commit)? {
            debug!(repository, commit, "commit already known, skipping discovery");
            return Ok(());
        }

        let edges = self
            .git
            .commit_edges(repository, commit, MAX_COMMITS_PER_UPDATE)
            .await
            .map_err(CommitGraphError::Git)?;

        let inserted = self.xrepo.insert_commit_edges(repository, &edges)?;
        debug!(repository, commit, fetched = edges.len(), inserted, "updated commit graph");
        if inserted > 0 {
            self.invalidate_repository(repository);
        }
        Ok(())
    }

    /// Drop memoized nearest-dump answers for a repository. Called when new
    /// edges or new dumps could change them.
    pub fn invalidate_repository(&self, repository: &str) {
        self.memo.retain(|key, _| key.0 != repository);
    }

    /// Find the completed dump covering `path` at the commit nearest to
    /// `commit`, searching both ancestors and descendants, nearer commits
    /// first. Ties at equal distance prefer an ancestor over a descendant,
    /// then the most recently created dump. Returns `None` once the bounded
    /// frontier is exhausted.
    pub fn find_closest_dump(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
    ) -> Result<Option<Dump>, CommitGraphError> {
        let memo_key = (repository.to_string(), commit.to_string(), path.to_string());
        if let Some(hit) = self.memo.get(&memo_key) {
            return Ok(hit.clone());
        }

        let found = self.search(repository, commit, path)?;
        self.memo.insert(memo_key, found.clone());
        Ok(found)
    }

    fn search(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
    ) -> Result<Option<Dump>, CommitGraphError> {
        if let Some(dump) = self.xrepo.find_dump(repository, commit, path)? {
            return Ok(Some(dump));
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(commit.to_string());

        // Commits are classified by the first edge taken from the origin,
        // so the ancestor-over-descendant tie break applies at every depth.
        let (parents, children) = self.xrepo.commit_neighbors(repository, commit)?;
        let mut layer: Vec<(String, Side)> = Vec::new();
        for parent in parents {
            if visited.insert(parent.clone()) {
                layer.push((parent, Side::Ancestor));
            }
        }
        for child in children {
            if visited.insert(child.clone()) {
                layer.push((child, Side::Descendant));
            }
        }

        while !layer.is_empty() {
            if let Some(dump) = self.best_in_layer(repository, path, &layer)? {
                return Ok(Some(dump));
            }

            if visited.len() >= MAX_TRAVERSAL_LIMIT {
                warn!(
                    repository,
                    commit,
                    limit = MAX_TRAVERSAL_LIMIT,
                    "nearest-dump search hit traversal limit"
                );
                return Ok(None);
            }

            let mut next = Vec::new();
            for (current, side) in &layer {
                let (parents, children) = self.xrepo.commit_neighbors(repository, current)?;
                for neighbor in parents.into_iter().chain(children) {
                    if visited.insert(neighbor.clone()) {
                        next.push((neighbor, *side));
                    }
                }
            }
            layer = next;
        }

        Ok(None)
    }

    /// Pick the winning dump among all commits at one distance: ancestors
    /// beat descendants, then the most recently created dump wins.
    fn best_in_layer(
        &self,
        repository: &str,
        path: &str,
        layer: &[(String, Side)],
    ) -> Result<Option<Dump>, CommitGraphError> {
        let mut best: Option<(Side, Dump)> = None;
        for (hash, side) in layer {
            let Some(dump) = self.xrepo.find_dump(repository, hash, path)? else {
                continue;
            };
            let wins = match &best {
                None => true,
                Some((best_side, best_dump)) => {
                    (*side == Side::Ancestor && *best_side == Side::Descendant)
                        || (side == best_side && dump.created_at > best_dump.created_at)
                }
            };
            if wins {
                best = Some((*side, dump));
            }
        }
        Ok(best.map(|(_, dump)| dump))
    }
}

/// Which side of the origin commit a frontier commit lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Ancestor,
    Descendant,
}

/// Gitserver-backed [`GitClient`]. Picks a shard by repository name and
/// asks it for `git log --pretty='%H %P'` output.
pub struct HttpGitClient {
    client: reqwest::Client,
    addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    output: String,
}

impl HttpGitClient {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            addresses,
        }
    }

    fn address_for(&self, repository: &str) -> &str {
        let hash: usize = repository.bytes().map(usize::from).sum();
        &self.addresses[hash % self.addresses.len()]
    }
}

#[async_trait]
impl GitClient for HttpGitClient {
    async fn commit_edges(
        &self,
        repository: &str,
        commit: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<CommitEdge>> {
        if self.addresses.is_empty() {
            anyhow::bail!("no gitserver addresses configured");
        }

        let address = self.address_for(repository);
        let body = serde_json::json!({
            "repo": repository,
            "args": ["log", "--pretty=%H %P", format!("-{limit}"), commit],
        });

        let response = self
            .client
            .post(format!("{address}/exec"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let exec: ExecResponse = response.json().await?;

        Ok(parse_commit_log(&exec.output))
    }
}

/// Parse `git log --pretty='%H %P'` output into edges. Each line is a
/// commit hash followed by zero or more parent hashes.
fn parse_commit_log(output: &str) -> Vec<CommitEdge> {
    let mut edges = Vec::new();
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let Some(commit) = parts.next() else { continue };
        let mut had_parent = false;
        for parent in parts {
            had_parent = true;
            edges.push(CommitEdge {
                commit: commit.to_string(),
                parent_commit: parent.to_string(),
            });
        }
        if !had_parent {
            edges.push(CommitEdge {
                commit: commit.to_string(),
                parent_commit: String::new(),
            });
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PackageInformation;
    use parking_lot::Mutex;

    struct FakeGitClient {
        edges: Mutex<Vec<CommitEdge>>,
        calls: Mutex<usize>,
    }

    impl FakeGitClient {
        fn new(edges: Vec<CommitEdge>) -> Self {
            Self {
                edges: Mutex::new(edges),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl GitClient for FakeGitClient {
        async fn commit_edges(
            &self,
            _repository: &str,
            _commit: &str,
            _limit: usize,
        ) -> anyhow::Result<Vec<CommitEdge>> {
            *self.calls.lock() += 1;
            Ok(self.edges.lock().clone())
        }
    }

    fn commit(c: char) -> String {
        std::iter::repeat(c).take(40).collect()
    }

    fn add_completed_dump(xrepo: &XrepoIndex, repository: &str, commit_hash: &str) -> i64 {
        let (id, _) = xrepo
            .add_packages_and_references(
                repository,
                commit_hash,
                "",
                &[PackageInformation {
                    scheme: "npm".to_string(),
                    name: "widget".to_string(),
                    version: "1.0.0".to_string(),
                }],
                &[],
            )
            .unwrap();
        xrepo.mark_complete(id).unwrap();
        id
    }

    /// A ← B ← C chain (B's parent A, C's parent B).
    fn chain_edges() -> Vec<CommitEdge> {
        vec![
            CommitEdge { commit: commit('b'), parent_commit: commit('a') },
            CommitEdge { commit: commit('c'), parent_commit: commit('b') },
        ]
    }

    fn graph_with_edges(edges: &[CommitEdge]) -> (Arc<XrepoIndex>, CommitGraph) {
        let xrepo = Arc::new(XrepoIndex::in_memory().unwrap());
        xrepo.insert_commit_edges("github.com/acme/widget", edges).unwrap();
        let graph = CommitGraph::new(Arc::clone(&xrepo), Arc::new(FakeGitClient::new(Vec::new())));
        (xrepo, graph)
    }

    #[test]
    fn test_closest_dump_walks_to_ancestor() {
        let repo = "github.com/acme/widget";
        let (xrepo, graph) = graph_with_edges(&chain_edges());
        let id = add_completed_dump(&xrepo, repo, &commit('a'));

        let found = graph.find_closest_dump(repo, &commit('c'), "src/index.ts").unwrap().unwrap();
        assert_eq!(found.id, id);
    }

    #[test]
    fn test_closest_dump_none_without_dumps() {
        let repo = "github.com/acme/widget";
        let (_xrepo, graph) = graph_with_edges(&chain_edges());
        assert!(graph.find_closest_dump(repo, &commit('c'), "src/index.ts").unwrap().is_none());
    }

    #[test]
    fn test_closest_dump_prefers_ancestor_on_tie() {
        let repo = "github.com/acme/widget";
        // B is the parent of C; D is a child of C. Both are distance 1.
        let edges = vec![
            CommitEdge { commit: commit('c'), parent_commit: commit('b') },
            CommitEdge { commit: commit('d'), parent_commit: commit('c') },
        ];
        let (xrepo, graph) = graph_with_edges(&edges);
        let ancestor = add_completed_dump(&xrepo, repo, &commit('b'));
        add_completed_dump(&xrepo, repo, &commit('d'));

        let found = graph.find_closest_dump(repo, &commit('c'), "src/index.ts").unwrap().unwrap();
        assert_eq!(found.id, ancestor);
    }

    #[test]
    fn test_closest_dump_same_distance_prefers_newest() {
        let repo = "github.com/acme/widget";
        // C is a merge of A and B; both parents carry a dump.
        let edges = vec![
            CommitEdge { commit: commit('c'), parent_commit: commit('a') },
            CommitEdge { commit: commit('c'), parent_commit: commit('b') },
        ];
        let (xrepo, graph) = graph_with_edges(&edges);
        let older = add_completed_dump(&xrepo, repo, &commit('a'));
        let newer = add_completed_dump(&xrepo, repo, &commit('b'));
        xrepo.set_dump_created_at(older, 100).unwrap();
        xrepo.set_dump_created_at(newer, 200).unwrap();

        let found = graph.find_closest_dump(repo, &commit('c'), "src/index.ts").unwrap().unwrap();
        assert_eq!(found.id, newer);
    }

    #[test]
    fn test_search_is_bounded() {
        let repo = "github.com/acme/widget";
        // A linear chain far longer than the traversal limit, with the only
        // dump past the end of it.
        let mut edges = Vec::new();
        let hash = |i: usize| format!("{i:040x}");
        for i in 1..(MAX_TRAVERSAL_LIMIT * 2) {
            edges.push(CommitEdge { commit: hash(i), parent_commit: hash(i - 1) });
        }
        let (xrepo, graph) = graph_with_edges(&edges);
        add_completed_dump(&xrepo, repo, &hash(0));

        let found = graph
            .find_closest_dump(repo, &hash(MAX_TRAVERSAL_LIMIT * 2 - 1), "src/index.ts")
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_discovery_merges_edges_and_skips_known_commits() {
        let repo = "github.com/acme/widget";
        let xrepo = Arc::new(XrepoIndex::in_memory().unwrap());
        let git = Arc::new(FakeGitClient::new(chain_edges()));
        let graph = CommitGraph::new(Arc::clone(&xrepo), Arc::clone(&git) as Arc<dyn GitClient>);

        graph.discover_and_update_commit(repo, &commit('c')).await.unwrap();
        assert!(xrepo.has_commit_data(repo, &commit('b')).unwrap());
        assert_eq!(*git.calls.lock(), 1);

        // Second discovery for a known commit does not hit the host again.
        graph.discover_and_update_commit(repo, &commit('c')).await.unwrap();
        assert_eq!(*git.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_discovery_invalidates_memoized_answers() {
        let repo = "github.com/acme/widget";
        let xrepo = Arc::new(XrepoIndex::in_memory().unwrap());
        let git = Arc::new(FakeGitClient::new(chain_edges()));
        let graph = CommitGraph::new(Arc::clone(&xrepo), git);

        // Memoize a miss while the graph is empty.
        assert!(graph.find_closest_dump(repo, &commit('c'), "src/index.ts").unwrap().is_none());

        add_completed_dump(&xrepo, repo, &commit('a'));
        graph.discover_and_update_commit(repo, &commit('c')).await.unwrap();

        let found = graph.find_closest_dump(repo, &commit('c'), "src/index.ts").unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_parse_commit_log() {
        let output = format!(
            "{} {}\n{} {} {}\n{}\n",
            commit('c'),
            commit('b'),
            commit('b'),
            commit('a'),
            commit('9'),
            commit('a'),
        );
        let edges = parse_commit_log(&output);
        assert_eq!(edges.len(), 4);
        assert_eq!(edges[0].commit, commit('c'));
        assert_eq!(edges[0].parent_commit, commit('b'));
        // Merge commit contributes one edge per parent.
        assert_eq!(edges[1].parent_commit, commit('a'));
        assert_eq!(edges[2].parent_commit, commit('9'));
        // Root commit is recorded with an empty parent.
        assert_eq!(edges[3].parent_commit, "");
    }
}

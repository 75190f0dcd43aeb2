//! Core data model shared across the backend.
//!
//! A `Dump` is one converted, queryable index for a specific
//! (repository, commit, root). Dumps export packages and import package
//! references; these link dumps across repositories. Document payloads are
//! the flattened per-file query data produced by conversion.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a dump. A dump's backing database file exists on disk
/// if and only if the dump is `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpState {
    Queued,
    Completed,
    Failed,
}

impl DumpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpState::Queued => "queued",
            DumpState::Completed => "completed",
            DumpState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(DumpState::Queued),
            "completed" => Some(DumpState::Completed),
            "failed" => Some(DumpState::Failed),
            _ => None,
        }
    }
}

/// One converted index for a (repository, commit, root).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dump {
    /// Row id in the xrepo index.
    pub id: i64,
    /// Repository name (e.g. "github.com/acme/widget").
    pub repository: String,
    /// 40-character commit hash.
    pub commit: String,
    /// Path prefix within the repository that this dump covers ("" = whole repo).
    pub root: String,
    pub state: DumpState,
    /// Unix timestamp (seconds) when the dump row was created.
    pub created_at: i64,
}

impl Dump {
    /// Whether `path` falls under this dump's root.
    pub fn covers(&self, path: &str) -> bool {
        self.root.is_empty() || path.starts_with(&self.root)
    }
}

/// A package exported by a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInformation {
    pub scheme: String,
    pub name: String,
    pub version: String,
}

/// A package imported by a dump, used to locate the exporting dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageReference {
    pub scheme: String,
    pub name: String,
    pub version: String,
    /// Identifier filter payload (opaque to the index; used by callers to
    /// prune dumps that cannot contain a given identifier).
    pub filter: Vec<u8>,
}

/// An edge in a repository's commit graph: `commit` has parent `parent_commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEdge {
    pub commit: String,
    pub parent_commit: String,
}

/// A zero-based text position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

/// A zero-based text range, inclusive of start and end positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start_line: u32,
    pub start_character: u32,
    pub end_line: u32,
    pub end_character: u32,
}

impl Range {
    /// Compare this range against a position: `Less` if the range ends before
    /// the position, `Greater` if it starts after, `Equal` if it contains it.
    pub fn compare_position(&self, pos: Position) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        if pos.line > self.end_line || (pos.line == self.end_line && pos.character > self.end_character) {
            return Ordering::Less;
        }
        if pos.line < self.start_line
            || (pos.line == self.start_line && pos.character < self.start_character)
        {
            return Ordering::Greater;
        }
        Ordering::Equal
    }

    pub fn contains(&self, pos: Position) -> bool {
        self.compare_position(pos) == std::cmp::Ordering::Equal
    }
}

/// Moniker kinds, ordered by resolution preference: import monikers are
/// chased to other dumps first, exports are only used to fan out references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonikerKind {
    Import,
    Local,
    Export,
}

/// A symbol identifier linking a use in one dump to its definition in
/// another, possibly in a different repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moniker {
    pub kind: MonikerKind,
    pub scheme: String,
    pub identifier: String,
    /// Attached package, present for monikers that cross dump boundaries.
    pub package: Option<PackageInformation>,
}

/// A location within the dump that owns it (path relative to the dump root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DumpLocation {
    pub path: String,
    pub range: Range,
}

/// A fully qualified location, as returned to API consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub repository: String,
    pub commit: String,
    pub path: String,
    pub range: Range,
}

impl Location {
    pub fn from_dump(dump: &Dump, loc: DumpLocation) -> Self {
        Location {
            repository: dump.repository.clone(),
            commit: dump.commit.clone(),
            path: loc.path,
            range: loc.range,
        }
    }
}

/// Flattened query data for one range of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeData {
    pub range: Range,
    /// Definition locations resolved at conversion time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub definitions: Vec<DumpLocation>,
    /// Reference locations resolved at conversion time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<DumpLocation>,
    /// Rendered hover content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hover: Option<String>,
    /// Monikers attached to this range, import-first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub monikers: Vec<Moniker>,
}

/// The decoded payload of one `documents` row: all ranges of a file,
/// ordered by start position for binary search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentData {
    pub ranges: Vec<RangeData>,
}

impl DocumentData {
    /// Find the innermost-listed range containing `pos` via binary search
    /// over the ordered ranges.
    pub fn find_range(&self, pos: Position) -> Option<&RangeData> {
        use std::cmp::Ordering;

        let mut lo = 0usize;
        let mut hi = self.ranges.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.ranges[mid].range.compare_position(pos) {
                Ordering::Equal => return Some(&self.ranges[mid]),
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
            }
        }
        None
    }
}

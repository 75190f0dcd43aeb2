//! LSIF conversion: gzip JSON-lines graph in, dump database out.
//!
//! The converter streams the uploaded graph once, recording vertices and
//! edges in correlation maps, then resolves each range's definition,
//! reference, hover, and moniker data by chasing `next` chains. The
//! flattened per-document payloads are written through [`DumpConnection`],
//! and the exported/imported package facts are returned to the caller for
//! the cross-repository index.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::dump::{DumpConnection, DumpDbError};
use crate::model::{
    DocumentData, DumpLocation, Moniker, MonikerKind, PackageInformation, PackageReference, Range,
    RangeData,
};

/// Longest `next` chain the resolver will follow before giving up on a
/// range. Real exporters produce chains of length two or three.
const MAX_CHAIN_LENGTH: usize = 64;

/// Errors that can occur converting an uploaded index.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed index at line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid index: {0}")]
    Invalid(String),

    #[error(transparent)]
    Dump(#[from] DumpDbError),
}

/// Package facts extracted while converting, fed to the xrepo index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutput {
    pub packages: Vec<PackageInformation>,
    pub references: Vec<PackageReference>,
    pub document_count: usize,
}

/// Convert a gzip-compressed LSIF payload into a dump database at
/// `output`. The output file is created by this call; on error the caller
/// is responsible for removing it.
pub fn convert_lsif(input: impl Read, output: &Path) -> Result<ConversionOutput, ConvertError> {
    let reader = BufReader::new(GzDecoder::new(input));
    let mut correlator = Correlator::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: Entry =
            serde_json::from_str(&line).map_err(|source| ConvertError::Json { line: index + 1, source })?;
        correlator.insert(entry)?;
    }

    let db = DumpConnection::create(output)?;
    let output = correlator.finalize(&db)?;
    debug!(documents = output.document_count, "conversion finished");
    Ok(output)
}

/// Encode the identifier set imported from one package into the opaque
/// reference filter persisted alongside the dump.
pub fn encode_filter(identifiers: &BTreeSet<String>) -> Vec<u8> {
    serde_json::to_vec(identifiers).unwrap_or_default()
}

/// Whether a reference filter may contain `identifier`. Undecodable
/// filters answer true so a corrupt filter widens the search instead of
/// hiding results.
pub fn filter_may_contain(filter: &[u8], identifier: &str) -> bool {
    match serde_json::from_slice::<BTreeSet<String>>(filter) {
        Ok(set) => set.contains(identifier),
        Err(_) => true,
    }
}

/// LSIF element ids are either numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
enum LsifId {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct LsifPosition {
    line: u32,
    character: u32,
}

/// One JSON line of the input graph. Vertex and edge fields overlap, so a
/// single loose struct is decoded and dispatched on `type` + `label`.
#[derive(Debug, Deserialize)]
struct Entry {
    id: Option<LsifId>,
    #[serde(rename = "type")]
    entry_type: String,
    label: Option<String>,

    // Vertex fields.
    uri: Option<String>,
    start: Option<LsifPosition>,
    end: Option<LsifPosition>,
    kind: Option<String>,
    scheme: Option<String>,
    identifier: Option<String>,
    name: Option<String>,
    version: Option<String>,
    result: Option<serde_json::Value>,
    #[serde(rename = "projectRoot")]
    project_root: Option<String>,

    // Edge fields.
    #[serde(rename = "outV")]
    out_v: Option<LsifId>,
    #[serde(rename = "inV")]
    in_v: Option<LsifId>,
    #[serde(rename = "inVs")]
    in_vs: Option<Vec<LsifId>>,
    document: Option<LsifId>,
}

impl Entry {
    fn require_id(&self) -> Result<LsifId, ConvertError> {
        self.id
            .clone()
            .ok_or_else(|| ConvertError::Invalid("element without id".to_string()))
    }

    fn require_out_v(&self) -> Result<LsifId, ConvertError> {
        self.out_v
            .clone()
            .ok_or_else(|| ConvertError::Invalid("edge without outV".to_string()))
    }

    /// The edge targets, covering both the `inV` and `inVs` encodings.
    fn targets(&mut self) -> Vec<LsifId> {
        match (self.in_v.take(), self.in_vs.take()) {
            (Some(v), _) => vec![v],
            (None, Some(vs)) => vs,
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct RawMoniker {
    kind: MonikerKind,
    scheme: String,
    identifier: String,
}

#[derive(Debug, Clone)]
struct RawPackage {
    name: String,
    version: String,
}

/// Correlation state accumulated over one pass of the input.
#[derive(Default)]
struct Correlator {
    project_root: Option<String>,
    documents: HashMap<LsifId, String>,
    ranges: HashMap<LsifId, Range>,
    /// document id -> contained range ids, from `contains` edges.
    contains: HashMap<LsifId, Vec<LsifId>>,
    /// range/resultSet -> next resultSet.
    next: HashMap<LsifId, LsifId>,
    hovers: HashMap<LsifId, String>,
    /// result id -> (document id, range id) pairs, from `item` edges.
    items: HashMap<LsifId, Vec<(LsifId, LsifId)>>,
    definition_edges: HashMap<LsifId, LsifId>,
    reference_edges: HashMap<LsifId, LsifId>,
    hover_edges: HashMap<LsifId, LsifId>,
    monikers: HashMap<LsifId, RawMoniker>,
    moniker_edges: HashMap<LsifId, Vec<LsifId>>,
    packages: HashMap<LsifId, RawPackage>,
    /// moniker id -> packageInformation id.
    package_edges: HashMap<LsifId, LsifId>,
}

impl Correlator {
    fn insert(&mut self, entry: Entry) -> Result<(), ConvertError> {
        match entry.entry_type.as_str() {
            "vertex" => self.insert_vertex(entry),
            "edge" => self.insert_edge(entry),
            other => Err(ConvertError::Invalid(format!("unknown element type {other:?}"))),
        }
    }

    fn insert_vertex(&mut self, entry: Entry) -> Result<(), ConvertError> {
        match entry.label.as_deref() {
            Some("metaData") => {
                self.project_root = entry.project_root;
            }
            Some("document") => {
                let id = entry.require_id()?;
                let uri = entry
                    .uri
                    .ok_or_else(|| ConvertError::Invalid("document without uri".to_string()))?;
                self.documents.insert(id, uri);
            }
            Some("range") => {
                let id = entry.require_id()?;
                let (start, end) = match (&entry.start, &entry.end) {
                    (Some(s), Some(e)) => (s, e),
                    _ => return Err(ConvertError::Invalid("range without bounds".to_string())),
                };
                self.ranges.insert(
                    id,
                    Range {
                        start_line: start.line,
                        start_character: start.character,
                        end_line: end.line,
                        end_character: end.character,
                    },
                );
            }
            Some("hoverResult") => {
                let id = entry.require_id()?;
                if let Some(text) = entry.result.as_ref().and_then(render_hover) {
                    self.hovers.insert(id, text);
                }
            }
            Some("moniker") => {
                let id = entry.require_id()?;
                let kind = match entry.kind.as_deref() {
                    Some("import") => MonikerKind::Import,
                    Some("export") => MonikerKind::Export,
                    _ => MonikerKind::Local,
                };
                self.monikers.insert(
                    id,
                    RawMoniker {
                        kind,
                        scheme: entry.scheme.unwrap_or_default(),
                        identifier: entry.identifier.unwrap_or_default(),
                    },
                );
            }
            Some("packageInformation") => {
                let id = entry.require_id()?;
                self.packages.insert(
                    id,
                    RawPackage {
                        name: entry.name.unwrap_or_default(),
                        version: entry.version.unwrap_or_default(),
                    },
                );
            }
            // resultSet, definitionResult, referenceResult and the rest
            // carry no payload of their own; edges give them meaning.
            _ => {}
        }
        Ok(())
    }

    fn insert_edge(&mut self, mut entry: Entry) -> Result<(), ConvertError> {
        let out_v = entry.require_out_v()?;
        match entry.label.as_deref() {
            Some("contains") => {
                // Only document-contains-range matters; project-contains-
                // document edges point at documents and are skipped below.
                if self.documents.contains_key(&out_v) {
                    self.contains.entry(out_v).or_default().extend(entry.targets());
                }
            }
            Some("next") => {
                if let Some(target) = entry.targets().into_iter().next() {
                    self.next.insert(out_v, target);
                }
            }
            Some("item") => {
                let document = entry
                    .document
                    .clone()
                    .ok_or_else(|| ConvertError::Invalid("item edge without document".to_string()))?;
                let slot = self.items.entry(out_v).or_default();
                for target in entry.targets() {
                    slot.push((document.clone(), target));
                }
            }
            Some("textDocument/definitions") => {
                if let Some(target) = entry.targets().into_iter().next() {
                    self.definition_edges.insert(out_v, target);
                }
            }
            Some("textDocument/references") => {
                if let Some(target) = entry.targets().into_iter().next() {
                    self.reference_edges.insert(out_v, target);
                }
            }
            Some("textDocument/hover") => {
                if let Some(target) = entry.targets().into_iter().next() {
                    self.hover_edges.insert(out_v, target);
                }
            }
            Some("moniker") => {
                self.moniker_edges.entry(out_v).or_default().extend(entry.targets());
            }
            Some("packageInformation") => {
                if let Some(target) = entry.targets().into_iter().next() {
                    self.package_edges.insert(out_v, target);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Resolve the graph and write the flattened data into `db`.
    fn finalize(self, db: &DumpConnection) -> Result<ConversionOutput, ConvertError> {
        let root = self
            .project_root
            .clone()
            .ok_or_else(|| ConvertError::Invalid("missing metaData vertex".to_string()))?;

        let mut exported: HashSet<(String, String, String)> = HashSet::new();
        let mut imported: HashMap<(String, String, String), BTreeSet<String>> = HashMap::new();
        let mut seen_defs: HashSet<(String, String, DumpLocation)> = HashSet::new();
        let mut document_count = 0;

        for (doc_id, uri) in &self.documents {
            let path = relative_path(&root, uri);
            let Some(range_ids) = self.contains.get(doc_id) else {
                continue;
            };

            let mut ranges = Vec::with_capacity(range_ids.len());
            for range_id in range_ids {
                let Some(range) = self.ranges.get(range_id) else {
                    continue;
                };
                let data = self.resolve_range(range_id, *range);

                for moniker in &data.monikers {
                    let location = DumpLocation { path: path.clone(), range: *range };
                    match moniker.kind {
                        MonikerKind::Export => {
                            // The defs rows point at the symbol's resolved
                            // definition sites; a range without a definition
                            // result stands in for itself. Ranges sharing a
                            // result set would insert duplicates otherwise.
                            let targets = if data.definitions.is_empty() {
                                std::slice::from_ref(&location)
                            } else {
                                data.definitions.as_slice()
                            };
                            for target in targets {
                                let key = (
                                    moniker.scheme.clone(),
                                    moniker.identifier.clone(),
                                    target.clone(),
                                );
                                if seen_defs.insert(key) {
                                    db.insert_def(moniker, target)?;
                                }
                            }
                            if let Some(package) = &moniker.package {
                                exported.insert((
                                    package.scheme.clone(),
                                    package.name.clone(),
                                    package.version.clone(),
                                ));
                            }
                        }
                        MonikerKind::Import => {
                            db.insert_ref(moniker, &location)?;
                            if let Some(package) = &moniker.package {
                                imported
                                    .entry((
                                        package.scheme.clone(),
                                        package.name.clone(),
                                        package.version.clone(),
                                    ))
                                    .or_default()
                                    .insert(moniker.identifier.clone());
                            }
                        }
                        MonikerKind::Local => {}
                    }
                }

                ranges.push(data);
            }

            ranges.sort_by_key(|r| (r.range.start_line, r.range.start_character));
            db.insert_document(&path, &DocumentData { ranges })?;
            document_count += 1;
        }

        let mut packages: Vec<PackageInformation> = exported
            .into_iter()
            .map(|(scheme, name, version)| PackageInformation { scheme, name, version })
            .collect();
        packages.sort_by(|a, b| (&a.scheme, &a.name, &a.version).cmp(&(&b.scheme, &b.name, &b.version)));

        let mut references: Vec<PackageReference> = imported
            .into_iter()
            .map(|((scheme, name, version), identifiers)| PackageReference {
                scheme,
                name,
                version,
                filter: encode_filter(&identifiers),
            })
            .collect();
        references.sort_by(|a, b| (&a.scheme, &a.name, &a.version).cmp(&(&b.scheme, &b.name, &b.version)));

        Ok(ConversionOutput { packages, references, document_count })
    }

    /// Flatten one range by chasing its `next` chain for results and
    /// monikers.
    fn resolve_range(&self, range_id: &LsifId, range: Range) -> RangeData {
        let chain = self.walk_chain(range_id);

        let definitions = chain
            .iter()
            .find_map(|id| self.definition_edges.get(id))
            .map(|result| self.result_locations(result))
            .unwrap_or_default();
        let references = chain
            .iter()
            .find_map(|id| self.reference_edges.get(id))
            .map(|result| self.result_locations(result))
            .unwrap_or_default();
        let hover = chain
            .iter()
            .find_map(|id| self.hover_edges.get(id))
            .and_then(|result| self.hovers.get(result))
            .cloned();

        let mut monikers = Vec::new();
        let mut seen = HashSet::new();
        for id in &chain {
            for moniker_id in self.moniker_edges.get(id).into_iter().flatten() {
                let Some(raw) = self.monikers.get(moniker_id) else {
                    continue;
                };
                if !seen.insert((raw.scheme.clone(), raw.identifier.clone())) {
                    continue;
                }
                let package = self
                    .package_edges
                    .get(moniker_id)
                    .and_then(|pkg_id| self.packages.get(pkg_id))
                    .map(|pkg| PackageInformation {
                        scheme: raw.scheme.clone(),
                        name: pkg.name.clone(),
                        version: pkg.version.clone(),
                    });
                monikers.push(Moniker {
                    kind: raw.kind,
                    scheme: raw.scheme.clone(),
                    identifier: raw.identifier.clone(),
                    package,
                });
            }
        }
        // Imports first so cross-dump resolution tries remote definitions
        // before fanning out exports.
        monikers.sort_by_key(|m| match m.kind {
            MonikerKind::Import => 0,
            MonikerKind::Export => 1,
            MonikerKind::Local => 2,
        });

        RangeData { range, definitions, references, hover, monikers }
    }

    fn walk_chain(&self, start: &LsifId) -> Vec<LsifId> {
        let mut chain = vec![start.clone()];
        let mut seen: HashSet<&LsifId> = HashSet::new();
        seen.insert(start);

        let mut current = start;
        while let Some(next) = self.next.get(current) {
            if chain.len() >= MAX_CHAIN_LENGTH || !seen.insert(next) {
                break;
            }
            chain.push(next.clone());
            current = next;
        }
        chain
    }

    fn result_locations(&self, result: &LsifId) -> Vec<DumpLocation> {
        let Some(items) = self.items.get(result) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|(doc_id, range_id)| {
                let uri = self.documents.get(doc_id)?;
                let range = self.ranges.get(range_id)?;
                let root = self.project_root.as_deref().unwrap_or("");
                Some(DumpLocation { path: relative_path(root, uri), range: *range })
            })
            .collect()
    }
}

/// Strip the project root from a document URI, yielding a repo-relative
/// path.
fn relative_path(root: &str, uri: &str) -> String {
    uri.strip_prefix(root)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(uri)
        .to_string()
}

/// Render an LSIF hover result into displayable text. Contents may be a
/// bare string, a `{language, value}` code block, a `{kind, value}` markup
/// object, or an array of those.
fn render_hover(result: &serde_json::Value) -> Option<String> {
    let contents = result.get("contents")?;
    let mut parts = Vec::new();
    collect_hover_parts(contents, &mut parts);
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n---\n\n"))
    }
}

fn collect_hover_parts(contents: &serde_json::Value, parts: &mut Vec<String>) {
    match contents {
        serde_json::Value::String(s) => {
            if !s.is_empty() {
                parts.push(s.clone());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_hover_parts(item, parts);
            }
        }
        serde_json::Value::Object(obj) => {
            let Some(value) = obj.get("value").and_then(|v| v.as_str()) else {
                return;
            };
            match obj.get("language").and_then(|l| l.as_str()) {
                Some(language) => parts.push(format!("```{language}\n{value}\n```")),
                None => parts.push(value.to_string()),
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Position;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::tempdir;

    /// Gzip a list of JSON lines into an upload payload.
    fn gzip_lines(lines: &[serde_json::Value]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for line in lines {
            writeln!(encoder, "{line}").unwrap();
        }
        encoder.finish().unwrap()
    }

    /// A minimal index: one document with one definition range that hovers,
    /// exports `widget:foo`, and one reference range importing `util:bar`.
    fn sample_index() -> Vec<u8> {
        use serde_json::json;
        gzip_lines(&[
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
            json!({"id": 11, "type": "vertex", "label": "packageInformation", "name": "widget", "version": "1.0.0"}),
            json!({"id": 12, "type": "vertex", "label": "moniker", "kind": "export",
                   "scheme": "npm", "identifier": "widget:foo"}),
            json!({"id": 13, "type": "edge", "label": "packageInformation", "outV": 12, "inV": 11}),
            json!({"id": 14, "type": "edge", "label": "moniker", "outV": 4, "inV": 12}),
            json!({"id": 15, "type": "vertex", "label": "range",
                   "start": {"line": 3, "character": 0}, "end": {"line": 3, "character": 3}}),
            json!({"id": 16, "type": "vertex", "label": "packageInformation", "name": "util", "version": "2.1.0"}),
            json!({"id": 17, "type": "vertex", "label": "moniker", "kind": "import",
                   "scheme": "npm", "identifier": "util:bar"}),
            json!({"id": 18, "type": "edge", "label": "packageInformation", "outV": 17, "inV": 16}),
            json!({"id": 19, "type": "edge", "label": "moniker", "outV": 15, "inV": 17}),
            json!({"id": 20, "type": "edge", "label": "contains", "outV": 2, "inVs": [3, 15]}),
        ])
    }

    #[test]
    fn test_convert_sample_index() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("dump.db");

        let output = convert_lsif(&sample_index()[..], &db_path).unwrap();

        assert_eq!(output.document_count, 1);
        assert_eq!(
            output.packages,
            vec![PackageInformation {
                scheme: "npm".to_string(),
                name: "widget".to_string(),
                version: "1.0.0".to_string(),
            }]
        );
        assert_eq!(output.references.len(), 1);
        assert_eq!(output.references[0].name, "util");
        assert!(filter_may_contain(&output.references[0].filter, "util:bar"));
        assert!(!filter_may_contain(&output.references[0].filter, "util:baz"));

        let db = DumpConnection::open(&db_path).unwrap();
        let (doc, _) = db.get_document("src/index.ts").unwrap().unwrap();
        assert_eq!(doc.ranges.len(), 2);

        let hit = doc.find_range(Position { line: 0, character: 10 }).unwrap();
        assert_eq!(hit.hover.as_deref(), Some("```typescript\nfunction foo(): void\n```"));
        assert_eq!(hit.definitions.len(), 1);
        assert_eq!(hit.definitions[0].path, "src/index.ts");
        assert_eq!(hit.monikers[0].kind, MonikerKind::Export);

        let defs = db.moniker_defs("npm", "widget:foo").unwrap();
        assert_eq!(defs.len(), 1);
        let refs = db.moniker_refs("npm", "util:bar").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].range.start_line, 3);
    }

    #[test]
    fn test_import_monikers_sort_first() {
        use serde_json::json;
        let dir = tempdir().unwrap();
        let payload = gzip_lines(&[
            json!({"id": 1, "type": "vertex", "label": "metaData", "projectRoot": "file:///repo"}),
            json!({"id": 2, "type": "vertex", "label": "document", "uri": "file:///repo/a.ts"}),
            json!({"id": 3, "type": "vertex", "label": "range",
                   "start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}}),
            json!({"id": 4, "type": "vertex", "label": "moniker", "kind": "export",
                   "scheme": "npm", "identifier": "a:x"}),
            json!({"id": 5, "type": "vertex", "label": "moniker", "kind": "import",
                   "scheme": "npm", "identifier": "b:y"}),
            json!({"id": 6, "type": "edge", "label": "moniker", "outV": 3, "inV": 4}),
            json!({"id": 7, "type": "edge", "label": "moniker", "outV": 3, "inV": 5}),
            json!({"id": 8, "type": "edge", "label": "contains", "outV": 2, "inVs": [3]}),
        ]);

        let db_path = dir.path().join("dump.db");
        convert_lsif(&payload[..], &db_path).unwrap();

        let db = DumpConnection::open(&db_path).unwrap();
        let (doc, _) = db.get_document("a.ts").unwrap().unwrap();
        let kinds: Vec<MonikerKind> = doc.ranges[0].monikers.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MonikerKind::Import, MonikerKind::Export]);
    }

    #[test]
    fn test_missing_metadata_is_invalid() {
        use serde_json::json;
        let dir = tempdir().unwrap();
        let payload = gzip_lines(&[
            json!({"id": 1, "type": "vertex", "label": "document", "uri": "file:///repo/a.ts"}),
        ]);

        let err = convert_lsif(&payload[..], &dir.path().join("dump.db")).unwrap_err();
        assert!(matches!(err, ConvertError::Invalid(_)));
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        writeln!(encoder, r#"{{"id": 1, "type": "vertex", "label": "metaData", "projectRoot": "file:///r"}}"#)
            .unwrap();
        writeln!(encoder, "not json").unwrap();
        let payload = encoder.finish().unwrap();

        let dir = tempdir().unwrap();
        let err = convert_lsif(&payload[..], &dir.path().join("dump.db")).unwrap_err();
        match err {
            ConvertError::Json { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hover_rendering_variants() {
        use serde_json::json;
        let rendered = render_hover(&json!({"contents": [
            {"language": "rust", "value": "fn main()"},
            "plain text",
        ]}))
        .unwrap();
        assert_eq!(rendered, "```rust\nfn main()\n```\n\n---\n\nplain text");

        assert!(render_hover(&json!({"contents": []})).is_none());
        assert!(render_hover(&json!({})).is_none());
    }
}

//! The immutable analysis index carried by workspace snapshots.
//!
//! Aggregates per-file [`FileAnalysis`] results and answers the navigation
//! primitives. An index is never mutated after construction; the
//! incremental path clones the per-file map (cheap, the values are `Arc`s)
//! and replaces one entry.

use super::{
    AnalysisError, DiagnosticRecord, FileAnalysis, ReferenceRecord, SourceSpan, SymbolExtractor,
    SymbolKind, SymbolRecord,
};
use crate::protocol::Severity;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Analysis of one document, shared between index generations.
pub type DocumentAnalysis = Arc<FileAnalysis>;

/// A symbol pinned to its document and position in that document's symbol
/// list. Stable for the lifetime of one index generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub file: PathBuf,
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct SemanticIndex {
    files: BTreeMap<PathBuf, DocumentAnalysis>,
}

impl SemanticIndex {
    /// Analyze every handled document. Unhandled documents are skipped.
    pub async fn build(
        extractor: &dyn SymbolExtractor,
        documents: impl IntoIterator<Item = (PathBuf, Arc<str>)>,
        cancel: &CancellationToken,
    ) -> Result<Self, AnalysisError> {
        let mut files = BTreeMap::new();
        for (path, text) in documents {
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            if !extractor.handles(&path) {
                continue;
            }
            let analysis = extractor.extract(&path, &text, cancel).await?;
            files.insert(path, Arc::new(analysis));
        }
        debug!(documents = files.len(), "semantic index built");
        Ok(Self { files })
    }

    /// New index generation with one document re-analyzed. Documents not
    /// already in the index are rejected by the caller (snapshot manager).
    pub async fn with_document(
        &self,
        extractor: &dyn SymbolExtractor,
        path: &Path,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Self, AnalysisError> {
        let analysis = extractor.extract(path, text, cancel).await?;
        let mut files = self.files.clone();
        files.insert(path.to_path_buf(), Arc::new(analysis));
        Ok(Self { files })
    }

    pub fn document_count(&self) -> usize {
        self.files.len()
    }

    pub fn symbol_count(&self) -> usize {
        self.files.values().map(|f| f.symbols.len()).sum()
    }

    pub fn contains_document(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn record(&self, symbol: &ResolvedSymbol) -> Option<&SymbolRecord> {
        self.files.get(&symbol.file)?.symbols.get(symbol.index)
    }

    /// Resolve the symbol at a document position: a declared name under the
    /// cursor wins, otherwise the reference under the cursor is resolved by
    /// name against every declaration in the index.
    pub fn symbol_at(&self, path: &Path, line: u32, column: u32) -> Option<ResolvedSymbol> {
        let analysis = self.files.get(path)?;

        for (index, symbol) in analysis.symbols.iter().enumerate() {
            if symbol.decl.contains(line, column) {
                return Some(ResolvedSymbol {
                    file: path.to_path_buf(),
                    index,
                });
            }
        }

        let reference = analysis
            .references
            .iter()
            .find(|r| r.span.contains(line, column))?;
        self.resolve_reference(path, analysis, reference)
    }

    /// Name-based resolution with containment ranking: same document beats
    /// other documents, a declaration in the reference's own type beats a
    /// stranger, callables win for call sites. First declaration in
    /// document order breaks ties.
    fn resolve_reference(
        &self,
        from: &Path,
        from_analysis: &FileAnalysis,
        reference: &ReferenceRecord,
    ) -> Option<ResolvedSymbol> {
        let enclosing_type = reference
            .enclosing_member
            .and_then(|i| from_analysis.symbols.get(i))
            .and_then(|m| m.containing_type.clone());

        let mut best: Option<(i32, ResolvedSymbol)> = None;
        for (path, analysis) in &self.files {
            for (index, symbol) in analysis.symbols.iter().enumerate() {
                if symbol.name != reference.name {
                    continue;
                }
                let mut score = 0;
                if path == from {
                    score += 4;
                }
                if enclosing_type.is_some() && symbol.containing_type == enclosing_type {
                    score += 2;
                }
                if reference.is_invocation
                    && matches!(symbol.kind, SymbolKind::Method | SymbolKind::Constructor)
                {
                    score += 1;
                }
                let better = match &best {
                    Some((existing, _)) => score > *existing,
                    None => true,
                };
                if better {
                    best = Some((
                        score,
                        ResolvedSymbol {
                            file: path.clone(),
                            index,
                        },
                    ));
                }
            }
        }
        best.map(|(_, symbol)| symbol)
    }

    pub fn definition(&self, symbol: &ResolvedSymbol) -> Option<SourceSpan> {
        self.record(symbol).map(|r| r.decl.clone())
    }

    /// All reference sites sharing the symbol's name, in document order.
    pub fn references(&self, symbol: &ResolvedSymbol) -> Vec<SourceSpan> {
        let Some(record) = self.record(symbol) else {
            return Vec::new();
        };
        let name = record.name.clone();
        self.files
            .values()
            .flat_map(|analysis| analysis.references.iter())
            .filter(|r| r.name == name)
            .map(|r| r.span.clone())
            .collect()
    }

    /// Call sites that invoke the symbol's name.
    pub fn callers(&self, symbol: &ResolvedSymbol) -> Vec<SourceSpan> {
        let Some(record) = self.record(symbol) else {
            return Vec::new();
        };
        let name = record.name.clone();
        self.files
            .values()
            .flat_map(|analysis| analysis.references.iter())
            .filter(|r| r.is_invocation && r.name == name)
            .map(|r| r.span.clone())
            .collect()
    }

    /// Declarations invoked from the symbol's body, first occurrence order,
    /// deduplicated by declaration site.
    pub fn callees(&self, symbol: &ResolvedSymbol) -> Vec<SourceSpan> {
        let Some(analysis) = self.files.get(&symbol.file) else {
            return Vec::new();
        };

        let mut seen: HashSet<(PathBuf, u32, u32)> = HashSet::new();
        let mut out = Vec::new();
        for reference in &analysis.references {
            if reference.enclosing_member != Some(symbol.index) || !reference.is_invocation {
                continue;
            }
            let Some(target) = self.resolve_reference(&symbol.file, analysis, reference) else {
                continue;
            };
            let Some(span) = self.definition(&target) else {
                continue;
            };
            if seen.insert((span.file.clone(), span.line, span.column)) {
                out.push(span);
            }
        }
        out
    }

    /// For a type: every type reaching it through a base list. For a
    /// member: the same-named members of those implementing/deriving types.
    pub fn implementations(&self, symbol: &ResolvedSymbol) -> Vec<ResolvedSymbol> {
        let Some(record) = self.record(symbol) else {
            return Vec::new();
        };

        if record.kind.is_type() {
            return self.derived_types(&record.name);
        }

        if record.kind.is_member() {
            let Some(containing) = record.containing_type.clone() else {
                return Vec::new();
            };
            let name = record.name.clone();
            let mut out = Vec::new();
            for derived in self.derived_types(&containing) {
                let Some(derived_record) = self.record(&derived) else {
                    continue;
                };
                let derived_name = derived_record.name.clone();
                out.extend(self.members_of(&derived_name).into_iter().filter(|m| {
                    self.record(m)
                        .map(|r| r.name == name)
                        .unwrap_or(false)
                }));
            }
            return out;
        }

        Vec::new()
    }

    /// The overridden or interface-declared counterpart of a member, or the
    /// first resolvable base of a type. Breadth-first over the base lists,
    /// so the closest declaration wins.
    pub fn base_definition(&self, symbol: &ResolvedSymbol) -> Option<ResolvedSymbol> {
        let record = self.record(symbol)?;

        if record.kind.is_type() {
            return record
                .base_types
                .iter()
                .find_map(|name| self.find_type(name));
        }

        if !record.kind.is_member() {
            return None;
        }
        let member_name = record.name.clone();
        let containing = record.containing_type.clone()?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let start = self.find_type(&containing)?;
        queue.extend(self.record(&start)?.base_types.iter().cloned());

        while let Some(type_name) = queue.pop_front() {
            if !visited.insert(type_name.clone()) {
                continue;
            }
            let Some(base_type) = self.find_type(&type_name) else {
                continue;
            };
            if let Some(found) = self
                .members_of(&type_name)
                .into_iter()
                .find(|m| self.record(m).map(|r| r.name == member_name).unwrap_or(false))
            {
                return Some(found);
            }
            if let Some(base_record) = self.record(&base_type) {
                queue.extend(base_record.base_types.iter().cloned());
            }
        }
        None
    }

    /// Diagnostics, optionally narrowed to one document. Severities are
    /// filtered by the include flags (errors always pass); counts describe
    /// the returned list.
    pub fn diagnostics(
        &self,
        file: Option<&Path>,
        include_warnings: bool,
        include_info: bool,
    ) -> Vec<DiagnosticRecord> {
        let mut out = Vec::new();
        for (path, analysis) in &self.files {
            if let Some(filter) = file {
                if path != filter {
                    continue;
                }
            }
            for diagnostic in &analysis.diagnostics {
                let keep = match diagnostic.severity {
                    Severity::Error => true,
                    Severity::Warning => include_warnings,
                    Severity::Info => include_info,
                };
                if keep {
                    let mut record = diagnostic.clone();
                    if record.span.is_none() {
                        // Anchor file-level diagnostics so clients can
                        // still attribute them.
                        record.span = Some(SourceSpan {
                            file: path.clone(),
                            line: 1,
                            column: 1,
                            end_line: 1,
                            end_column: 1,
                        });
                    }
                    out.push(record);
                }
            }
        }
        out
    }

    fn find_type(&self, name: &str) -> Option<ResolvedSymbol> {
        for (path, analysis) in &self.files {
            for (index, symbol) in analysis.symbols.iter().enumerate() {
                if symbol.kind.is_type() && symbol.name == name {
                    return Some(ResolvedSymbol {
                        file: path.clone(),
                        index,
                    });
                }
            }
        }
        None
    }

    /// Types whose transitive base lists include `name`.
    fn derived_types(&self, name: &str) -> Vec<ResolvedSymbol> {
        let mut out = Vec::new();
        for (path, analysis) in &self.files {
            for (index, symbol) in analysis.symbols.iter().enumerate() {
                if !symbol.kind.is_type() {
                    continue;
                }
                if self.reaches_base(&symbol.name, name, &mut HashSet::new()) {
                    out.push(ResolvedSymbol {
                        file: path.clone(),
                        index,
                    });
                }
            }
        }
        out
    }

    fn reaches_base(&self, from: &str, target: &str, visited: &mut HashSet<String>) -> bool {
        if !visited.insert(from.to_string()) {
            return false;
        }
        let Some(from_type) = self.find_type(from) else {
            return false;
        };
        let Some(record) = self.record(&from_type) else {
            return false;
        };
        record.base_types.iter().any(|base| {
            base == target || self.reaches_base(base, target, visited)
        })
    }

    fn members_of(&self, type_name: &str) -> Vec<ResolvedSymbol> {
        let mut out = Vec::new();
        for (path, analysis) in &self.files {
            for (index, symbol) in analysis.symbols.iter().enumerate() {
                if symbol.kind.is_member()
                    && symbol.containing_type.as_deref() == Some(type_name)
                {
                    out.push(ResolvedSymbol {
                        file: path.clone(),
                        index,
                    });
                }
            }
        }
        out
    }
}

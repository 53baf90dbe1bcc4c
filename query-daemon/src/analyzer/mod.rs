//! Analyzer adapter: per-file symbol extraction feeding an immutable
//! semantic index.
//!
//! The daemon never talks to an extractor directly; it builds a
//! [`SemanticIndex`] from a document set and answers every query from that
//! index. The index is the opaque `analysis` handle carried by workspace
//! snapshots, so it must stay immutable after construction.

mod csharp;
mod index;

pub use csharp::CSharpExtractor;
pub use index::{DocumentAnalysis, ResolvedSymbol, SemanticIndex};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// One-time global registration.
///
/// Mirrors analyzer ecosystems that require host registration before any
/// analyzer type is touched: [`initialize`] must be called (from a frame
/// that references nothing else in this module tree) before the first
/// index is built, or building fails with [`AnalysisError::NotInitialized`].
static RUNTIME: OnceCell<ExtractorRuntime> = OnceCell::new();

/// Language tables the extractor consults on every token.
#[derive(Debug)]
pub(crate) struct ExtractorRuntime {
    keywords: std::collections::HashSet<&'static str>,
    modifiers: std::collections::HashSet<&'static str>,
}

impl ExtractorRuntime {
    fn new() -> Self {
        Self {
            keywords: csharp::KEYWORDS.iter().copied().collect(),
            modifiers: csharp::MODIFIERS.iter().copied().collect(),
        }
    }

    pub(crate) fn is_keyword(&self, text: &str) -> bool {
        self.keywords.contains(text)
    }

    pub(crate) fn is_modifier(&self, text: &str) -> bool {
        self.modifiers.contains(text)
    }
}

/// Perform the one-time analyzer registration. Idempotent.
pub fn initialize() {
    let _ = RUNTIME.set(ExtractorRuntime::new());
}

pub(crate) fn runtime() -> Result<&'static ExtractorRuntime, AnalysisError> {
    RUNTIME.get().ok_or(AnalysisError::NotInitialized)
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("analyzer used before initialize()")]
    NotInitialized,
    #[error("analysis cancelled")]
    Cancelled,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What a symbol is, as far as navigation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Namespace,
    Class,
    Interface,
    Struct,
    Enum,
    Record,
    Method,
    Constructor,
    Property,
    Field,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Namespace => "namespace",
            SymbolKind::Class => "class",
            SymbolKind::Interface => "interface",
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Record => "record",
            SymbolKind::Method => "method",
            SymbolKind::Constructor => "constructor",
            SymbolKind::Property => "property",
            SymbolKind::Field => "field",
        }
    }

    pub fn is_type(&self) -> bool {
        matches!(
            self,
            SymbolKind::Class | SymbolKind::Interface | SymbolKind::Struct | SymbolKind::Record
        )
    }

    pub fn is_member(&self) -> bool {
        matches!(
            self,
            SymbolKind::Method | SymbolKind::Constructor | SymbolKind::Property | SymbolKind::Field
        )
    }
}

/// A span inside one document. Lines and columns are 1-based; `end_column`
/// is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SourceSpan {
    pub fn contains(&self, line: u32, column: u32) -> bool {
        if line < self.line || line > self.end_line {
            return false;
        }
        if line == self.line && column < self.column {
            return false;
        }
        if line == self.end_line && column >= self.end_column {
            return false;
        }
        true
    }
}

/// A declared entity extracted from one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub name: String,
    pub kind: SymbolKind,
    /// Dotted path: namespace, containing types, then the name.
    pub full_name: String,
    /// Span of the declared name token.
    pub decl: SourceSpan,
    /// Line range of the declaration body, when it has one.
    pub body_lines: Option<(u32, u32)>,
    pub containing_type: Option<String>,
    pub containing_namespace: Option<String>,
    pub signature: Option<String>,
    pub return_type: Option<String>,
    pub accessibility: Option<String>,
    pub modifiers: Vec<String>,
    /// Base-list names for types; empty for members.
    pub base_types: Vec<String>,
    /// `///` comment text immediately above the declaration, if any.
    pub documentation: Option<String>,
}

/// A non-declaration identifier occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub name: String,
    pub span: SourceSpan,
    /// Index into the file's symbol list of the innermost member whose body
    /// contains this reference.
    pub enclosing_member: Option<usize>,
    /// The next significant token is `(`.
    pub is_invocation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub id: String,
    pub severity: crate::protocol::Severity,
    pub message: String,
    pub span: Option<SourceSpan>,
}

/// Everything extracted from one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub symbols: Vec<SymbolRecord>,
    pub references: Vec<ReferenceRecord>,
    pub diagnostics: Vec<DiagnosticRecord>,
}

/// Per-file extraction seam. The shipped implementation is syntactic; a
/// semantic backend replaces it without touching the daemon.
#[async_trait]
pub trait SymbolExtractor: Send + Sync {
    /// Whether this extractor understands the given document.
    fn handles(&self, path: &Path) -> bool;

    /// Extract symbols, references and diagnostics from one document.
    async fn extract(
        &self,
        path: &Path,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<FileAnalysis, AnalysisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent() {
        initialize();
        initialize();
        assert!(runtime().is_ok());
    }

    #[test]
    fn span_containment_is_half_open() {
        let span = SourceSpan {
            file: PathBuf::from("a.cs"),
            line: 3,
            column: 5,
            end_line: 3,
            end_column: 8,
        };
        assert!(span.contains(3, 5));
        assert!(span.contains(3, 7));
        assert!(!span.contains(3, 8));
        assert!(!span.contains(3, 4));
        assert!(!span.contains(2, 6));
    }
}

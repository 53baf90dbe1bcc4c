//! Syntactic extractor for C#-style sources.
//!
//! One pass of tokenization (comment/string aware), one pass of scope
//! tracking over the token stream. Declarations become [`SymbolRecord`]s,
//! every other identifier becomes a [`ReferenceRecord`], and structural
//! problems (unbalanced braces, unterminated comments) become diagnostics.
//! Semantic resolution is out of scope here; the index layer matches
//! references to declarations by name and containment.

use super::{
    runtime, AnalysisError, DiagnosticRecord, FileAnalysis, ReferenceRecord, SourceSpan,
    SymbolExtractor, SymbolKind, SymbolRecord,
};
use crate::protocol::Severity;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub(crate) static KEYWORDS: &[&str] = &[
    "abstract", "as", "base", "bool", "break", "byte", "case", "catch", "char", "checked", "class",
    "const", "continue", "decimal", "default", "delegate", "do", "double", "else", "enum", "event",
    "explicit", "extern", "false", "finally", "fixed", "float", "for", "foreach", "get", "goto",
    "if", "implicit", "in", "int", "interface", "internal", "is", "lock", "long", "namespace",
    "new", "null", "object", "operator", "out", "override", "params", "partial", "private",
    "protected", "public", "readonly", "record", "ref", "return", "sbyte", "sealed", "set",
    "short", "sizeof", "stackalloc", "static", "string", "struct", "switch", "this", "throw",
    "true", "try", "typeof", "uint", "ulong", "unchecked", "unsafe", "ushort", "using", "value",
    "var", "virtual", "void", "volatile", "when", "where", "while", "yield",
];

pub(crate) static MODIFIERS: &[&str] = &[
    "public", "private", "protected", "internal", "static", "sealed", "abstract", "partial",
    "virtual", "override", "async", "readonly", "const", "new", "extern", "unsafe", "volatile",
    "event",
];

const ACCESSIBILITY: &[&str] = &["public", "private", "protected", "internal"];

/// Extractor for `.cs` documents.
#[derive(Debug, Default)]
pub struct CSharpExtractor;

impl CSharpExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SymbolExtractor for CSharpExtractor {
    fn handles(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| e.eq_ignore_ascii_case("cs"))
            .unwrap_or(false)
    }

    async fn extract(
        &self,
        path: &Path,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<FileAnalysis, AnalysisError> {
        let rt = runtime()?;
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        Ok(extract_file(rt, path, text))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokKind {
    Ident,
    Punct,
}

#[derive(Debug, Clone)]
struct Tok {
    kind: TokKind,
    text: String,
    line: u32,
    col: u32,
}

impl Tok {
    fn span(&self, file: &Path) -> SourceSpan {
        SourceSpan {
            file: file.to_path_buf(),
            line: self.line,
            column: self.col,
            end_line: self.line,
            end_column: self.col + self.text.chars().count() as u32,
        }
    }

    fn is_punct(&self, c: char) -> bool {
        self.kind == TokKind::Punct && self.text.len() == 1 && self.text.starts_with(c)
    }
}

struct Tokenized {
    toks: Vec<Tok>,
    /// Doc-comment blocks keyed by the line their last `///` sits on.
    docs: HashMap<u32, String>,
    diagnostics: Vec<DiagnosticRecord>,
    last_line: u32,
}

fn tokenize(file: &Path, text: &str) -> Tokenized {
    let mut toks = Vec::new();
    let mut docs: HashMap<u32, String> = HashMap::new();
    let mut diagnostics = Vec::new();

    let mut chars = text.chars().peekable();
    let mut line: u32 = 1;
    let mut col: u32 = 1;
    let mut doc_acc: Option<(u32, String)> = None;

    macro_rules! bump {
        ($c:expr) => {
            if $c == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        };
    }

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                let start_line = line;
                col += 2;
                let mut body = String::new();
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    body.push(n);
                    chars.next();
                    col += 1;
                }
                if let Some(stripped) = body.strip_prefix('/') {
                    // `///` doc comment; blocks on consecutive lines merge.
                    let text = stripped.trim().to_string();
                    match &mut doc_acc {
                        Some((end, acc)) if *end + 1 == start_line => {
                            acc.push('\n');
                            acc.push_str(&text);
                            *end = start_line;
                        }
                        _ => doc_acc = Some((start_line, text)),
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                col += 2;
                let open_line = line;
                let open_col = col.saturating_sub(2);
                let mut closed = false;
                while let Some(n) = chars.next() {
                    if n == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        col += 2;
                        closed = true;
                        break;
                    }
                    bump!(n);
                }
                if !closed {
                    diagnostics.push(DiagnosticRecord {
                        id: "RQ1003".to_string(),
                        severity: Severity::Warning,
                        message: "unterminated block comment".to_string(),
                        span: Some(SourceSpan {
                            file: file.to_path_buf(),
                            line: open_line,
                            column: open_col,
                            end_line: open_line,
                            end_column: open_col + 2,
                        }),
                    });
                }
            }
            '"' => {
                col += 1;
                // Regular string; escapes are honored, newlines terminate
                // (raw/verbatim newline content is tolerated, not modeled).
                while let Some(n) = chars.next() {
                    bump!(n);
                    match n {
                        '\\' => {
                            if let Some(e) = chars.next() {
                                bump!(e);
                            }
                        }
                        '"' => break,
                        _ => {}
                    }
                }
            }
            '@' if chars.peek() == Some(&'"') => {
                chars.next();
                col += 2;
                while let Some(n) = chars.next() {
                    bump!(n);
                    if n == '"' {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            col += 1;
                        } else {
                            break;
                        }
                    }
                }
            }
            '\'' => {
                col += 1;
                while let Some(n) = chars.next() {
                    bump!(n);
                    match n {
                        '\\' => {
                            if let Some(e) = chars.next() {
                                bump!(e);
                            }
                        }
                        '\'' => break,
                        _ => {}
                    }
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start_col = col;
                let start_line = line;
                let mut ident = String::new();
                ident.push(c);
                col += 1;
                while let Some(&n) = chars.peek() {
                    if n.is_alphanumeric() || n == '_' {
                        ident.push(n);
                        chars.next();
                        col += 1;
                    } else {
                        break;
                    }
                }
                if let Some((end, text)) = doc_acc.take() {
                    docs.insert(end, text);
                }
                toks.push(Tok {
                    kind: TokKind::Ident,
                    text: ident,
                    line: start_line,
                    col: start_col,
                });
            }
            c if c.is_whitespace() => {
                bump!(c);
            }
            c => {
                toks.push(Tok {
                    kind: TokKind::Punct,
                    text: c.to_string(),
                    line,
                    col,
                });
                col += 1;
            }
        }
    }

    if let Some((end, text)) = doc_acc {
        docs.insert(end, text);
    }

    Tokenized {
        toks,
        docs,
        diagnostics,
        last_line: line,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScopeKind {
    Namespace,
    Type,
    Member,
    Block,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    /// Index into the output symbol list, for Type/Member scopes.
    symbol: Option<usize>,
    /// Brace depth just inside this scope's `{`.
    body_depth: u32,
    open_line: u32,
}

struct Extractor<'a> {
    rt: &'static super::ExtractorRuntime,
    file: &'a Path,
    toks: &'a [Tok],
    docs: &'a HashMap<u32, String>,
    pos: usize,
    depth: u32,
    scopes: Vec<Scope>,
    /// File-scoped `namespace X;` if one was seen.
    file_namespace: Option<String>,
    out: FileAnalysis,
}

fn extract_file(rt: &'static super::ExtractorRuntime, file: &Path, text: &str) -> FileAnalysis {
    let tokenized = tokenize(file, text);
    let mut ex = Extractor {
        rt,
        file,
        toks: &tokenized.toks,
        docs: &tokenized.docs,
        pos: 0,
        depth: 0,
        scopes: Vec::new(),
        file_namespace: None,
        out: FileAnalysis {
            diagnostics: tokenized.diagnostics,
            ..Default::default()
        },
    };
    ex.run(tokenized.last_line);
    ex.out
}

impl<'a> Extractor<'a> {
    fn run(&mut self, last_line: u32) {
        while self.pos < self.toks.len() {
            self.statement();
        }

        // Close any body ranges left open by a truncated file.
        for scope in std::mem::take(&mut self.scopes) {
            if let Some(idx) = scope.symbol {
                self.out.symbols[idx].body_lines = Some((scope.open_line, last_line));
            }
        }

        if self.depth > 0 {
            self.out.diagnostics.push(DiagnosticRecord {
                id: "RQ1001".to_string(),
                severity: Severity::Error,
                message: format!("{} unclosed '{{' at end of file", self.depth),
                span: Some(SourceSpan {
                    file: self.file.to_path_buf(),
                    line: last_line,
                    column: 1,
                    end_line: last_line,
                    end_column: 2,
                }),
            });
        }

        if self.out.symbols.is_empty() {
            self.out.diagnostics.push(DiagnosticRecord {
                id: "RQ1004".to_string(),
                severity: Severity::Info,
                message: "no declarations in document".to_string(),
                span: None,
            });
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.toks.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<&'a Tok> {
        let tok = self.toks.get(self.pos)?;
        self.pos += 1;
        Some(tok)
    }

    fn innermost_type(&self) -> Option<usize> {
        self.scopes
            .iter()
            .rev()
            .find(|s| s.kind == ScopeKind::Type)
            .and_then(|s| s.symbol)
    }

    fn innermost_member(&self) -> Option<usize> {
        self.scopes
            .iter()
            .rev()
            .find(|s| s.kind == ScopeKind::Member)
            .and_then(|s| s.symbol)
    }

    fn namespace_path(&self) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(ns) = &self.file_namespace {
            parts.push(ns);
        }
        for scope in &self.scopes {
            if scope.kind == ScopeKind::Namespace {
                if let Some(idx) = scope.symbol {
                    parts.push(&self.out.symbols[idx].name);
                }
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("."))
        }
    }

    fn qualify(&self, name: &str) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(ns) = self.namespace_path() {
            parts.push(ns);
        }
        for scope in &self.scopes {
            if scope.kind == ScopeKind::Type {
                if let Some(idx) = scope.symbol {
                    parts.push(self.out.symbols[idx].name.clone());
                }
            }
        }
        parts.push(name.to_string());
        parts.join(".")
    }

    fn open_brace(&mut self, kind: ScopeKind, symbol: Option<usize>, line: u32) {
        self.depth += 1;
        self.scopes.push(Scope {
            kind,
            symbol,
            body_depth: self.depth,
            open_line: line,
        });
    }

    fn close_brace(&mut self, tok_line: u32, tok: &Tok) {
        if self.depth == 0 {
            self.out.diagnostics.push(DiagnosticRecord {
                id: "RQ1002".to_string(),
                severity: Severity::Error,
                message: "unmatched '}'".to_string(),
                span: Some(tok.span(self.file)),
            });
            return;
        }
        if let Some(scope) = self.scopes.pop() {
            if let Some(idx) = scope.symbol {
                self.out.symbols[idx].body_lines = Some((scope.open_line, tok_line));
            }
        }
        self.depth -= 1;
    }

    /// Consume one statement-ish run of tokens, emitting declarations and
    /// references as they are recognized.
    fn statement(&mut self) {
        let Some(tok) = self.peek() else { return };

        match (&tok.kind, tok.text.as_str()) {
            (TokKind::Punct, "{") => {
                let tok = self.advance().unwrap().clone();
                self.open_brace(ScopeKind::Block, None, tok.line);
            }
            (TokKind::Punct, "}") => {
                let tok = self.advance().unwrap().clone();
                self.close_brace(tok.line, &tok);
            }
            (TokKind::Punct, "[") => {
                // Attribute list: contents are references, not declarations.
                self.advance();
                let mut nest = 1u32;
                while nest > 0 {
                    let Some(tok) = self.advance().map(|t| t.clone()) else {
                        break;
                    };
                    match tok.text.as_str() {
                        "[" => nest += 1,
                        "]" => nest -= 1,
                        _ => {
                            if tok.kind == TokKind::Ident && !self.rt.is_keyword(&tok.text) {
                                self.reference(&tok);
                            }
                        }
                    }
                }
            }
            (TokKind::Ident, "using") => {
                // Using directives carry no navigable declarations.
                self.advance();
                while let Some(tok) = self.peek() {
                    if tok.is_punct(';') {
                        self.advance();
                        break;
                    }
                    self.advance();
                }
            }
            (TokKind::Ident, "namespace") => self.namespace_decl(),
            (TokKind::Ident, _) if self.starts_declaration() => self.type_or_member_decl(),
            (TokKind::Ident, text) => {
                if self.rt.is_keyword(text) {
                    self.advance();
                } else {
                    let tok = self.advance().unwrap().clone();
                    self.reference(&tok);
                }
            }
            (TokKind::Punct, _) => {
                self.advance();
            }
        }
    }

    /// Record a reference for a token the cursor just moved past; call
    /// sites are recognized by the `(` that follows.
    fn reference(&mut self, tok: &Tok) {
        let is_invocation = self
            .toks
            .get(self.pos)
            .map(|n| n.is_punct('('))
            .unwrap_or(false);
        self.reference_with(tok, is_invocation);
    }

    fn reference_with(&mut self, tok: &Tok, is_invocation: bool) {
        let record = ReferenceRecord {
            name: tok.text.clone(),
            span: tok.span(self.file),
            enclosing_member: self.innermost_member(),
            is_invocation,
        };
        self.out.references.push(record);
    }

    fn namespace_decl(&mut self) {
        self.advance(); // `namespace`

        let mut segments: Vec<Tok> = Vec::new();
        while let Some(tok) = self.peek() {
            match (&tok.kind, tok.text.as_str()) {
                (TokKind::Ident, _) => segments.push(self.advance().unwrap().clone()),
                (TokKind::Punct, ".") => {
                    self.advance();
                }
                _ => break,
            }
        }
        if segments.is_empty() {
            return;
        }

        let name = segments
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(".");
        let first = &segments[0];
        let last = &segments[segments.len() - 1];
        let decl = SourceSpan {
            file: self.file.to_path_buf(),
            line: first.line,
            column: first.col,
            end_line: last.line,
            end_column: last.col + last.text.chars().count() as u32,
        };

        let full_name = match self.namespace_path() {
            Some(outer) => format!("{outer}.{name}"),
            None => name.clone(),
        };
        let record = SymbolRecord {
            name,
            kind: SymbolKind::Namespace,
            full_name,
            decl,
            body_lines: None,
            containing_type: None,
            containing_namespace: self.namespace_path(),
            signature: None,
            return_type: None,
            accessibility: None,
            modifiers: Vec::new(),
            base_types: Vec::new(),
            documentation: self.doc_for(first.line),
        };
        self.out.symbols.push(record);
        let idx = self.out.symbols.len() - 1;

        match self.peek() {
            Some(t) if t.is_punct('{') => {
                let line = t.line;
                self.advance();
                self.open_brace(ScopeKind::Namespace, Some(idx), line);
            }
            Some(t) if t.is_punct(';') => {
                self.advance();
                self.file_namespace = Some(self.out.symbols[idx].name.clone());
            }
            _ => {}
        }
    }

    /// True when the cursor sits on modifiers followed by a declaration the
    /// extractor understands (type keyword, or a member inside a type body).
    fn starts_declaration(&self) -> bool {
        let mut offset = 0;
        while let Some(tok) = self.peek_at(offset) {
            if tok.kind == TokKind::Ident && self.rt.is_modifier(&tok.text) {
                offset += 1;
            } else {
                break;
            }
        }
        let Some(tok) = self.peek_at(offset) else {
            return false;
        };
        if tok.kind == TokKind::Ident && is_type_keyword(&tok.text) {
            return true;
        }

        // Members only appear directly inside a type body.
        let at_type_body = self
            .scopes
            .last()
            .map(|s| s.kind == ScopeKind::Type && s.body_depth == self.depth)
            .unwrap_or(false);
        if !at_type_body {
            return false;
        }

        // A member declaration needs a head shaped like `T name (`, `T name
        // {`, `T name =`, `T name ;` or `Ctor (` before any statement-level
        // punctuation. The type position may be qualified or generic.
        let mut idents: u32 = 0;
        let mut scan = offset;
        loop {
            let Some(tok) = self.peek_at(scan) else {
                return false;
            };
            match (&tok.kind, tok.text.as_str()) {
                (TokKind::Ident, t) if !self.rt.is_keyword(t) || is_builtin_type(t) => {
                    idents += 1;
                    scan += 1;
                }
                (TokKind::Punct, "." | "<" | ">" | "," | "?" | "[" | "]") => scan += 1,
                (TokKind::Punct, "(") => return idents >= 1,
                (TokKind::Punct, "{" | "=" | ";") => return idents >= 2,
                _ => return false,
            }
        }
    }

    fn type_or_member_decl(&mut self) {
        let mut modifiers: Vec<String> = Vec::new();
        let doc_line = self.peek().map(|t| t.line).unwrap_or(1);

        while let Some(tok) = self.peek() {
            if tok.kind == TokKind::Ident && self.rt.is_modifier(&tok.text) {
                modifiers.push(self.advance().unwrap().text.clone());
            } else {
                break;
            }
        }

        match self.peek() {
            Some(tok) if tok.kind == TokKind::Ident && is_type_keyword(&tok.text) => {
                self.type_decl(modifiers, doc_line)
            }
            Some(_) => self.member_decl(modifiers, doc_line),
            None => {}
        }
    }

    fn type_decl(&mut self, modifiers: Vec<String>, doc_line: u32) {
        let keyword = self.advance().unwrap().clone();
        let kind = match keyword.text.as_str() {
            "class" => SymbolKind::Class,
            "interface" => SymbolKind::Interface,
            "struct" => SymbolKind::Struct,
            "enum" => SymbolKind::Enum,
            _ => SymbolKind::Record,
        };

        let Some(name_tok) = self.peek().filter(|t| t.kind == TokKind::Ident).cloned() else {
            return;
        };
        self.advance();
        self.skip_generic_params();

        // Base list: names between `:` and the body, stopping at `where`.
        let mut base_types = Vec::new();
        if self.peek().map(|t| t.is_punct(':')).unwrap_or(false) {
            self.advance();
            let mut last_ident: Option<String> = None;
            loop {
                match self.peek() {
                    Some(t) if t.is_punct('{') || t.is_punct(';') => break,
                    Some(t) if t.kind == TokKind::Ident && t.text == "where" => break,
                    Some(t) if t.kind == TokKind::Ident => {
                        last_ident = Some(t.text.clone());
                        let tok = self.advance().unwrap().clone();
                        self.reference(&tok);
                        if self
                            .peek()
                            .map(|n| n.is_punct(',') || n.is_punct('{'))
                            .unwrap_or(true)
                        {
                            if let Some(name) = last_ident.take() {
                                base_types.push(name);
                            }
                        }
                    }
                    Some(t) if t.is_punct('<') => {
                        self.skip_generic_params();
                    }
                    Some(_) => {
                        self.advance();
                    }
                    None => break,
                }
            }
            if let Some(name) = last_ident {
                if !base_types.contains(&name) {
                    base_types.push(name);
                }
            }
        }
        while let Some(t) = self.peek() {
            if t.is_punct('{') || t.is_punct(';') {
                break;
            }
            self.advance();
        }

        let accessibility = pick_accessibility(&modifiers);
        let record = SymbolRecord {
            name: name_tok.text.clone(),
            kind,
            full_name: self.qualify(&name_tok.text),
            decl: name_tok.span(self.file),
            body_lines: None,
            containing_type: self.innermost_type().map(|i| self.out.symbols[i].name.clone()),
            containing_namespace: self.namespace_path(),
            signature: None,
            return_type: None,
            accessibility,
            modifiers,
            base_types,
            documentation: self.doc_for(doc_line),
        };
        self.out.symbols.push(record);
        let idx = self.out.symbols.len() - 1;

        match self.peek() {
            Some(t) if t.is_punct('{') => {
                let line = t.line;
                self.advance();
                self.open_brace(ScopeKind::Type, Some(idx), line);
                if kind == SymbolKind::Enum {
                    self.enum_body(idx);
                }
            }
            Some(t) if t.is_punct(';') => {
                self.advance();
            }
            _ => {}
        }
    }

    /// Enum bodies are flat: `Name, Name = expr, ...`.
    fn enum_body(&mut self, enum_idx: usize) {
        loop {
            match self.peek() {
                None => return,
                Some(t) if t.is_punct('}') => {
                    let tok = self.advance().unwrap().clone();
                    self.close_brace(tok.line, &tok);
                    return;
                }
                Some(t) if t.kind == TokKind::Ident && !self.rt.is_keyword(&t.text) => {
                    let name_tok = self.advance().unwrap().clone();
                    let enum_name = self.out.symbols[enum_idx].name.clone();
                    let record = SymbolRecord {
                        name: name_tok.text.clone(),
                        kind: SymbolKind::Field,
                        full_name: format!(
                            "{}.{}",
                            self.out.symbols[enum_idx].full_name, name_tok.text
                        ),
                        decl: name_tok.span(self.file),
                        body_lines: None,
                        containing_type: Some(enum_name),
                        containing_namespace: self.namespace_path(),
                        signature: None,
                        return_type: None,
                        accessibility: Some("public".to_string()),
                        modifiers: vec!["const".to_string()],
                        base_types: Vec::new(),
                        documentation: self.doc_for(name_tok.line),
                    };
                    self.out.symbols.push(record);
                    // Skip an optional `= expr` up to `,` or `}`.
                    while let Some(t) = self.peek() {
                        if t.is_punct(',') {
                            self.advance();
                            break;
                        }
                        if t.is_punct('}') {
                            break;
                        }
                        self.advance();
                    }
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
    }

    fn member_decl(&mut self, modifiers: Vec<String>, doc_line: u32) {
        // Head: everything up to `(`, `{`, `=`, or `;`. The last identifier
        // before the stop token is the member name; what precedes it is the
        // type.
        let mut head: Vec<Tok> = Vec::new();
        let stop = loop {
            match self.peek() {
                None => return,
                Some(t)
                    if t.is_punct('(')
                        || t.is_punct('{')
                        || t.is_punct('=')
                        || t.is_punct(';') =>
                {
                    break t.clone();
                }
                Some(t) if t.is_punct('<') => {
                    self.skip_generic_params();
                }
                Some(_) => head.push(self.advance().unwrap().clone()),
            }
        };

        let Some(name_pos) = head.iter().rposition(|t| t.kind == TokKind::Ident) else {
            self.advance();
            return;
        };
        let name_tok = head[name_pos].clone();
        let return_type = render_type(&head[..name_pos]);

        // Type-name occurrences in the head are references, never calls.
        for tok in &head[..name_pos] {
            if tok.kind == TokKind::Ident && !self.rt.is_keyword(&tok.text) {
                self.reference_with(tok, false);
            }
        }

        let containing_type = self.innermost_type().map(|i| self.out.symbols[i].name.clone());
        let accessibility = pick_accessibility(&modifiers);

        if stop.is_punct('(') {
            let is_ctor = return_type.is_none()
                && containing_type.as_deref() == Some(name_tok.text.as_str());
            let params = self.consume_params();
            let signature = format!("{}({})", name_tok.text, params);

            let record = SymbolRecord {
                name: name_tok.text.clone(),
                kind: if is_ctor {
                    SymbolKind::Constructor
                } else {
                    SymbolKind::Method
                },
                full_name: self.qualify(&name_tok.text),
                decl: name_tok.span(self.file),
                body_lines: None,
                containing_type,
                containing_namespace: self.namespace_path(),
                signature: Some(signature),
                return_type,
                accessibility,
                modifiers,
                base_types: Vec::new(),
                documentation: self.doc_for(doc_line),
            };
            self.out.symbols.push(record);
            let idx = self.out.symbols.len() - 1;
            self.member_body(idx);
        } else if stop.is_punct('{') {
            let record = SymbolRecord {
                name: name_tok.text.clone(),
                kind: SymbolKind::Property,
                full_name: self.qualify(&name_tok.text),
                decl: name_tok.span(self.file),
                body_lines: None,
                containing_type,
                containing_namespace: self.namespace_path(),
                signature: None,
                return_type,
                accessibility,
                modifiers,
                base_types: Vec::new(),
                documentation: self.doc_for(doc_line),
            };
            self.out.symbols.push(record);
            let idx = self.out.symbols.len() - 1;
            let line = stop.line;
            self.advance();
            self.open_brace(ScopeKind::Member, Some(idx), line);
        } else {
            // `=` or `;`: a field. The initializer is scanned as ordinary
            // statement tokens so its identifiers become references.
            let record = SymbolRecord {
                name: name_tok.text.clone(),
                kind: SymbolKind::Field,
                full_name: self.qualify(&name_tok.text),
                decl: name_tok.span(self.file),
                body_lines: None,
                containing_type,
                containing_namespace: self.namespace_path(),
                signature: None,
                return_type,
                accessibility,
                modifiers,
                base_types: Vec::new(),
                documentation: self.doc_for(doc_line),
            };
            self.out.symbols.push(record);
            if stop.is_punct(';') {
                self.advance();
            }
        }
    }

    /// After a method's `(`: consume the parameter list, then its body
    /// (block, expression body, or `;`).
    fn consume_params(&mut self) -> String {
        self.advance(); // `(`
        let mut nest = 1u32;
        let mut rendered = String::new();
        while nest > 0 {
            let Some(tok) = self.advance().map(|t| t.clone()) else {
                break;
            };
            match tok.text.as_str() {
                "(" => nest += 1,
                ")" => {
                    nest -= 1;
                    if nest == 0 {
                        break;
                    }
                }
                _ => {}
            }
            if tok.kind == TokKind::Ident && !self.rt.is_keyword(&tok.text) {
                self.reference(&tok);
            }
            if !rendered.is_empty() && tok.kind == TokKind::Ident {
                rendered.push(' ');
            }
            rendered.push_str(&tok.text);
        }
        rendered
    }

    fn member_body(&mut self, idx: usize) {
        match self.peek() {
            Some(t) if t.is_punct('{') => {
                let line = t.line;
                self.advance();
                self.open_brace(ScopeKind::Member, Some(idx), line);
            }
            Some(t) if t.is_punct('=') => {
                // `=> expr;` expression body.
                let line = t.line;
                self.advance();
                if self.peek().map(|t| t.is_punct('>')).unwrap_or(false) {
                    self.advance();
                    let mut end_line = line;
                    // Scope the expression so its references attach to the
                    // member; closed at `;`.
                    self.scopes.push(Scope {
                        kind: ScopeKind::Member,
                        symbol: Some(idx),
                        body_depth: self.depth,
                        open_line: line,
                    });
                    while let Some(t) = self.peek() {
                        if t.is_punct(';') {
                            end_line = t.line;
                            self.advance();
                            break;
                        }
                        self.statement_token_in_expression();
                    }
                    self.scopes.pop();
                    self.out.symbols[idx].body_lines = Some((line, end_line));
                }
            }
            Some(t) if t.is_punct(';') => {
                self.advance();
            }
            _ => {}
        }
    }

    fn statement_token_in_expression(&mut self) {
        match self.peek() {
            Some(t) if t.kind == TokKind::Ident && !self.rt.is_keyword(&t.text) => {
                let tok = self.advance().unwrap().clone();
                self.reference(&tok);
            }
            Some(_) => {
                self.advance();
            }
            None => {}
        }
    }

    fn skip_generic_params(&mut self) {
        if !self.peek().map(|t| t.is_punct('<')).unwrap_or(false) {
            return;
        }
        self.advance();
        let mut nest = 1u32;
        while nest > 0 {
            let Some(tok) = self.advance() else { break };
            match tok.text.as_str() {
                "<" => nest += 1,
                ">" => nest -= 1,
                _ => {}
            }
        }
    }

    fn doc_for(&self, decl_line: u32) -> Option<String> {
        decl_line
            .checked_sub(1)
            .and_then(|prev| self.docs.get(&prev))
            .cloned()
    }
}

fn is_type_keyword(text: &str) -> bool {
    matches!(text, "class" | "interface" | "struct" | "enum" | "record")
}

fn is_builtin_type(text: &str) -> bool {
    matches!(
        text,
        "bool"
            | "byte"
            | "sbyte"
            | "char"
            | "decimal"
            | "double"
            | "float"
            | "int"
            | "uint"
            | "long"
            | "ulong"
            | "short"
            | "ushort"
            | "object"
            | "string"
            | "void"
            | "var"
    )
}

fn pick_accessibility(modifiers: &[String]) -> Option<String> {
    let found: Vec<&str> = modifiers
        .iter()
        .map(|m| m.as_str())
        .filter(|m| ACCESSIBILITY.contains(m))
        .collect();
    if found.is_empty() {
        None
    } else {
        Some(found.join(" "))
    }
}

fn render_type(toks: &[Tok]) -> Option<String> {
    let rendered: String = toks
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join("");
    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::initialize;

    async fn extract(text: &str) -> FileAnalysis {
        initialize();
        CSharpExtractor::new()
            .extract(Path::new("T.cs"), text, &CancellationToken::new())
            .await
            .unwrap()
    }

    fn find<'a>(analysis: &'a FileAnalysis, name: &str) -> &'a SymbolRecord {
        analysis
            .symbols
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("symbol {name} not extracted"))
    }

    #[tokio::test]
    async fn extracts_namespace_type_and_members() {
        let analysis = extract(
            "namespace N {\n  public class C {\n    private int count;\n    public int Count { get { return count; } }\n    public void M() { }\n  }\n}\n",
        )
        .await;

        assert_eq!(find(&analysis, "N").kind, SymbolKind::Namespace);
        let class = find(&analysis, "C");
        assert_eq!(class.kind, SymbolKind::Class);
        assert_eq!(class.full_name, "N.C");
        assert_eq!(class.accessibility.as_deref(), Some("public"));

        let field = find(&analysis, "count");
        assert_eq!(field.kind, SymbolKind::Field);
        assert_eq!(field.containing_type.as_deref(), Some("C"));

        let property = find(&analysis, "Count");
        assert_eq!(property.kind, SymbolKind::Property);
        assert_eq!(property.return_type.as_deref(), Some("int"));

        let method = find(&analysis, "M");
        assert_eq!(method.kind, SymbolKind::Method);
        assert_eq!(method.full_name, "N.C.M");
        assert_eq!(method.return_type.as_deref(), Some("void"));
        assert!(method.body_lines.is_some());
    }

    #[tokio::test]
    async fn single_line_class_gets_exact_columns() {
        let src = "namespace N { class C { public void M(){} public void X(){ M(); } } }";
        let analysis = extract(src).await;

        let m = find(&analysis, "M");
        let expected_col = src.find("void M").unwrap() as u32 + 6;
        assert_eq!(m.decl.line, 1);
        assert_eq!(m.decl.column, expected_col);

        // The call inside X is a reference, attributed to X's body.
        let call = analysis
            .references
            .iter()
            .find(|r| r.name == "M" && r.is_invocation)
            .expect("call site extracted");
        let x_idx = analysis.symbols.iter().position(|s| s.name == "X").unwrap();
        assert_eq!(call.enclosing_member, Some(x_idx));
    }

    #[tokio::test]
    async fn base_list_is_captured() {
        let analysis = extract(
            "interface IShape { void Draw(); }\nclass Circle : IShape { public void Draw() { } }\n",
        )
        .await;

        let circle = find(&analysis, "Circle");
        assert_eq!(circle.base_types, vec!["IShape".to_string()]);

        // Interface methods without bodies are still symbols.
        let draws: Vec<_> = analysis.symbols.iter().filter(|s| s.name == "Draw").collect();
        assert_eq!(draws.len(), 2);
    }

    #[tokio::test]
    async fn constructor_is_distinguished_from_method() {
        let analysis = extract("class C { public C() { } public void C2() { } }").await;
        let ctor = analysis
            .symbols
            .iter()
            .find(|s| s.kind == SymbolKind::Constructor)
            .unwrap();
        assert_eq!(ctor.name, "C");
    }

    #[tokio::test]
    async fn enum_members_are_fields() {
        let analysis = extract("enum Color { Red, Green = 2, Blue }").await;
        let names: Vec<_> = analysis
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Field)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["Red", "Green", "Blue"]);
        assert_eq!(find(&analysis, "Red").full_name, "Color.Red");
    }

    #[tokio::test]
    async fn comments_and_strings_hide_tokens() {
        let analysis = extract(
            "class C {\n  // class NotReal {\n  /* void Ghost() {} */\n  string s = \"class InString {\";\n}\n",
        )
        .await;
        assert!(analysis.symbols.iter().all(|s| s.name != "NotReal"));
        assert!(analysis.symbols.iter().all(|s| s.name != "Ghost"));
        assert!(analysis.symbols.iter().all(|s| s.name != "InString"));
    }

    #[tokio::test]
    async fn doc_comment_attaches_to_declaration() {
        let analysis =
            extract("class C {\n  /// Adds one.\n  /// Really.\n  public int Inc(int x) { return x; }\n}\n").await;
        let inc = find(&analysis, "Inc");
        assert_eq!(inc.documentation.as_deref(), Some("Adds one.\nReally."));
    }

    #[tokio::test]
    async fn unbalanced_braces_produce_error_diagnostic() {
        let analysis = extract("class C { void M() {\n").await;
        assert!(analysis
            .diagnostics
            .iter()
            .any(|d| d.id == "RQ1001" && d.severity == Severity::Error));

        let analysis = extract("class C { }\n}\n").await;
        assert!(analysis.diagnostics.iter().any(|d| d.id == "RQ1002"));
    }

    #[tokio::test]
    async fn whitespace_only_file_has_no_symbols() {
        let analysis = extract("   \n\t\n").await;
        assert!(analysis.symbols.is_empty());
        assert!(analysis.references.is_empty());
        assert!(analysis
            .diagnostics
            .iter()
            .any(|d| d.severity == Severity::Info));
    }

    #[tokio::test]
    async fn file_scoped_namespace_qualifies_following_types() {
        let analysis = extract("namespace App.Core;\n\npublic class Service { }\n").await;
        assert_eq!(find(&analysis, "Service").full_name, "App.Core.Service");
    }

    #[tokio::test]
    async fn cancelled_token_aborts_extraction() {
        initialize();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = CSharpExtractor::new()
            .extract(Path::new("T.cs"), "class C {}", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
    }
}

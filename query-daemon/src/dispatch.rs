//! Method dispatch: decode params, read a snapshot, call the analysis
//! primitives, shape the envelope.
//!
//! Protocol faults become JSON-RPC errors; query outcomes (missing
//! document, no symbol under the cursor) are successful responses with
//! `success:false` so clients can tell "the daemon broke" from "there is
//! nothing here".

use crate::protocol::{
    DefinitionResult, DiagnosticInfo, DiagnosticsParams, DiagnosticsResult, Location,
    LocationsResult, PingResult, PositionParams, QueryErrorCode, QueryFailure, ReferencesParams,
    RpcRequest, RpcResponse, Severity, ShutdownResult, StatusResult, SymbolDescriptor,
    SymbolResult, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION,
    METHOD_NOT_FOUND,
};
use crate::analyzer::{ResolvedSymbol, SourceSpan};
use crate::snapshot::{SnapshotManager, WorkspaceSnapshot};
use crate::watchdog::ActivityTracker;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a method handler may need, assembled by the supervisor.
pub struct DispatchContext {
    pub snapshots: Arc<SnapshotManager>,
    pub activity: Arc<ActivityTracker>,
    pub idle_timeout: Duration,
    pub workspace: PathBuf,
    pub socket_path: String,
    pub pid_file_path: PathBuf,
}

pub struct Dispatcher {
    ctx: DispatchContext,
}

/// A response, plus whether the connection handler should trigger daemon
/// shutdown after flushing it.
pub struct DispatchOutcome {
    pub response: RpcResponse,
    pub shutdown: bool,
}

impl DispatchOutcome {
    fn reply(response: RpcResponse) -> Self {
        Self {
            response,
            shutdown: false,
        }
    }
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext) -> Self {
        Self { ctx }
    }

    pub async fn dispatch(&self, request: RpcRequest, cancel: &CancellationToken) -> DispatchOutcome {
        if request.jsonrpc != JSONRPC_VERSION {
            return DispatchOutcome::reply(RpcResponse::failure(
                request.id,
                INVALID_REQUEST,
                format!("unsupported jsonrpc version {:?}", request.jsonrpc),
            ));
        }

        if cancel.is_cancelled() {
            return DispatchOutcome::reply(RpcResponse::failure(
                request.id,
                INTERNAL_ERROR,
                "daemon is shutting down",
            ));
        }

        let id = request.id.clone();
        let method = request.method.clone();
        debug!(%id, %method, "dispatching request");

        let result = match method.as_str() {
            "definition" => self.definition(request.params, false).await,
            "base-definition" => self.definition(request.params, true).await,
            "implementations" => self.implementations(request.params).await,
            "references" => self.references(request.params).await,
            "callers" => self.callers(request.params).await,
            "callees" => self.callees(request.params).await,
            "symbol" => self.symbol(request.params).await,
            "diagnostics" => self.diagnostics(request.params).await,
            "ping" => self.ping(),
            "status" => self.status(),
            "shutdown" => {
                let result = serde_json::to_value(ShutdownResult {
                    status: "shutting_down".to_string(),
                })
                .unwrap_or(Value::Null);
                return DispatchOutcome {
                    response: RpcResponse::success(id, result),
                    shutdown: true,
                };
            }
            _ => {
                return DispatchOutcome::reply(RpcResponse::failure(
                    id,
                    METHOD_NOT_FOUND,
                    format!("unknown method {method:?}"),
                ));
            }
        };

        let response = match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(MethodError::InvalidParams(message)) => {
                RpcResponse::failure(id, INVALID_PARAMS, message)
            }
            Err(MethodError::Internal(message)) => {
                warn!(%method, %message, "request failed");
                RpcResponse::failure(id, INTERNAL_ERROR, message)
            }
        };
        DispatchOutcome::reply(response)
    }

    // -- shared plumbing ---------------------------------------------------

    fn decode<T: DeserializeOwned>(params: Option<Value>) -> Result<T, MethodError> {
        let value = params.unwrap_or_else(|| json!({}));
        serde_json::from_value(value)
            .map_err(|e| MethodError::InvalidParams(format!("invalid params: {e}")))
    }

    /// Resolve a position to a symbol, or produce the appropriate
    /// `success:false` envelope.
    fn locate(
        &self,
        params: &PositionParams,
    ) -> Result<(Arc<WorkspaceSnapshot>, PathBuf, ResolvedSymbol), Value> {
        let snapshot = self.ctx.snapshots.current();

        let Some(document) = snapshot.resolve_document(&params.file) else {
            return Err(failure(
                QueryErrorCode::DocumentNotFound,
                format!("document not in workspace: {}", params.file),
            ));
        };

        let Some(symbol) = snapshot
            .analysis()
            .symbol_at(&document, params.line, params.column)
        else {
            return Err(failure(
                QueryErrorCode::SymbolNotFound,
                format!(
                    "no symbol at {}:{}:{}",
                    params.file, params.line, params.column
                ),
            ));
        };

        Ok((snapshot, document, symbol))
    }

    // -- methods -----------------------------------------------------------

    async fn definition(&self, params: Option<Value>, base: bool) -> Result<Value, MethodError> {
        let params: PositionParams = Self::decode(params)?;
        let (snapshot, _, symbol) = match self.locate(&params) {
            Ok(found) => found,
            Err(envelope) => return Ok(envelope),
        };

        let target = if base {
            match snapshot.analysis().base_definition(&symbol) {
                Some(base_symbol) => base_symbol,
                None => {
                    return Ok(failure(
                        QueryErrorCode::SymbolNotFound,
                        "symbol overrides nothing and implements no interface member",
                    ));
                }
            }
        } else {
            symbol
        };

        let record = snapshot.analysis().record(&target).cloned();
        let Some(record) = record else {
            return Err(MethodError::Internal("resolved symbol vanished".into()));
        };
        to_value(DefinitionResult {
            success: true,
            location: Some(render_span(snapshot.root(), &record.decl)),
            symbol_name: Some(record.name),
            symbol_kind: Some(record.kind.as_str().to_string()),
        })
    }

    async fn implementations(&self, params: Option<Value>) -> Result<Value, MethodError> {
        let params: PositionParams = Self::decode(params)?;
        let (snapshot, _, symbol) = match self.locate(&params) {
            Ok(found) => found,
            Err(envelope) => return Ok(envelope),
        };

        let analysis = snapshot.analysis();
        let name = analysis
            .record(&symbol)
            .map(|r| r.name.clone())
            .unwrap_or_default();
        let locations = analysis
            .implementations(&symbol)
            .iter()
            .filter_map(|s| analysis.definition(s))
            .map(|span| render_span(snapshot.root(), &span))
            .collect();

        to_value(LocationsResult {
            success: true,
            symbol_name: name,
            locations,
        })
    }

    async fn references(&self, params: Option<Value>) -> Result<Value, MethodError> {
        let params: ReferencesParams = Self::decode(params)?;
        let position = PositionParams {
            file: params.file.clone(),
            line: params.line,
            column: params.column,
        };
        let (snapshot, _, symbol) = match self.locate(&position) {
            Ok(found) => found,
            Err(envelope) => return Ok(envelope),
        };

        let analysis = snapshot.analysis();
        let name = analysis
            .record(&symbol)
            .map(|r| r.name.clone())
            .unwrap_or_default();

        let mut spans: Vec<SourceSpan> = Vec::new();
        if params.include_definition {
            spans.extend(analysis.definition(&symbol));
        }
        spans.extend(analysis.references(&symbol));

        to_value(LocationsResult {
            success: true,
            symbol_name: name,
            locations: spans
                .iter()
                .map(|span| render_span(snapshot.root(), span))
                .collect(),
        })
    }

    async fn callers(&self, params: Option<Value>) -> Result<Value, MethodError> {
        let params: PositionParams = Self::decode(params)?;
        let (snapshot, _, symbol) = match self.locate(&params) {
            Ok(found) => found,
            Err(envelope) => return Ok(envelope),
        };

        let analysis = snapshot.analysis();
        to_value(LocationsResult {
            success: true,
            symbol_name: analysis
                .record(&symbol)
                .map(|r| r.name.clone())
                .unwrap_or_default(),
            locations: analysis
                .callers(&symbol)
                .iter()
                .map(|span| render_span(snapshot.root(), span))
                .collect(),
        })
    }

    async fn callees(&self, params: Option<Value>) -> Result<Value, MethodError> {
        let params: PositionParams = Self::decode(params)?;
        let (snapshot, _, symbol) = match self.locate(&params) {
            Ok(found) => found,
            Err(envelope) => return Ok(envelope),
        };

        let analysis = snapshot.analysis();
        to_value(LocationsResult {
            success: true,
            symbol_name: analysis
                .record(&symbol)
                .map(|r| r.name.clone())
                .unwrap_or_default(),
            // Already deduplicated by declaration site, first call wins.
            locations: analysis
                .callees(&symbol)
                .iter()
                .map(|span| render_span(snapshot.root(), span))
                .collect(),
        })
    }

    async fn symbol(&self, params: Option<Value>) -> Result<Value, MethodError> {
        let params: PositionParams = Self::decode(params)?;
        let (snapshot, _, symbol) = match self.locate(&params) {
            Ok(found) => found,
            Err(envelope) => return Ok(envelope),
        };

        let Some(record) = snapshot.analysis().record(&symbol).cloned() else {
            return Err(MethodError::Internal("resolved symbol vanished".into()));
        };
        to_value(SymbolResult {
            success: true,
            symbol: SymbolDescriptor {
                name: record.name,
                kind: record.kind.as_str().to_string(),
                full_name: record.full_name,
                signature: record.signature,
                documentation: record.documentation,
                containing_type: record.containing_type,
                containing_namespace: record.containing_namespace,
                return_type: record.return_type,
                accessibility: record.accessibility,
                modifiers: record.modifiers,
                location: Some(render_span(snapshot.root(), &record.decl)),
            },
        })
    }

    async fn diagnostics(&self, params: Option<Value>) -> Result<Value, MethodError> {
        let params: DiagnosticsParams = Self::decode(params)?;
        let snapshot = self.ctx.snapshots.current();

        let scope = match &params.file {
            Some(file) => match snapshot.resolve_document(file) {
                Some(document) => Some(document),
                None => {
                    return Ok(failure(
                        QueryErrorCode::DocumentNotFound,
                        format!("document not in workspace: {file}"),
                    ));
                }
            },
            None => None,
        };

        let records = snapshot.analysis().diagnostics(
            scope.as_deref(),
            params.include_warnings,
            params.include_info,
        );

        let mut error_count = 0;
        let mut warning_count = 0;
        let mut info_count = 0;
        let diagnostics: Vec<DiagnosticInfo> = records
            .into_iter()
            .map(|record| {
                match record.severity {
                    Severity::Error => error_count += 1,
                    Severity::Warning => warning_count += 1,
                    Severity::Info => info_count += 1,
                }
                DiagnosticInfo {
                    id: record.id,
                    severity: record.severity,
                    message: record.message,
                    location: record
                        .span
                        .as_ref()
                        .map(|span| render_span(snapshot.root(), span)),
                }
            })
            .collect();

        to_value(DiagnosticsResult {
            success: true,
            diagnostics,
            error_count,
            warning_count,
            info_count,
        })
    }

    fn ping(&self) -> Result<Value, MethodError> {
        to_value(PingResult {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            idle_timeout_minutes: self.ctx.idle_timeout.as_secs() / 60,
            idle_seconds: self.ctx.activity.idle().as_secs(),
        })
    }

    fn status(&self) -> Result<Value, MethodError> {
        let snapshot = self.ctx.snapshots.current();
        to_value(StatusResult {
            workspace: self.ctx.workspace.to_string_lossy().to_string(),
            socket_path: self.ctx.socket_path.clone(),
            pid_file_path: self.ctx.pid_file_path.to_string_lossy().to_string(),
            running: true,
            responsive: true,
            pid: Some(std::process::id()),
            idle_timeout_minutes: Some(self.ctx.idle_timeout.as_secs() / 60),
            idle_seconds: Some(self.ctx.activity.idle().as_secs()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            snapshot_version: Some(snapshot.version()),
        })
    }
}

enum MethodError {
    InvalidParams(String),
    Internal(String),
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, MethodError> {
    serde_json::to_value(value).map_err(|e| MethodError::Internal(e.to_string()))
}

fn failure(code: QueryErrorCode, message: impl Into<String>) -> Value {
    serde_json::to_value(QueryFailure::new(code, message)).unwrap_or(Value::Null)
}

/// Render a span for the wire: workspace-relative when under the root.
fn render_span(root: &Path, span: &SourceSpan) -> Location {
    let file = match span.file.strip_prefix(root) {
        Ok(relative) => relative.to_string_lossy().to_string(),
        Err(_) => span.file.to_string_lossy().to_string(),
    };
    Location {
        file,
        line: span.line,
        column: span.column,
        end_line: Some(span.end_line),
        end_column: Some(span.end_column),
    }
}

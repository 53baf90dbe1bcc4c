//! Wire protocol: JSON-RPC 2.0 bodies in length-prefixed frames.
//!
//! A frame is a 4-byte little-endian length followed by that many bytes of
//! UTF-8 JSON. One connection carries any number of request/response pairs;
//! the length prefix lets the reader allocate exactly once per message and
//! reject oversized payloads before touching them.
//!
//! Application outcomes ("no symbol here") are not JSON-RPC errors: they are
//! successful responses whose `result` carries `success:false` and an error
//! code. Only protocol faults (bad JSON, unknown method, dispatcher panic)
//! use the JSON-RPC `error` member.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound for a single frame body, shared by daemon and client.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

pub const JSONRPC_VERSION: &str = "2.0";

// JSON-RPC reserved error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Fold every object key to lowercase, recursively.
///
/// Clients generated from C#-side serializers disagree about property
/// casing (`File` vs `file`); incoming bodies are folded before typed
/// deserialization, while everything we emit uses canonical snake_case.
pub fn fold_keys_lowercase(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), fold_keys_lowercase(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(fold_keys_lowercase).collect()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Method params
// ---------------------------------------------------------------------------

/// `{file, line, column}`, 1-based, file absolute or workspace-relative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionParams {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferencesParams {
    pub file: String,
    pub line: u32,
    pub column: u32,
    #[serde(default)]
    pub include_definition: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsParams {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_true")]
    pub include_warnings: bool,
    #[serde(default)]
    pub include_info: bool,
}

impl Default for DiagnosticsParams {
    fn default() -> Self {
        Self {
            file: None,
            include_warnings: true,
            include_info: false,
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Result envelopes
// ---------------------------------------------------------------------------

/// A rendered source location. `file` is workspace-relative when the target
/// lies under the workspace root, otherwise the canonical absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_column: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolDescriptor {
    pub name: String,
    pub kind: String,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containing_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containing_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessibility: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticInfo {
    pub id: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Application-level failure codes, carried inside a successful `result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorCode {
    DocumentNotFound,
    SymbolNotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryFailure {
    pub success: bool,
    pub error_code: QueryErrorCode,
    pub error_message: String,
}

impl QueryFailure {
    pub fn new(code: QueryErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: code,
            error_message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationsResult {
    pub success: bool,
    pub symbol_name: String,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolResult {
    pub success: bool,
    #[serde(flatten)]
    pub symbol: SymbolDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsResult {
    pub success: bool,
    pub diagnostics: Vec<DiagnosticInfo>,
    pub error_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub status: String,
    pub version: String,
    pub idle_timeout_minutes: u64,
    pub idle_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResult {
    pub status: String,
}

/// Daemon status as the daemon itself reports it. The client fills in
/// `running`/`responsive` when composing an offline answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub workspace: String,
    pub socket_path: String,
    pub pid_file_path: String,
    pub running: bool,
    pub responsive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_version: Option<u64>,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub struct MessageCodec;

impl MessageCodec {
    /// Serialize a message and prepend the little-endian length prefix.
    pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(msg)?;
        if body.is_empty() {
            bail!("refusing to encode an empty frame");
        }
        if body.len() > MAX_MESSAGE_SIZE {
            bail!(
                "message size {} exceeds maximum of {} bytes",
                body.len(),
                MAX_MESSAGE_SIZE
            );
        }

        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    /// Read one frame body. Returns `None` on clean EOF at a frame
    /// boundary; mid-frame EOF and out-of-bounds lengths are errors that
    /// should close the connection.
    pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut length_buf = [0u8; 4];
        match reader.read_exact(&mut length_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(length_buf) as usize;
        if len == 0 {
            bail!("zero-length frame");
        }
        if len > MAX_MESSAGE_SIZE {
            bail!(
                "frame length {} exceeds maximum of {} bytes",
                len,
                MAX_MESSAGE_SIZE
            );
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    /// Write one already-serialized frame (length prefix included) and flush.
    pub async fn write_frame<W>(writer: &mut W, framed: &[u8]) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        writer.write_all(framed).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Parse a frame body into a request, folding key case first.
    pub fn decode_request(body: &[u8]) -> Result<RpcRequest> {
        let value: Value = serde_json::from_slice(body)?;
        let request = serde_json::from_value(fold_keys_lowercase(value))?;
        Ok(request)
    }

    /// Parse a frame body into a response.
    pub fn decode_response(body: &[u8]) -> Result<RpcResponse> {
        let value: Value = serde_json::from_slice(body)?;
        let response = serde_json::from_value(fold_keys_lowercase(value))?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frame_round_trip() {
        let request = RpcRequest::new("7", "definition", Some(json!({"file": "A.cs"})));
        let framed = MessageCodec::encode(&request).unwrap();

        let mut cursor = std::io::Cursor::new(framed);
        let body = MessageCodec::read_frame(&mut cursor).await.unwrap().unwrap();
        let decoded = MessageCodec::decode_request(&body).unwrap();

        assert_eq!(decoded.id, "7");
        assert_eq!(decoded.method, "definition");
        assert_eq!(decoded.params, Some(json!({"file": "A.cs"})));
    }

    #[tokio::test]
    async fn length_prefix_is_little_endian() {
        let framed = MessageCodec::encode(&json!({"a": 1})).unwrap();
        let len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_by_reader() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_le_bytes());
        bytes.extend_from_slice(b"ignored");

        let mut cursor = std::io::Cursor::new(bytes);
        let err = MessageCodec::read_frame(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn zero_length_frame_is_rejected() {
        let mut cursor = std::io::Cursor::new(0u32.to_le_bytes().to_vec());
        assert!(MessageCodec::read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_is_clean() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(MessageCodec::read_frame(&mut cursor)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"short");
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(MessageCodec::read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn property_names_match_case_insensitively() {
        let body = br#"{"Jsonrpc":"2.0","Id":"1","Method":"ping","Params":{"File":"T.cs","Line":1,"Column":2}}"#;
        let request = MessageCodec::decode_request(body).unwrap();
        assert_eq!(request.method, "ping");

        let params: PositionParams =
            serde_json::from_value(request.params.unwrap()).unwrap();
        assert_eq!(params.file, "T.cs");
        assert_eq!(params.line, 1);
        assert_eq!(params.column, 2);
    }

    #[test]
    fn envelope_failure_serializes_snake_case() {
        let failure = QueryFailure::new(QueryErrorCode::SymbolNotFound, "no symbol at position");
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error_code"], json!("symbol_not_found"));
    }

    #[test]
    fn response_carries_exactly_one_of_result_or_error() {
        let ok = RpcResponse::success("1", json!({"success": true}));
        let ok_value = serde_json::to_value(&ok).unwrap();
        assert!(ok_value.get("result").is_some());
        assert!(ok_value.get("error").is_none());

        let err = RpcResponse::failure("1", METHOD_NOT_FOUND, "unknown method");
        let err_value = serde_json::to_value(&err).unwrap();
        assert!(err_value.get("result").is_none());
        assert_eq!(err_value["error"]["code"], json!(METHOD_NOT_FOUND));
    }
}

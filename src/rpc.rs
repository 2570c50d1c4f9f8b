//! JSON-RPC 2.0 protocol handler.
//!
//! Requests arrive as newline-delimited JSON-RPC 2.0 messages. The two
//! methods, `prepareEnv` and `executeCommand`, carry the CommandExecutor
//! message shapes defined below; every handled failure is returned as a
//! normal `ExecutionOutput` with status `FAILURE`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::blueprint::BlueprintId;

pub const METHOD_PREPARE_ENV: &str = "prepareEnv";
pub const METHOD_EXECUTE_COMMAND: &str = "executeCommand";

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: serde_json::Value,
}

impl Response {
    /// Create a success response.
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: serde_json::Value, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Bytes set aside for the `{"jsonrpc":"2.0","result":...,"id":...}` wrapper
/// and trailing newline when sizing a result. Covers ids up to ~200 bytes.
pub const ENVELOPE_RESERVE: usize = 256;

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const INVALID_PARAMS: i32 = -32602;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INTERNAL_ERROR: i32 = -32603;

/// Reply to a line that could not be read as a request. The id is unknown, so
/// it is `null`.
pub fn malformed_request(err: &serde_json::Error) -> Response {
    match err.classify() {
        serde_json::error::Category::Data => {
            Response::error(serde_json::Value::Null, INVALID_REQUEST, "Invalid Request")
        }
        _ => Response::error(serde_json::Value::Null, PARSE_ERROR, "Parse error"),
    }
}

/// `blueprintName` / `blueprintVersion` / `blueprintUUID` triple.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identifiers {
    pub blueprint_name: String,
    pub blueprint_version: String,
    #[serde(rename = "blueprintUUID", default)]
    pub blueprint_uuid: String,
}

impl Identifiers {
    pub fn blueprint_id(&self) -> BlueprintId {
        BlueprintId::new(
            self.blueprint_name.clone(),
            self.blueprint_version.clone(),
            self.blueprint_uuid.clone(),
        )
    }
}

/// Fields shared by both request kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeader {
    pub identifiers: Identifiers,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub sub_request_id: String,
    #[serde(default)]
    pub originator_id: String,
    #[serde(default)]
    pub correlation_id: String,
    /// Execution timeout in seconds; zero means "use the configured default".
    #[serde(default)]
    pub time_out: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageType {
    #[serde(rename = "pip", alias = "PIP")]
    Pip,
    #[serde(rename = "ansible_galaxy", alias = "ANSIBLE_GALAXY")]
    AnsibleGalaxy,
}

impl PackageType {
    pub fn name(&self) -> &'static str {
        match self {
            PackageType::Pip => "pip",
            PackageType::AnsibleGalaxy => "ansible_galaxy",
        }
    }
}

/// One group of packages of the same installer kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packages {
    #[serde(rename = "type")]
    pub kind: PackageType,
    #[serde(default)]
    pub package: Vec<String>,
}

/// Parameters for the "prepareEnv" method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareEnvInput {
    #[serde(flatten)]
    pub header: RequestHeader,
    #[serde(default)]
    pub packages: Vec<Packages>,
}

/// Parameters for the "executeCommand" method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInput {
    #[serde(flatten)]
    pub header: RequestHeader,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failure,
}

/// Result of either method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    pub request_id: String,
    pub response: Vec<String>,
    pub status: Status,
    pub payload: String,
    pub timestamp: String,
    #[serde(default)]
    pub err_msg: String,
}

/// RPC handler that processes incoming requests.
pub struct RpcHandler<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
}

impl<R, W> RpcHandler<R, W>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    /// Create a new RPC handler with the given reader and writer.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    /// Read the next request from the stream.
    ///
    /// Blank lines are skipped; `Ok(None)` signals EOF. A line that is not a
    /// request fails with an error that downcasts to `serde_json::Error`.
    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .context("Failed to read from stream")?;

            if bytes_read == 0 {
                return Ok(None); // EOF
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        let request: Request =
            serde_json::from_str(&line).context("Failed to parse JSON-RPC request")?;

        Ok(Some(request))
    }

    /// Send a response to the stream.
    pub async fn send_response(&mut self, response: Response) -> Result<()> {
        let json = serde_json::to_string(&response)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

//! Line protocol spoken between the orchestrator and kernel engines.
//!
//! Every record is one JSON object terminated by `\n`, in both directions:
//!
//! - orchestrator -> engine: [`Directive`] (`{"type": "execute", ...}`)
//! - engine -> orchestrator: [`KernelMessage`] (`{"msg_type": "stream", ...}`)
//!
//! A malformed line never poisons the stream; readers report it and move on.

use std::io::Write;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};

/// MIME-keyed output payload, e.g. `{"text/plain": "2"}`.
pub type MimeBundle = Map<String, Value>;

/// A request to run code in a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Caller-supplied correlation id, echoed as `parent_id` on replies.
    pub msg_id: String,
    /// Source submitted for execution.
    pub code: String,
    /// Suppress visible output (`execute_input`, `stream`, `execute_result`).
    #[serde(default)]
    pub silent: bool,
    /// Record the submission in the engine's input history.
    #[serde(default = "default_true")]
    pub store_history: bool,
    /// Notebook cell this submission came from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ExecuteRequest {
    /// Create a request with a fresh correlation id.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
            silent: false,
            store_history: true,
            cell_id: None,
        }
    }
}

/// Directive sent from the orchestrator to an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    /// Run a submission.
    Execute(ExecuteRequest),
    /// Abort the running submission. Only used where OS signals are unavailable.
    Interrupt,
    /// Exit cleanly.
    Shutdown,
}

/// Engine execution state reported by `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Idle,
    Busy,
    /// Any state this orchestrator does not track (e.g. `restarting`).
    #[serde(other)]
    Unknown,
}

/// Which output stream a `stream` message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Outcome carried by `execute_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusContent {
    pub execution_state: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInputContent {
    pub code: String,
    pub execution_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamContent {
    pub name: StreamName,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResultContent {
    pub execution_count: u64,
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: MimeBundle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayDataContent {
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: MimeBundle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReplyContent {
    pub status: ReplyStatus,
    pub execution_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
}

/// Payload of a [`KernelMessage`], tagged by `msg_type` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Status(StatusContent),
    ExecuteInput(ExecuteInputContent),
    Stream(StreamContent),
    ExecuteResult(ExecuteResultContent),
    DisplayData(DisplayDataContent),
    Error(ErrorContent),
    ExecuteReply(ExecuteReplyContent),
    /// A `msg_type` this orchestrator does not model. Passed through untouched.
    Unrecognized { msg_type: String, content: Value },
}

impl MessageContent {
    /// Wire name of this payload's `msg_type`.
    pub fn msg_type(&self) -> &str {
        match self {
            MessageContent::Status(_) => "status",
            MessageContent::ExecuteInput(_) => "execute_input",
            MessageContent::Stream(_) => "stream",
            MessageContent::ExecuteResult(_) => "execute_result",
            MessageContent::DisplayData(_) => "display_data",
            MessageContent::Error(_) => "error",
            MessageContent::ExecuteReply(_) => "execute_reply",
            MessageContent::Unrecognized { msg_type, .. } => msg_type,
        }
    }

    /// Decode a payload given its wire `msg_type`.
    pub fn from_parts(msg_type: &str, content: Value) -> serde_json::Result<Self> {
        Ok(match msg_type {
            "status" => MessageContent::Status(serde_json::from_value(content)?),
            "execute_input" => MessageContent::ExecuteInput(serde_json::from_value(content)?),
            "stream" => MessageContent::Stream(serde_json::from_value(content)?),
            "execute_result" => MessageContent::ExecuteResult(serde_json::from_value(content)?),
            "display_data" => MessageContent::DisplayData(serde_json::from_value(content)?),
            "error" => MessageContent::Error(serde_json::from_value(content)?),
            "execute_reply" => MessageContent::ExecuteReply(serde_json::from_value(content)?),
            other => MessageContent::Unrecognized {
                msg_type: other.to_string(),
                content,
            },
        })
    }
}

/// A message emitted by an engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct KernelMessage {
    pub msg_id: String,
    /// `msg_id` of the [`ExecuteRequest`] that triggered this message.
    pub parent_id: Option<String>,
    pub content: MessageContent,
    pub metadata: Option<Value>,
}

impl KernelMessage {
    /// Create a message with a fresh id.
    pub fn new(parent_id: Option<&str>, content: MessageContent) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            parent_id: parent_id.map(str::to_string),
            content,
            metadata: None,
        }
    }

    /// Shorthand for a `status` message.
    pub fn status(parent_id: Option<&str>, execution_state: ExecutionState) -> Self {
        Self::new(
            parent_id,
            MessageContent::Status(StatusContent { execution_state }),
        )
    }

    pub fn msg_type(&self) -> &str {
        self.content.msg_type()
    }

    /// The execution state if this is a `status` message.
    pub fn execution_state(&self) -> Option<ExecutionState> {
        match &self.content {
            MessageContent::Status(status) => Some(status.execution_state),
            _ => None,
        }
    }

    /// The execution count carried by `execute_input`, `execute_result` or `execute_reply`.
    pub fn execution_count(&self) -> Option<u64> {
        match &self.content {
            MessageContent::ExecuteInput(c) => Some(c.execution_count),
            MessageContent::ExecuteResult(c) => Some(c.execution_count),
            MessageContent::ExecuteReply(c) => Some(c.execution_count),
            _ => None,
        }
    }

    /// Whether this is the readiness marker a fresh engine sends (`status: idle`).
    pub fn is_ready_marker(&self) -> bool {
        self.execution_state() == Some(ExecutionState::Idle)
    }
}

/// Flat wire form of a [`KernelMessage`].
#[derive(Deserialize)]
struct RawMessage {
    msg_id: String,
    msg_type: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    metadata: Option<Value>,
}

impl TryFrom<RawMessage> for KernelMessage {
    type Error = serde_json::Error;

    fn try_from(raw: RawMessage) -> serde_json::Result<Self> {
        Ok(Self {
            msg_id: raw.msg_id,
            parent_id: raw.parent_id,
            content: MessageContent::from_parts(&raw.msg_type, raw.content)?,
            metadata: raw.metadata,
        })
    }
}

impl Serialize for KernelMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut record = serializer.serialize_struct("KernelMessage", 5)?;
        record.serialize_field("msg_id", &self.msg_id)?;
        record.serialize_field("msg_type", self.msg_type())?;
        record.serialize_field("parent_id", &self.parent_id)?;
        match &self.content {
            MessageContent::Status(c) => record.serialize_field("content", c)?,
            MessageContent::ExecuteInput(c) => record.serialize_field("content", c)?,
            MessageContent::Stream(c) => record.serialize_field("content", c)?,
            MessageContent::ExecuteResult(c) => record.serialize_field("content", c)?,
            MessageContent::DisplayData(c) => record.serialize_field("content", c)?,
            MessageContent::Error(c) => record.serialize_field("content", c)?,
            MessageContent::ExecuteReply(c) => record.serialize_field("content", c)?,
            MessageContent::Unrecognized { content, .. } => {
                record.serialize_field("content", content)?
            }
        }
        match &self.metadata {
            Some(metadata) => record.serialize_field("metadata", metadata)?,
            None => record.skip_field("metadata")?,
        }
        record.end()
    }
}

/// Connection descriptor written next to each kernel.
///
/// Most fields are placeholders for engines that speak the line protocol
/// over stdio, but engines that expect a Jupyter-style file can read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    pub ip: String,
    pub key: String,
    pub transport: String,
    pub signature_scheme: String,
    pub kernel_name: String,
}

impl ConnectionInfo {
    /// Descriptor with placeholder ports derived from a random key.
    pub fn for_kernel(kernel_name: &str) -> Self {
        let key = uuid::Uuid::new_v4();
        let seed = key.as_u128();
        // Spread ports over the dynamic range; they are never bound in stdio mode.
        let port = |slot: u32| -> u16 { 49152 + ((seed >> (slot * 16)) as u16 % 16000) };
        Self {
            shell_port: port(0),
            iopub_port: port(1),
            stdin_port: port(2),
            control_port: port(3),
            hb_port: port(4),
            ip: "127.0.0.1".to_string(),
            key: key.to_string(),
            transport: "tcp".to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            kernel_name: kernel_name.to_string(),
        }
    }
}

/// Encode a record as a single JSON line.
pub fn encode_line<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(record)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one inbound line into a kernel message.
pub fn decode_message(line: &str) -> Result<KernelMessage> {
    serde_json::from_str(line).map_err(|e| Error::Decode(format!("{}: {}", e, truncate(line))))
}

/// Decode one outbound line into a directive.
pub fn decode_directive(line: &str) -> Result<Directive> {
    serde_json::from_str(line).map_err(|e| Error::Decode(format!("{}: {}", e, truncate(line))))
}

/// Write a record to a blocking writer and flush it.
///
/// Used by engines, which run a plain synchronous loop over stdio.
pub fn write_record<W: Write, T: Serialize>(writer: &mut W, record: &T) -> Result<()> {
    let bytes = encode_line(record)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Write a directive to an async writer and flush it.
pub async fn write_directive<W: AsyncWrite + Unpin>(writer: &mut W, directive: &Directive) -> Result<()> {
    let bytes = encode_line(directive)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// What the reader saw on the next line.
#[derive(Debug)]
pub enum ReadEvent {
    Message(KernelMessage),
    /// The line could not be decoded. Carries the decode error text.
    Malformed(String),
    /// End of stream or unrecoverable IO error.
    Closed,
}

/// Decoder over an engine's output stream.
pub struct MessageReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Read the next record, skipping blank lines.
    ///
    /// Lines that are not UTF-8 or not valid records are reported as
    /// [`ReadEvent::Malformed`]; only end of stream closes the reader.
    pub async fn next_event(&mut self) -> ReadEvent {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf).await {
                Ok(0) => return ReadEvent::Closed,
                Ok(_) => {
                    let line = match std::str::from_utf8(&self.buf) {
                        Ok(line) => line.trim(),
                        Err(e) => return ReadEvent::Malformed(format!("invalid UTF-8: {}", e)),
                    };
                    if line.is_empty() {
                        continue;
                    }
                    return match decode_message(line) {
                        Ok(message) => ReadEvent::Message(message),
                        Err(e) => ReadEvent::Malformed(e.to_string()),
                    };
                }
                Err(e) => {
                    tracing::debug!("kernel output stream failed: {}", e);
                    return ReadEvent::Closed;
                }
            }
        }
    }
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_execute_directive_wire_shape() {
        let mut request = ExecuteRequest::new("1+1");
        request.msg_id = "m1".to_string();
        let value = serde_json::to_value(Directive::Execute(request)).unwrap();

        assert_eq!(value["type"], "execute");
        assert_eq!(value["msg_id"], "m1");
        assert_eq!(value["code"], "1+1");
        assert!(value.get("cell_id").is_none());
    }

    #[test]
    fn test_shutdown_directive_is_bare() {
        let line = encode_line(&Directive::Shutdown).unwrap();
        assert_eq!(line, b"{\"type\":\"shutdown\"}\n");
    }

    #[test]
    fn test_decode_directive_defaults() {
        let directive = decode_directive(r#"{"type":"execute","msg_id":"a","code":"x"}"#).unwrap();
        match directive {
            Directive::Execute(req) => {
                assert!(!req.silent);
                assert!(req.store_history);
                assert_eq!(req.cell_id, None);
            }
            other => panic!("unexpected directive: {:?}", other),
        }
    }

    #[test]
    fn test_decode_stream_message() {
        let line = r#"{"msg_id":"1","msg_type":"stream","parent_id":"p","content":{"name":"stdout","text":"hi\n"}}"#;
        let msg = decode_message(line).unwrap();

        assert_eq!(msg.msg_type(), "stream");
        assert_eq!(msg.parent_id.as_deref(), Some("p"));
        match msg.content {
            MessageContent::Stream(stream) => {
                assert_eq!(stream.name, StreamName::Stdout);
                assert_eq!(stream.text, "hi\n");
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_type_passes_through() {
        let line = r#"{"msg_id":"1","msg_type":"comm_open","content":{"target":"x"}}"#;
        let msg = decode_message(line).unwrap();

        assert_eq!(msg.msg_type(), "comm_open");
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["content"], json!({"target": "x"}));
        assert_eq!(encoded["msg_type"], "comm_open");
    }

    #[test]
    fn test_known_type_with_bad_content_is_error() {
        let line = r#"{"msg_id":"1","msg_type":"execute_reply","content":{"status":"ok"}}"#;
        assert!(matches!(decode_message(line), Err(Error::Decode(_))));
    }

    #[test]
    fn test_ready_marker() {
        assert!(KernelMessage::status(None, ExecutionState::Idle).is_ready_marker());
        assert!(!KernelMessage::status(None, ExecutionState::Busy).is_ready_marker());
    }

    #[test]
    fn test_unknown_execution_state() {
        let line = r#"{"msg_id":"1","msg_type":"status","content":{"execution_state":"restarting"}}"#;
        let msg = decode_message(line).unwrap();
        assert_eq!(msg.execution_state(), Some(ExecutionState::Unknown));
    }

    #[tokio::test]
    async fn test_reader_skips_malformed_lines() {
        let input = b"{\"msg_id\":\"1\",\"msg_type\":\"status\",\"content\":{\"execution_state\":\"idle\"}}\n\
                      not json\n\
                      \n\
                      {\"msg_id\":\"2\",\"msg_type\":\"status\",\"content\":{\"execution_state\":\"busy\"}}\n";
        let mut reader = MessageReader::new(&input[..]);

        assert!(matches!(reader.next_event().await, ReadEvent::Message(m) if m.msg_id == "1"));
        assert!(matches!(reader.next_event().await, ReadEvent::Malformed(_)));
        assert!(matches!(reader.next_event().await, ReadEvent::Message(m) if m.msg_id == "2"));
        assert!(matches!(reader.next_event().await, ReadEvent::Closed));
    }

    #[tokio::test]
    async fn test_reader_survives_invalid_utf8_line() {
        let input = b"\xff\xfe garbage\n\
                      {\"msg_id\":\"2\",\"msg_type\":\"status\",\"content\":{\"execution_state\":\"busy\"}}\n";
        let mut reader = MessageReader::new(&input[..]);

        assert!(matches!(reader.next_event().await, ReadEvent::Malformed(e) if e.contains("UTF-8")));
        assert!(matches!(reader.next_event().await, ReadEvent::Message(m) if m.msg_id == "2"));
        assert!(matches!(reader.next_event().await, ReadEvent::Closed));
    }

    #[tokio::test]
    async fn test_reader_final_line_without_newline() {
        let input = b"{\"msg_id\":\"1\",\"msg_type\":\"status\",\"content\":{\"execution_state\":\"idle\"}}";
        let mut reader = MessageReader::new(&input[..]);

        assert!(matches!(reader.next_event().await, ReadEvent::Message(m) if m.msg_id == "1"));
        assert!(matches!(reader.next_event().await, ReadEvent::Closed));
    }

    #[test]
    fn test_connection_info_fields() {
        let info = ConnectionInfo::for_kernel("quill");
        let value = serde_json::to_value(&info).unwrap();
        for field in ["shell_port", "iopub_port", "hb_port", "ip", "key", "transport", "signature_scheme", "kernel_name"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert!(info.shell_port >= 49152);
    }
}

//! Request handling for one engine process.
//!
//! [`Engine::execute`] turns one execute request into the message sequence
//! every submission produces:
//!
//! ```text
//! status(busy) -> execute_input -> stream* -> execute_result? -> error?
//!              -> execute_reply -> status(idle)
//! ```
//!
//! [`serve`] drives an engine from a directive stream, answering on a
//! message stream.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use quill_core::protocol::{
    Directive, ErrorContent, ExecuteInputContent, ExecuteReplyContent, ExecuteRequest,
    ExecuteResultContent, ExecutionState, KernelMessage, MessageContent, MimeBundle, ReplyStatus,
    StreamContent, StreamName, decode_directive, write_record,
};

use crate::directive::{self, Line, Submission};
use crate::error::ExecError;
use crate::eval::{Captured, Interpreter, Value};
use crate::interrupt::InterruptFlag;
use crate::shell;

/// Destination for outbound messages.
pub trait MessageSink {
    fn emit(&mut self, message: KernelMessage) -> quill_core::Result<()>;
}

impl MessageSink for Vec<KernelMessage> {
    fn emit(&mut self, message: KernelMessage) -> quill_core::Result<()> {
        self.push(message);
        Ok(())
    }
}

/// Writes each message as one protocol line.
pub struct WireSink<W: Write> {
    writer: W,
}

impl<W: Write> WireSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> MessageSink for WireSink<W> {
    fn emit(&mut self, message: KernelMessage) -> quill_core::Result<()> {
        write_record(&mut self.writer, &message)
    }
}

/// Everything one submission produced, in emission order.
#[derive(Debug, Default)]
pub struct Outcome {
    pub streams: Vec<(StreamName, String)>,
    pub result: Option<Value>,
    pub error: Option<ExecError>,
}

impl Outcome {
    pub(crate) fn stdout(&mut self, text: impl Into<String>) {
        self.push(StreamName::Stdout, text.into());
    }

    pub(crate) fn stderr(&mut self, text: impl Into<String>) {
        self.push(StreamName::Stderr, text.into());
    }

    fn push(&mut self, name: StreamName, text: String) {
        if !text.is_empty() {
            self.streams.push((name, text));
        }
    }
}

/// Interpreter state plus the bookkeeping directives need.
pub struct Engine {
    pub(crate) interp: Interpreter,
    pub(crate) interrupt: InterruptFlag,
    pub(crate) history: Vec<String>,
    execution_count: u64,
    /// Working directory for shell escapes and file directives.
    pub(crate) cwd: PathBuf,
    /// Variables set with `%env`, layered over the process environment.
    pub(crate) env: BTreeMap<String, String>,
}

impl Engine {
    pub fn new(interrupt: InterruptFlag) -> Self {
        Self {
            interp: Interpreter::new(interrupt),
            interrupt,
            history: Vec::new(),
            execution_count: 0,
            cwd: std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
            env: BTreeMap::new(),
        }
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    /// Run one request and emit its full message sequence.
    ///
    /// Returns the reply status. Errors are sink failures only; failures of
    /// the submitted code are reported as messages.
    pub fn execute(
        &mut self,
        request: &ExecuteRequest,
        sink: &mut impl MessageSink,
    ) -> quill_core::Result<ReplyStatus> {
        let parent = Some(request.msg_id.as_str());
        // Anything raised before this submission was announced is stale.
        self.interrupt.clear();
        sink.emit(KernelMessage::status(parent, ExecutionState::Busy))?;

        self.execution_count += 1;
        let execution_count = self.execution_count;
        if request.store_history {
            self.history.push(request.code.clone());
        }

        if !request.silent {
            sink.emit(KernelMessage::new(
                parent,
                MessageContent::ExecuteInput(ExecuteInputContent {
                    code: request.code.clone(),
                    execution_count,
                }),
            ))?;
        }

        let outcome = self.run(&request.code);
        self.interrupt.clear();

        if !request.silent {
            for (name, text) in outcome.streams {
                sink.emit(KernelMessage::new(
                    parent,
                    MessageContent::Stream(StreamContent { name, text }),
                ))?;
            }
            if let Some(value) = outcome.result {
                sink.emit(KernelMessage::new(
                    parent,
                    MessageContent::ExecuteResult(ExecuteResultContent {
                        execution_count,
                        data: plain_text(&value),
                        metadata: MimeBundle::new(),
                    }),
                ))?;
            }
        }

        let reply = match outcome.error {
            None => ExecuteReplyContent {
                status: ReplyStatus::Ok,
                execution_count,
                ename: None,
                evalue: None,
            },
            Some(error) => {
                tracing::debug!("Submission {} failed: {}", request.msg_id, error);
                sink.emit(KernelMessage::new(
                    parent,
                    MessageContent::Error(ErrorContent {
                        ename: error.ename().to_string(),
                        evalue: error.evalue(),
                        traceback: vec![error.to_string()],
                    }),
                ))?;
                ExecuteReplyContent {
                    status: ReplyStatus::Error,
                    execution_count,
                    ename: Some(error.ename().to_string()),
                    evalue: Some(error.evalue()),
                }
            }
        };
        let status = reply.status;

        sink.emit(KernelMessage::new(parent, MessageContent::ExecuteReply(reply)))?;
        sink.emit(KernelMessage::status(parent, ExecutionState::Idle))?;
        Ok(status)
    }

    /// Run a submission and collect what it produced.
    pub fn run(&mut self, code: &str) -> Outcome {
        let mut outcome = Outcome::default();
        if let Err(error) = self.dispatch(code, &mut outcome) {
            outcome.error = Some(error);
        }
        outcome
    }

    /// Preprocess `code` and run its directives, then its ordinary code.
    pub(crate) fn dispatch(&mut self, code: &str, outcome: &mut Outcome) -> Result<(), ExecError> {
        let lines = match directive::parse(code)? {
            Submission::Cell { name, args, body } => {
                return self.cell_magic(&name, &args, &body, outcome);
            }
            Submission::Lines(lines) => lines,
        };

        let mut source = Vec::new();
        for line in lines {
            match line {
                Line::Shell(command) => self.shell("sh", &command, outcome)?,
                Line::Magic { name, args } => self.line_magic(&name, &args, outcome)?,
                Line::Code(text) => source.push(text),
            }
        }

        let source = source.join("\n");
        if source.trim().is_empty() {
            return Ok(());
        }
        self.run_code(&source, outcome)
    }

    fn run_code(&mut self, source: &str, outcome: &mut Outcome) -> Result<(), ExecError> {
        let mut captured = Captured::default();
        let result = self.interp.run(source, &mut captured);
        outcome.stdout(captured.stdout);
        outcome.stderr(captured.stderr);
        if let Some(value) = result? {
            outcome.result = Some(value);
        }
        Ok(())
    }

    pub(crate) fn shell(
        &mut self,
        program: &str,
        script: &str,
        outcome: &mut Outcome,
    ) -> Result<(), ExecError> {
        if script.trim().is_empty() {
            return Ok(());
        }
        let output = shell::run(program, script, &self.cwd, &self.env, self.interrupt)?;
        outcome.stdout(output.stdout);
        outcome.stderr(output.stderr);
        Ok(())
    }
}

fn plain_text(value: &Value) -> MimeBundle {
    let mut data = MimeBundle::new();
    data.insert(
        "text/plain".to_string(),
        serde_json::Value::String(value.repr()),
    );
    data
}

/// Serve directives from `input` until it closes or a shutdown arrives.
///
/// A reader thread decodes directives so that an `interrupt` directive can
/// raise the flag while a submission is running. The readiness marker
/// (`status: idle`) is sent before anything is read.
pub fn serve<R, W>(mut engine: Engine, input: R, output: W) -> quill_core::Result<()>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let mut sink = WireSink::new(output);
    sink.emit(KernelMessage::status(None, ExecutionState::Idle))?;

    let (tx, rx) = mpsc::channel();
    let interrupt = engine.interrupt;
    thread::spawn(move || {
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Failed to read directive: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match decode_directive(line.trim()) {
                Ok(Directive::Interrupt) => {
                    tracing::debug!("Interrupt requested");
                    interrupt.raise();
                }
                Ok(directive) => {
                    if tx.send(directive).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Skipping malformed directive: {}", e),
            }
        }
    });

    for directive in rx {
        match directive {
            Directive::Execute(request) => {
                tracing::debug!("Executing {}", request.msg_id);
                engine.execute(&request, &mut sink)?;
            }
            Directive::Shutdown => {
                tracing::info!("Shutdown requested");
                break;
            }
            Directive::Interrupt => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DirectiveError, EvalError};
    use quill_core::protocol::{MessageReader, ReadEvent};

    fn engine() -> Engine {
        Engine::new(InterruptFlag::detached())
    }

    fn execute(engine: &mut Engine, request: ExecuteRequest) -> Vec<KernelMessage> {
        let mut messages = Vec::new();
        engine.execute(&request, &mut messages).unwrap();
        messages
    }

    fn types(messages: &[KernelMessage]) -> Vec<&str> {
        messages.iter().map(KernelMessage::msg_type).collect()
    }

    #[test]
    fn test_expression_message_sequence() {
        let mut engine = engine();
        let request = ExecuteRequest::new("1+1");
        let messages = execute(&mut engine, request.clone());

        assert_eq!(
            types(&messages),
            vec!["status", "execute_input", "execute_result", "execute_reply", "status"]
        );
        assert!(messages.iter().all(|m| m.parent_id.as_deref() == Some(request.msg_id.as_str())));
        assert_eq!(messages[0].execution_state(), Some(ExecutionState::Busy));
        assert_eq!(messages[4].execution_state(), Some(ExecutionState::Idle));

        let MessageContent::ExecuteResult(result) = &messages[2].content else {
            panic!("expected execute_result");
        };
        assert_eq!(result.data["text/plain"], "2");
        let MessageContent::ExecuteReply(reply) = &messages[3].content else {
            panic!("expected execute_reply");
        };
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.execution_count, 1);
    }

    #[test]
    fn test_unknown_cell_magic_has_no_side_effects() {
        let mut engine = engine();
        let messages = execute(&mut engine, ExecuteRequest::new("%%unknownmagic\nx=1"));

        assert_eq!(
            types(&messages),
            vec!["status", "execute_input", "error", "execute_reply", "status"]
        );
        let MessageContent::ExecuteReply(reply) = &messages[3].content else {
            panic!("expected execute_reply");
        };
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.ename.as_deref(), Some("UsageError"));

        let outcome = engine.run("x");
        assert_eq!(
            outcome.error,
            Some(ExecError::Eval(EvalError::Name("x".to_string())))
        );
    }

    #[test]
    fn test_unknown_line_magic_aborts_before_code() {
        let mut engine = engine();
        let outcome = engine.run("y = 5\n%bogus");
        assert_eq!(
            outcome.error,
            Some(ExecError::Directive(DirectiveError::UnknownLineMagic(
                "bogus".to_string()
            )))
        );
        assert!(engine.interp.get("y").is_none());
    }

    #[test]
    fn test_directive_output_precedes_code_output() {
        let mut engine = engine();
        let outcome = engine.run("print('code')\n%echo directive");
        assert_eq!(
            outcome.streams,
            vec![
                (StreamName::Stdout, "directive\n".to_string()),
                (StreamName::Stdout, "code\n".to_string()),
            ]
        );
    }

    #[test]
    fn test_stdout_and_stderr_are_separate_streams() {
        let mut engine = engine();
        let outcome = engine.run("print('out')\nwarn('err')");
        assert_eq!(
            outcome.streams,
            vec![
                (StreamName::Stdout, "out\n".to_string()),
                (StreamName::Stderr, "err\n".to_string()),
            ]
        );
        assert!(outcome.result.is_none());
    }

    #[test]
    fn test_silent_suppresses_visible_output() {
        let mut engine = engine();
        let mut request = ExecuteRequest::new("print('hidden')\n40 + 2");
        request.silent = true;
        let messages = execute(&mut engine, request);
        assert_eq!(types(&messages), vec!["status", "execute_reply", "status"]);

        let mut request = ExecuteRequest::new("1/0");
        request.silent = true;
        let messages = execute(&mut engine, request);
        assert_eq!(
            types(&messages),
            vec!["status", "error", "execute_reply", "status"]
        );
    }

    #[test]
    fn test_deeply_nested_code_is_a_syntax_error() {
        let mut engine = engine();
        let code = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        let messages = execute(&mut engine, ExecuteRequest::new(code));
        let MessageContent::ExecuteReply(reply) = &messages[messages.len() - 2].content else {
            panic!("expected execute_reply");
        };
        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.ename.as_deref(), Some("SyntaxError"));

        let code = vec!["1"; 100_000].join("+");
        let outcome = engine.run(&code);
        assert!(matches!(outcome.error, Some(ExecError::Eval(EvalError::Syntax(_)))));

        let outcome = engine.run("6 * 7");
        assert!(outcome.error.is_none());
        assert_eq!(outcome.result, Some(Value::Int(42)));
    }

    #[test]
    fn test_execution_count_increases() {
        let mut engine = engine();
        for expected in 1..=3 {
            let messages = execute(&mut engine, ExecuteRequest::new("pass"));
            let MessageContent::ExecuteReply(reply) = &messages[messages.len() - 2].content else {
                panic!("expected execute_reply");
            };
            assert_eq!(reply.execution_count, expected);
        }
        assert_eq!(engine.execution_count(), 3);
    }

    #[test]
    fn test_store_history() {
        let mut engine = engine();
        execute(&mut engine, ExecuteRequest::new("a = 1"));
        let mut request = ExecuteRequest::new("b = 2");
        request.store_history = false;
        execute(&mut engine, request);
        assert_eq!(engine.history, vec!["a = 1"]);
    }

    #[tokio::test]
    async fn test_serve_sends_readiness_then_replies() {
        let input = [
            r#"{"type":"execute","msg_id":"m1","code":"1+1"}"#,
            "not json",
            r#"{"type":"shutdown"}"#,
            r#"{"type":"execute","msg_id":"m2","code":"2+2"}"#,
        ]
        .join("\n");
        let mut output = Vec::new();
        serve(engine(), std::io::Cursor::new(input.into_bytes()), &mut output).unwrap();

        let mut reader = MessageReader::new(output.as_slice());
        let mut messages = Vec::new();
        while let ReadEvent::Message(message) = reader.next_event().await {
            messages.push(message);
        }

        assert!(messages[0].is_ready_marker());
        assert_eq!(messages[0].parent_id, None);
        // One full sequence for m1; nothing after shutdown.
        assert_eq!(messages.len(), 6);
        assert!(messages[1..].iter().all(|m| m.parent_id.as_deref() == Some("m1")));
    }
}

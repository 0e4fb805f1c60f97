//! `quill run`: execute one submission on a fresh kernel.
//!
//! Starts a kernel from the requested spec, subscribes to its output,
//! prints everything belonging to the request until the closing
//! `status: idle`, then stops the kernel. Ctrl-C interrupts the running
//! submission instead of killing the CLI. A kernel that never reaches idle
//! within the timeout is stopped and the run fails.

use std::io::Write;
use std::time::Duration;

use quill_core::protocol::MessageContent;
use quill_core::{
    ExecuteRequest, ExecutionState, KernelConfig, KernelManager, KernelMessage, ReplyStatus,
    StreamName, sink,
};

use crate::colors;

pub async fn execute(
    config: KernelConfig,
    spec: &str,
    owner: &str,
    code: String,
    timeout: Duration,
    json: bool,
) -> anyhow::Result<ReplyStatus> {
    let capacity = config.sink_capacity;
    let manager = KernelManager::new(config).await;

    let info = manager.start(spec, owner).await?;
    tracing::debug!("started kernel {} ({})", info.id, info.spec_name);

    let outcome = drive(&manager, &info.id, code, capacity, timeout, json).await;

    if let Err(e) = manager.stop(&info.id).await {
        tracing::warn!("failed to stop kernel {}: {}", info.id, e);
    }

    outcome
}

async fn drive(
    manager: &KernelManager,
    kernel_id: &str,
    code: String,
    capacity: usize,
    timeout: Duration,
    json: bool,
) -> anyhow::Result<ReplyStatus> {
    let session = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = sink(capacity);
    manager.subscribe(kernel_id, &session, tx).await;

    let request = ExecuteRequest::new(code);
    manager.execute(kernel_id, request.clone()).await?;

    // Replies missing an execute_reply (e.g. the kernel died) count as errors.
    let mut status = ReplyStatus::Error;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    anyhow::bail!("kernel {kernel_id} stopped producing output");
                };
                if message.parent_id.as_deref() != Some(request.msg_id.as_str()) {
                    continue;
                }
                if let MessageContent::ExecuteReply(reply) = &message.content {
                    status = reply.status;
                }
                let done = message.execution_state() == Some(ExecutionState::Idle);
                if json {
                    println!("{}", serde_json::to_string(&message)?);
                } else {
                    print_message(&message);
                }
                if done {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!("interrupting kernel {kernel_id}");
                manager.interrupt(kernel_id).await?;
            }
            _ = &mut deadline => {
                manager.unsubscribe(kernel_id, &session);
                anyhow::bail!("kernel {kernel_id} did not finish within {}s", timeout.as_secs());
            }
        }
    }

    manager.unsubscribe(kernel_id, &session);
    Ok(status)
}

/// Render one message for a terminal.
fn print_message(message: &KernelMessage) {
    match &message.content {
        MessageContent::Stream(stream) => match stream.name {
            StreamName::Stdout => {
                print!("{}", stream.text);
                std::io::stdout().flush().ok();
            }
            StreamName::Stderr => eprint!("{}", stream.text),
        },
        MessageContent::ExecuteResult(result) => {
            if let Some(text) = result.data.get("text/plain").and_then(|v| v.as_str()) {
                println!(
                    "{}Out[{}]:{} {}",
                    colors::GREEN,
                    result.execution_count,
                    colors::RESET,
                    text
                );
            }
        }
        MessageContent::DisplayData(display) => {
            if let Some(text) = display.data.get("text/plain").and_then(|v| v.as_str()) {
                println!("{text}");
            }
        }
        MessageContent::Error(error) => {
            eprintln!(
                "{}{}{}: {}",
                colors::RED,
                error.ename,
                colors::RESET,
                error.evalue
            );
        }
        _ => {}
    }
}

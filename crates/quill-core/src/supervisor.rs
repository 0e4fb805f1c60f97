//! Process supervision for local kernels.
//!
//! [`launch`] spawns one engine process and wires up its three background
//! tasks:
//!
//! - **exit monitor**: owns the `Child`, waits for it, marks the kernel dead
//! - **reader**: decodes stdout records and hands them to the fan-out
//! - **stderr drain**: forwards diagnostic output to the log
//!
//! Everything else talks to the process through [`KernelIo`].

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as TokioMutex, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{KernelConfig, ReadinessPolicy};
use crate::error::{Error, Result};
use crate::fanout::OutputFanout;
use crate::kernel::{KernelState, KernelStatus};
use crate::paths::KernelDirs;
use crate::protocol::{ConnectionInfo, Directive, MessageReader, ReadEvent, write_directive};
use crate::spec::KernelSpec;

/// Environment variable carrying the kernel id into the engine.
pub const KERNEL_ID_ENV: &str = "QUILL_KERNEL_ID";

/// Narrow I/O surface to a running kernel.
///
/// Only the write side and signalling are exposed; the read side belongs
/// to the kernel's reader task.
#[async_trait]
pub trait KernelIo: Send + Sync {
    /// Encode and write one directive. Writes never interleave.
    async fn send(&self, directive: &Directive) -> Result<()>;

    /// Ask the engine to abort its current submission. Best effort.
    async fn interrupt(&self) -> Result<()>;

    /// Force-terminate the process. Idempotent.
    fn kill(&self);

    /// Whether the process has been observed to exit.
    fn has_exited(&self) -> bool;

    /// Wait up to `timeout` for the process to exit. Returns whether it did.
    async fn wait_exit(&self, timeout: Duration) -> bool;
}

/// Handle to a spawned engine process.
pub struct ProcessHandle {
    kernel_id: String,
    pid: Option<u32>,
    /// Single writer; the lock serializes whole records.
    stdin: TokioMutex<ChildStdin>,
    exited: watch::Receiver<bool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl KernelIo for ProcessHandle {
    async fn send(&self, directive: &Directive) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        write_directive(&mut *stdin, directive)
            .await
            .map_err(|e| Error::Write {
                kernel_id: self.kernel_id.clone(),
                message: e.to_string(),
            })
    }

    async fn interrupt(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let pid = self
                .pid
                .ok_or_else(|| Error::KernelDead(self.kernel_id.clone()))?;
            // SAFETY: kill(2) with a pid we spawned; no memory is shared.
            let rc = unsafe { libc::kill(pid as i32, libc::SIGINT) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            self.send(&Directive::Interrupt).await
        }
    }

    fn kill(&self) {
        let sender = match self.kill_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        matches!(
            tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }
}

/// A kernel process that passed its readiness handshake.
pub struct LaunchedKernel {
    pub dirs: KernelDirs,
    pub process: Arc<ProcessHandle>,
}

/// Spawn a kernel for `spec`, wait for readiness, and start its reader.
///
/// On any failure the process is killed and the working area removed
/// before the error is returned.
pub async fn launch(
    spec: &KernelSpec,
    kernel_id: &str,
    config: &KernelConfig,
    state: Arc<KernelState>,
    fanout: Arc<OutputFanout>,
) -> Result<LaunchedKernel> {
    let dirs = KernelDirs::create(&config.runtime_dir, kernel_id).map_err(|e| Error::Spawn {
        kernel_id: kernel_id.to_string(),
        message: format!("cannot create working area: {}", e),
    })?;

    let spawned = match spawn(spec, kernel_id, &dirs, config) {
        Ok(spawned) => spawned,
        Err(e) => {
            cleanup_dirs(&dirs);
            return Err(e);
        }
    };

    let Spawned {
        child,
        stdin,
        stdout,
        stderr,
    } = spawned;

    let pid = child.id();
    let (exited_tx, exited_rx) = watch::channel(false);
    let (kill_tx, kill_rx) = oneshot::channel();

    monitor_exit(child, kernel_id.to_string(), state.clone(), exited_tx, kill_rx);
    drain_stderr(stderr, kernel_id.to_string());

    let process = Arc::new(ProcessHandle {
        kernel_id: kernel_id.to_string(),
        pid,
        stdin: TokioMutex::new(stdin),
        exited: exited_rx,
        kill_tx: Mutex::new(Some(kill_tx)),
    });

    let mut reader = MessageReader::new(stdout);
    if let Err(e) = await_ready(
        &mut reader,
        &state,
        kernel_id,
        config.ready_timeout,
        config.readiness_policy,
    )
    .await
    {
        process.kill();
        process.wait_exit(Duration::from_secs(1)).await;
        cleanup_dirs(&dirs);
        return Err(e);
    }

    spawn_reader(reader, kernel_id.to_string(), state, fanout, process.clone());

    tracing::info!(
        "Kernel {} ({}) started with pid {:?}",
        kernel_id,
        spec.name,
        pid
    );

    Ok(LaunchedKernel { dirs, process })
}

struct Spawned {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

fn spawn(spec: &KernelSpec, kernel_id: &str, dirs: &KernelDirs, config: &KernelConfig) -> Result<Spawned> {
    let spawn_error = |message: String| Error::Spawn {
        kernel_id: kernel_id.to_string(),
        message,
    };

    dirs.write_connection_file(&ConnectionInfo::for_kernel(&spec.name))
        .map_err(|e| spawn_error(format!("cannot write connection file: {}", e)))?;

    let argv = spec.launch_command(&dirs.connection_file);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| spawn_error(format!("spec '{}' has an empty launch command", spec.name)))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&spec.env)
        .env(KERNEL_ID_ENV, kernel_id)
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &config.working_dir {
        command.current_dir(cwd);
    }

    tracing::debug!("Spawning kernel {}: {:?}", kernel_id, argv);

    let mut child = command
        .spawn()
        .map_err(|e| spawn_error(format!("failed to start '{}': {}", program, e)))?;

    // kill_on_drop reaps the child if any stream is missing.
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error("failed to get kernel stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error("failed to get kernel stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_error("failed to get kernel stderr".to_string()))?;

    Ok(Spawned {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Wait for the first message from a fresh kernel.
///
/// Any decoded message counts as readiness. On timeout the outcome depends
/// on `policy`.
async fn await_ready<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut MessageReader<R>,
    state: &KernelState,
    kernel_id: &str,
    timeout: Duration,
    policy: ReadinessPolicy,
) -> Result<()> {
    match tokio::time::timeout(timeout, reader.next_event()).await {
        Ok(ReadEvent::Message(message)) => {
            if !message.is_ready_marker() {
                tracing::warn!(
                    "Kernel {} sent {} before its readiness status; accepting it as ready",
                    kernel_id,
                    message.msg_type()
                );
            }
            state.observe(&message);
            if state.status() == KernelStatus::Starting {
                state.set_status(KernelStatus::Idle);
            }
            Ok(())
        }
        Ok(ReadEvent::Malformed(e)) => Err(Error::Spawn {
            kernel_id: kernel_id.to_string(),
            message: format!("invalid first message: {}", e),
        }),
        Ok(ReadEvent::Closed) => Err(Error::Spawn {
            kernel_id: kernel_id.to_string(),
            message: "kernel exited before becoming ready".to_string(),
        }),
        Err(_) => match policy {
            ReadinessPolicy::Optimistic => {
                tracing::warn!(
                    "Kernel {} not ready after {:?}; assuming it is",
                    kernel_id,
                    timeout
                );
                state.set_status(KernelStatus::Idle);
                Ok(())
            }
            ReadinessPolicy::Strict => Err(Error::ReadinessTimeout {
                kernel_id: kernel_id.to_string(),
                timeout,
            }),
        },
    }
}

/// Wait for the process in the background and mark the kernel dead when it exits.
///
/// This is the only path besides an explicit stop that sets `dead`.
fn monitor_exit(
    mut child: Child,
    kernel_id: String,
    state: Arc<KernelState>,
    exited: watch::Sender<bool>,
    kill_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!("Kill of kernel {} failed: {}", kernel_id, e);
                }
                child.wait().await
            }
        };

        match status {
            Ok(status) => tracing::info!("Kernel {} exited: {}", kernel_id, status),
            Err(e) => tracing::warn!("Failed to wait for kernel {}: {}", kernel_id, e),
        }

        state.mark_dead();
        let _ = exited.send(true);
    });
}

/// Decode records until the stream closes, broadcasting each message.
fn spawn_reader<R: tokio::io::AsyncRead + Unpin + Send + 'static>(
    mut reader: MessageReader<R>,
    kernel_id: String,
    state: Arc<KernelState>,
    fanout: Arc<OutputFanout>,
    process: Arc<dyn KernelIo>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reader.next_event().await {
                ReadEvent::Message(message) => {
                    tracing::debug!("Kernel {} -> {}", kernel_id, message.msg_type());
                    fanout.broadcast(&state, &message);
                }
                ReadEvent::Malformed(e) => {
                    if process.has_exited() {
                        state.mark_dead();
                        break;
                    }
                    tracing::warn!("Skipping malformed record from kernel {}: {}", kernel_id, e);
                }
                ReadEvent::Closed => break,
            }
        }
        tracing::debug!("Reader for kernel {} finished", kernel_id);
    })
}

/// Forward the kernel's stderr to the log, line by line.
fn drain_stderr(stderr: ChildStderr, kernel_id: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("kernel {} stderr: {}", kernel_id, line.trim_end());
        }
    });
}

fn cleanup_dirs(dirs: &KernelDirs) {
    if let Err(e) = dirs.remove() {
        tracing::warn!("Failed to remove {}: {}", dirs.root.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::sink;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Process stand-in that only reports whether it has exited.
    struct ExitedIo(AtomicBool);

    #[async_trait]
    impl KernelIo for ExitedIo {
        async fn send(&self, _directive: &Directive) -> Result<()> {
            Ok(())
        }

        async fn interrupt(&self) -> Result<()> {
            Ok(())
        }

        fn kill(&self) {}

        fn has_exited(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        async fn wait_exit(&self, _timeout: Duration) -> bool {
            self.has_exited()
        }
    }

    fn running_state() -> Arc<KernelState> {
        let state = Arc::new(KernelState::new());
        state.set_status(KernelStatus::Idle);
        state
    }

    fn reader(bytes: &'static [u8]) -> MessageReader<&'static [u8]> {
        MessageReader::new(bytes)
    }

    #[tokio::test]
    async fn test_ready_marker_marks_idle() {
        let mut reader =
            reader(b"{\"msg_id\":\"1\",\"msg_type\":\"status\",\"content\":{\"execution_state\":\"idle\"}}\n");
        let state = KernelState::new();
        await_ready(&mut reader, &state, "k", Duration::from_secs(1), ReadinessPolicy::Strict)
            .await
            .unwrap();
        assert_eq!(state.status(), KernelStatus::Idle);
    }

    #[tokio::test]
    async fn test_any_first_message_counts_as_ready() {
        let mut reader = reader(
            b"{\"msg_id\":\"1\",\"msg_type\":\"stream\",\"content\":{\"name\":\"stdout\",\"text\":\"banner\"}}\n",
        );
        let state = KernelState::new();
        await_ready(&mut reader, &state, "k", Duration::from_secs(1), ReadinessPolicy::Strict)
            .await
            .unwrap();
        assert_eq!(state.status(), KernelStatus::Idle);
    }

    #[tokio::test]
    async fn test_malformed_first_message_fails() {
        let mut reader = reader(b"garbage\n");
        let state = KernelState::new();
        let result =
            await_ready(&mut reader, &state, "k", Duration::from_secs(1), ReadinessPolicy::Optimistic).await;
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_timeout_policies() {
        // A duplex stream with no writer activity never yields a line.
        let (_keep, silent) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(silent);
        let state = KernelState::new();
        await_ready(&mut reader, &state, "k", Duration::from_millis(20), ReadinessPolicy::Optimistic)
            .await
            .unwrap();
        assert_eq!(state.status(), KernelStatus::Idle);

        let (_keep, silent) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(silent);
        let state = KernelState::new();
        let result =
            await_ready(&mut reader, &state, "k", Duration::from_millis(20), ReadinessPolicy::Strict).await;
        assert!(matches!(result, Err(Error::ReadinessTimeout { .. })));
        assert_eq!(state.status(), KernelStatus::Starting);
    }

    #[tokio::test]
    async fn test_reader_keeps_going_after_invalid_utf8() {
        let input: &'static [u8] = b"\xff\xfe\n\
            {\"msg_id\":\"2\",\"msg_type\":\"status\",\"content\":{\"execution_state\":\"busy\"}}\n";
        let state = running_state();
        let fanout = Arc::new(OutputFanout::new());
        let (tx, mut rx) = sink(4);
        fanout.subscribe("s1", tx);

        spawn_reader(
            MessageReader::new(input),
            "k".to_string(),
            state.clone(),
            fanout,
            Arc::new(ExitedIo(AtomicBool::new(false))),
        )
        .await
        .unwrap();

        let message = rx.try_recv().unwrap();
        assert_eq!(message.msg_id, "2");
        assert_eq!(state.status(), KernelStatus::Busy);
    }

    #[tokio::test]
    async fn test_malformed_line_after_exit_marks_dead() {
        let input: &'static [u8] = b"garbage\n\
            {\"msg_id\":\"2\",\"msg_type\":\"status\",\"content\":{\"execution_state\":\"busy\"}}\n";
        let state = running_state();
        let fanout = Arc::new(OutputFanout::new());
        let (tx, mut rx) = sink(4);
        fanout.subscribe("s1", tx);

        spawn_reader(
            MessageReader::new(input),
            "k".to_string(),
            state.clone(),
            fanout,
            Arc::new(ExitedIo(AtomicBool::new(true))),
        )
        .await
        .unwrap();

        assert!(state.is_dead());
        // The reader stopped at the bad line.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_nothing_behind() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = KernelConfig {
            runtime_dir: temp.path().to_path_buf(),
            ..KernelConfig::default()
        };
        let spec = KernelSpec::for_engine("/definitely/not/a/quill-engine");

        let result = launch(
            &spec,
            "k1",
            &config,
            Arc::new(KernelState::new()),
            Arc::new(OutputFanout::new()),
        )
        .await;

        assert!(matches!(result, Err(Error::Spawn { .. })));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_marks_dead() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = KernelConfig {
            runtime_dir: temp.path().to_path_buf(),
            ready_timeout: Duration::from_secs(5),
            ..KernelConfig::default()
        };
        // Emits the readiness marker then exits.
        let spec = KernelSpec {
            name: "echo".to_string(),
            display_name: "Echo".to_string(),
            language: "sh".to_string(),
            launch_argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"echo '{"msg_id":"r","msg_type":"status","content":{"execution_state":"idle"}}'"#
                    .to_string(),
            ],
            env: Default::default(),
        };
        let state = Arc::new(KernelState::new());

        let launched = launch(&spec, "k2", &config, state.clone(), Arc::new(OutputFanout::new()))
            .await
            .unwrap();

        assert!(launched.process.wait_exit(Duration::from_secs(5)).await);
        assert!(state.is_dead());
        launched.dirs.remove().unwrap();
    }
}

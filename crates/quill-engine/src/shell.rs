//! Shell escapes and shell cell directives.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{DirectiveError, EvalError, ExecError};
use crate::interrupt::InterruptFlag;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured output of one shell run.
#[derive(Debug, Default)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` if the process died from a signal.
    pub code: Option<i32>,
}

/// Run `script` with `program -c`, in `cwd`, with `env` layered over the
/// engine's environment.
///
/// A non-zero exit is not an error; its stderr is reported like any other
/// output. Raising `interrupt` kills the child.
pub fn run(
    program: &str,
    script: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    interrupt: InterruptFlag,
) -> Result<ShellOutput, ExecError> {
    // stdin is the engine's protocol channel; never hand it to a child.
    let mut child = Command::new(program)
        .arg("-c")
        .arg(script)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DirectiveError::Os(format!("cannot run {}: {}", program, e)))?;

    let stdout = child.stdout.take().map(collect);
    let stderr = child.stderr.take().map(collect);

    // On error the reader threads are left to finish on their own; a
    // grandchild may still hold the pipes open.
    let code = wait(&mut child, interrupt)?;

    let output = ShellOutput {
        stdout: join(stdout),
        stderr: join(stderr),
        code,
    };
    tracing::debug!("{} exited with {:?}", program, output.code);
    Ok(output)
}

fn wait(child: &mut Child, interrupt: InterruptFlag) -> Result<Option<i32>, ExecError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code()),
            Ok(None) => {}
            Err(e) => return Err(DirectiveError::Os(e.to_string()).into()),
        }
        if interrupt.is_raised() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EvalError::Interrupted.into());
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Drain a pipe on its own thread so neither pipe can fill and stall the child.
fn collect<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = pipe.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

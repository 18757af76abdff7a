//! Pluggable embedded scripting runtime.
//!
//! The engine only needs "run this program text, give me stdout/stderr and
//! whether it succeeded"; everything else (which interpreter, sandboxing) is
//! the implementation's business.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Result of one script invocation
#[derive(Debug, Clone, Default)]
pub struct RuntimeOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl RuntimeOutput {
    pub fn failure(message: impl Into<String>) -> Self {
        RuntimeOutput {
            stdout: String::new(),
            stderr: message.into(),
            success: false,
        }
    }
}

/// The embedded scripting runtime the executor hands substituted programs to
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    async fn run(&self, program: &str) -> RuntimeOutput;
}

/// Runs programs through an external interpreter process, bounded by a
/// wall-clock timeout. The program is piped on stdin so quoting in the
/// substituted text never collides with shell or argv quoting.
#[derive(Debug, Clone)]
pub struct InterpreterRuntime {
    bin: String,
    timeout: Duration,
}

impl InterpreterRuntime {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        InterpreterRuntime {
            bin: bin.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ScriptRuntime for InterpreterRuntime {
    async fn run(&self, program: &str) -> RuntimeOutput {
        let mut child = match Command::new(&self.bin)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return RuntimeOutput::failure(format!("failed to start {}: {e}", self.bin)),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(program.as_bytes()).await {
                return RuntimeOutput::failure(format!("failed to write program: {e}"));
            }
            // Drop closes the pipe so the interpreter sees EOF
        }

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => RuntimeOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                success: output.status.success(),
            },
            Ok(Err(e)) => RuntimeOutput::failure(format!("script process failed: {e}")),
            Err(_) => RuntimeOutput::failure(format!(
                "script timed out after {} ms",
                self.timeout.as_millis()
            )),
        }
    }
}

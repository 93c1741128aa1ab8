//! Bounded command execution
//!
//! Every external program wardend runs goes through [`run_command`]: no
//! shell, explicit argv, a hard timeout, and the child killed if the timeout
//! fires. Callers get the captured output or an [`ExecError`] and decide
//! what the failure means; nothing here retries.

use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Maximum bytes of stdout/stderr kept
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{program}: command not found")]
    NotFound { program: String },

    #[error("{program}: failed to spawn: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program}: timed out after {}ms", .timeout.as_millis())]
    Timeout { program: String, timeout: Duration },

    #[error("{program}: exited with {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Output of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Run `program args..` and wait at most `timeout` for it to exit.
///
/// A non-zero exit is an error; output is truncated to 64KB per stream.
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let start = Instant::now();
    debug!("exec: {} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ExecError::NotFound {
                    program: program.to_string(),
                }
            } else {
                ExecError::Spawn {
                    program: program.to_string(),
                    source,
                }
            }
        })?;

    // Dropping the wait future on timeout drops the child, which kills it
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(ExecError::Spawn {
                program: program.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(ExecError::Timeout {
                program: program.to_string(),
                timeout,
            })
        }
    };

    let stdout = truncate(&output.stdout);
    let stderr = truncate(&output.stderr);

    if !output.status.success() {
        return Err(ExecError::NonZeroExit {
            program: program.to_string(),
            code: output.status.code(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn truncate(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

//! Host process plumbing shared by the CLI-driven backends.

use crate::error::{BackendError, Result};
use crate::types::{OutputLine, OutputSender, OutputStream};
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Create a command that is killed if its future is dropped.
pub(crate) fn command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);
    cmd
}

/// Run to completion and capture stdout/stderr.
pub(crate) async fn captured(program: &str, cmd: &mut Command) -> Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    tracing::trace!(program, ?cmd, "Running host command");
    cmd.output().await.map_err(|e| spawn_error(program, e))
}

/// Run to completion, feeding `input` on stdin.
pub(crate) async fn with_stdin(program: &str, cmd: &mut Command, input: &[u8]) -> Result<Output> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    tracing::trace!(program, ?cmd, input_len = input.len(), "Running host command with stdin");
    let mut child = cmd.spawn().map_err(|e| spawn_error(program, e))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
        stdin.shutdown().await?;
    }
    Ok(child.wait_with_output().await?)
}

/// Run to completion, forwarding each output line as it is produced.
///
/// Returns the exit code, or -1 when the process was killed by a signal.
pub(crate) async fn streamed(program: &str, cmd: &mut Command, output: OutputSender) -> Result<i32> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    tracing::trace!(program, ?cmd, "Running streamed host command");
    let mut child = cmd.spawn().map_err(|e| spawn_error(program, e))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_tx = output.clone();
    let err_tx = output;

    let (status, (), ()) = tokio::join!(
        child.wait(),
        async move {
            if let Some(stdout) = stdout {
                forward_lines(stdout, OutputStream::Stdout, out_tx).await;
            }
        },
        async move {
            if let Some(stderr) = stderr {
                forward_lines(stderr, OutputStream::Stderr, err_tx).await;
            }
        },
    );

    Ok(status?.code().unwrap_or(-1))
}

/// Turn a non-zero exit into [`BackendError::Command`].
pub(crate) fn check(program: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    Err(BackendError::Command {
        program: program.to_string(),
        code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

fn spawn_error(program: &str, e: std::io::Error) -> BackendError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackendError::Unavailable(format!("{program} is not installed"))
    } else {
        BackendError::Io(e)
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, stream: OutputStream, output: OutputSender) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(|c| c == '\n' || c == '\r')
                    .to_string();
                // Keep draining even if nobody listens, so the child never blocks on a full pipe.
                let _ = output.send(OutputLine { stream, line });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

//! Subprocess execution with line-by-line result streaming.

use std::process::Stdio;
use std::time::Duration;

use mast_proto::{CommandOutcome, CommandResult, ResultMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as ProcessCommand;
use tracing::{error, info, warn};

use crate::sink::ResultSink;

/// Run one shell command, forwarding every line of combined stdout/stderr
/// to the sink as it arrives. Non-zero exits and spawn failures become
/// synthetic status lines, never errors; only sink failures propagate.
pub async fn execute(
    sink: &dyn ResultSink,
    batch_id: &str,
    command_id: u32,
    command: &str,
    elevated: bool,
    timeout: Duration,
) -> anyhow::Result<CommandOutcome> {
    let mut child = match spawn(command, elevated) {
        Ok(child) => child,
        Err(err) => {
            error!(%batch_id, command_id, %command, error = %err, "failed to spawn command");
            send_line(sink, batch_id, command_id, err.to_string()).await?;
            return Ok(CommandOutcome::Completed { exit_code: None });
        }
    };

    let mut stdout = child
        .stdout
        .take()
        .map(|out| BufReader::new(out).lines());
    let mut stderr = child
        .stderr
        .take()
        .map(|err| BufReader::new(err).lines());
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if stdout.is_none() && stderr.is_none() {
            break;
        }
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => {
                if let Some(line) = line {
                    send_line(sink, batch_id, command_id, line).await?;
                }
            }
            line = next_line(&mut stderr), if stderr.is_some() => {
                if let Some(line) = line {
                    send_line(sink, batch_id, command_id, line).await?;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(%batch_id, command_id, %command, timeout_secs = timeout.as_secs(), "command timed out, killing");
                let _ = child.kill().await;
                send_line(
                    sink,
                    batch_id,
                    command_id,
                    format!("command timed out after {}s and was killed", timeout.as_secs()),
                )
                .await?;
                return Ok(CommandOutcome::TimedOut);
            }
        }
    }

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            error!(%batch_id, command_id, error = %err, "failed to reap command");
            send_line(sink, batch_id, command_id, err.to_string()).await?;
            return Ok(CommandOutcome::Completed { exit_code: None });
        }
        Err(_) => {
            let _ = child.kill().await;
            send_line(
                sink,
                batch_id,
                command_id,
                format!("command timed out after {}s and was killed", timeout.as_secs()),
            )
            .await?;
            return Ok(CommandOutcome::TimedOut);
        }
    };

    let exit_code = status.code();
    match exit_code {
        Some(0) => info!(%batch_id, command_id, %command, "command succeeded"),
        other => {
            error!(%batch_id, command_id, %command, exit_code = ?other, "command failed");
            send_line(
                sink,
                batch_id,
                command_id,
                match other {
                    Some(code) => format!("command exited with status {code}"),
                    None => "command terminated by signal".to_string(),
                },
            )
            .await?;
        }
    }
    Ok(CommandOutcome::Completed { exit_code })
}

/// Elevated batches re-home the shell into the host's mount, PID, and
/// network namespaces. This grants unrestricted host access and is gated
/// strictly on the wildcard group upstream.
fn spawn(command: &str, elevated: bool) -> std::io::Result<tokio::process::Child> {
    let mut process = if elevated {
        let mut process = ProcessCommand::new("nsenter");
        process.args(["-t", "1", "-m", "-p", "-n", "--", "sh", "-c", command]);
        process
    } else {
        let mut process = ProcessCommand::new("sh");
        process.args(["-c", command]);
        process
    };
    process
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Pull the next line from an optional stream, clearing it on EOF or read
/// error so the select loop stops polling it.
async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<String> {
    let stream = lines.as_mut()?;
    match stream.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *lines = None;
            None
        }
        Err(err) => {
            warn!(error = %err, "error reading command output");
            *lines = None;
            None
        }
    }
}

async fn send_line(
    sink: &dyn ResultSink,
    batch_id: &str,
    command_id: u32,
    output: String,
) -> anyhow::Result<()> {
    sink.send(ResultMessage::Result(CommandResult {
        batch_id: batch_id.to_string(),
        command_id,
        output,
    }))
    .await
}

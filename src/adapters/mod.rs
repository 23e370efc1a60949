//! Production capability adapters.
//!
//! Every adapter translates its transport's failures into the error
//! taxonomy at the boundary; nothing untyped escapes. All subprocess
//! execution goes through [`run_command`], which enforces kill-on-drop and
//! bounded output capture.

mod agent_cli;
mod console;
mod ffmpeg;
mod fs_store;
mod system;
mod veo;
mod ytdlp;

pub use agent_cli::{AgentCliBackend, AgentCliDispatcher};
pub use console::ConsoleMessenger;
pub use ffmpeg::FfmpegProcessor;
pub use fs_store::FolderStore;
pub use system::{SysinfoProbe, SystemClock};
pub use veo::CommandGenerator;
pub use ytdlp::YtDlpDownloader;

use crate::error::{CapError, ToolKind};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Cap on captured stdout/stderr, to keep runaway subprocesses from eating
/// the memory envelope.
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// Output of one subprocess invocation.
pub(crate) struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.status_code == 0
    }

    /// Last line of stderr, for error messages.
    pub(crate) fn stderr_tail(&self) -> &str {
        self.stderr.lines().last().unwrap_or("").trim_ascii()
    }
}

/// Run a subprocess with optional stdin, capturing bounded output.
///
/// Spawn failures are `CapabilityUnavailable`; the caller interprets exit
/// codes.
pub(crate) async fn run_command(
    capability: &'static str,
    program: &str,
    args: &[String],
    stdin: Option<&str>,
) -> Result<CommandOutput, CapError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        CapError::tool(
            capability,
            ToolKind::CapabilityUnavailable,
            format!("failed to spawn {program}: {e}"),
        )
    })?;

    if let Some(payload) = stdin
        && let Some(mut handle) = child.stdin.take()
    {
        handle
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| CapError::transient(capability, format!("stdin write failed: {e}")))?;
        drop(handle);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| CapError::transient(capability, format!("wait failed: {e}")))?;

    let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    truncate_at_char_boundary(&mut stdout, MAX_CAPTURE_BYTES);
    let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    truncate_at_char_boundary(&mut stderr, MAX_CAPTURE_BYTES);

    Ok(CommandOutput {
        status_code: output.status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

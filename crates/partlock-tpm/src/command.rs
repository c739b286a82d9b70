//! Execution wrapper for tpm2-tools binaries.

use log::debug;
use std::process::{Command, Stdio};

pub(crate) struct ToolOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Run a tpm2-tools binary and capture raw stdout (NV contents and unsealed
/// data are binary).
pub(crate) fn run_tool(program: &str, args: &[String]) -> std::io::Result<ToolOutput> {
    debug!("running {program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    debug!(
        "{program} exited {:?} ({} stdout bytes): {}",
        output.status.code(),
        output.stdout.len(),
        stderr.trim()
    );

    Ok(ToolOutput {
        success: output.status.success(),
        stdout: output.stdout,
        stderr,
    })
}

//! Execution wrapper for the host binaries this crate drives.
//!
//! Keeps shell integration in one place so the driver logic stays testable
//! with fake binaries on PATH. Secrets are fed over stdin or the child
//! environment and never logged; log lines carry lengths only.

use log::debug;
use std::io::Write;
use std::process::{Command, Stdio};
use zeroize::Zeroizing;

/// Outcome of one subprocess run.
#[derive(Debug)]
pub(crate) struct CmdOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// Stdout followed by stderr, lossily decoded.
    pub output: String,
}

/// One subprocess invocation.
pub(crate) struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, Zeroizing<String>)>,
    stdin_secret: Option<Zeroizing<String>>,
}

impl Cmd {
    pub(crate) fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin_secret: None,
        }
    }

    pub(crate) fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pass a plain variable through the child environment.
    pub(crate) fn env(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secret_env(key, value)
    }

    /// Pass a secret through the child environment (e.g. `PASSWORD`).
    /// Indistinguishable from `env` except in intent: neither is logged.
    pub(crate) fn secret_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), Zeroizing::new(value.into())));
        self
    }

    /// Feed a secret on the child's standard input.
    pub(crate) fn stdin_secret(mut self, secret: impl Into<String>) -> Self {
        self.stdin_secret = Some(Zeroizing::new(secret.into()));
        self
    }

    pub(crate) fn run(self) -> std::io::Result<CmdOutput> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value.as_str());
        }
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if self.stdin_secret.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        debug!(
            "running {} {} (stdin: {} bytes)",
            self.program,
            self.args.join(" "),
            self.stdin_secret.as_ref().map_or(0, |s| s.len())
        );

        let mut child = command.spawn()?;
        if let Some(secret) = &self.stdin_secret {
            child
                .stdin
                .take()
                .expect("stdin was piped")
                .write_all(secret.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        debug!(
            "{} exited {:?}: {}",
            self.program,
            output.status.code(),
            combined.trim()
        );

        Ok(CmdOutput {
            success: output.status.success(),
            code: output.status.code(),
            output: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_combined_output_and_exit_code() {
        let result = Cmd::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .run()
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.code, Some(3));
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[test]
    fn feeds_stdin_secret() {
        let result = Cmd::new("sh")
            .args(["-c", "read line; test \"$line\" = sekrit"])
            .stdin_secret("sekrit\n")
            .run()
            .unwrap();
        assert!(result.success);
    }

    #[test]
    fn missing_binary_is_an_io_error() {
        assert!(Cmd::new("/no/such/binary").run().is_err());
    }
}

//! External command execution
//!
//! Tools without a maintained Rust client (kubeadm, helm, systemctl) are
//! invoked through [`CommandRunner`]. Arguments are always a structured list
//! handed straight to the process; nothing is ever passed through a shell.

use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Captured output of a successful command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
}

/// Trait abstracting process execution for testability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning its output.
    ///
    /// A non-zero exit status is reported as [`Error::Command`].
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Whether `program` exits successfully. Spawn failures count as "no".
    async fn succeeds(&self, program: &str, args: &[String]) -> bool {
        self.run(program, args).await.is_ok()
    }
}

/// [`CommandRunner`] that spawns real processes via tokio.
#[derive(Clone, Debug, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    /// Create a new runner
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program = %program, args = ?args, "Running command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Command {
                program: program.to_string(),
                args: args.to_vec(),
                status: "failed to spawn".to_string(),
                stderr: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(Error::Command {
                program: program.to_string(),
                args: args.to_vec(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

/// Build an owned argument list from string literals.
///
/// ```
/// use bootline_common::command::args;
///
/// assert_eq!(args(&["apply", "-f"]), vec!["apply".to_string(), "-f".to_string()]);
/// ```
pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_of_successful_command() {
        let out = SystemCommandRunner::new()
            .run("echo", &args(&["hello", "world"]))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello world");
    }

    #[tokio::test]
    async fn arguments_are_not_shell_interpreted() {
        let out = SystemCommandRunner::new()
            .run("echo", &args(&["$(whoami); rm -rf /"]))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "$(whoami); rm -rf /");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_command_error() {
        let err = SystemCommandRunner::new()
            .run("false", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { ref program, .. } if program == "false"));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_program_does_not_succeed() {
        let runner = SystemCommandRunner::new();
        assert!(!runner.succeeds("bootline-no-such-binary", &[]).await);
        assert!(runner.succeeds("true", &[]).await);
    }
}

//! Child-process launching.
//!
//! The converter is always started through a [`ProcessLauncher`], which
//! guarantees three things on every platform:
//!
//! 1. arguments reach the child as a literal vector, never through a shell;
//! 2. standard error is captured in full;
//! 3. the exit status is retrievable.
//!
//! [`TokioLauncher`] is the real implementation. Tests substitute a counting
//! mock to observe that validation failures start no process at all.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Suppresses the console window of the child on Windows.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// What a finished child process reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Starts a program and waits for it to exit.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run `program` with `args` and wait for it to terminate.
    ///
    /// Returns `Err` only when the process could not be started or waited
    /// on. A nonzero exit is a successful launch with `success == false`.
    async fn launch(&self, program: &Path, args: &[OsString]) -> std::io::Result<ProcessOutput>;
}

/// Launches real processes via `tokio::process`.
///
/// Standard input and output are detached, standard error is piped and
/// drained while waiting. The child is killed if the awaiting future is
/// dropped, so an abandoned conversion never outlives its caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, program: &Path, args: &[OsString]) -> std::io::Result<ProcessOutput> {
        debug!(program = %program.display(), ?args, "Spawning converter");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd.spawn()?;
        let output = child.wait_with_output().await?;

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stderr_and_exit_code() {
        let args: Vec<OsString> = vec!["-c".into(), "echo 'bad header' >&2; exit 3".into()];
        let out = TokioLauncher.launch(Path::new("/bin/sh"), &args).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success);
        assert_eq!(out.stderr.trim(), "bad header");
    }

    #[tokio::test]
    async fn arguments_are_not_shell_interpreted() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("pwned");
        // Passed as a literal argument to `echo`: nothing may be executed.
        let hostile = format!("x; touch {}", marker.display());
        let out = TokioLauncher
            .launch(Path::new("/bin/echo"), &[hostile.into()])
            .await
            .unwrap();
        assert!(out.success);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let err = TokioLauncher
            .launch(Path::new("/nonexistent/texconv"), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}

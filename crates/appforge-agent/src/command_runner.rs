//! Thin wrapper around external command-line tools.
//!
//! Every container runtime interaction goes through [`CommandRunner`], so the
//! lifecycle code can be exercised against a scripted runner in tests.

use std::{io, process::Stdio};

use futures_util::future::BoxFuture;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {}: {stderr}", describe_exit(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "signal".to_string(),
    }
}

impl CommandError {
    pub fn stderr(&self) -> &str {
        match self {
            Self::Spawn { .. } => "",
            Self::Failed { stderr, .. } => stderr,
        }
    }
}

pub trait CommandRunner: Send + Sync + 'static {
    /// Run to completion and capture both streams.
    ///
    /// Non-zero exit is an error carrying the captured stderr. There is no
    /// timeout: callers must not route long-running commands through here.
    fn output<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
    ) -> BoxFuture<'a, Result<CommandOutput, CommandError>>;

    /// Like [`CommandRunner::output`] but returns trimmed stdout only.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
    ) -> BoxFuture<'a, Result<String, CommandError>> {
        Box::pin(async move {
            let out = self.output(program, args).await?;
            Ok(out.stdout.trim().to_string())
        })
    }
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    fn output<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
    ) -> BoxFuture<'a, Result<CommandOutput, CommandError>> {
        Box::pin(async move {
            tracing::debug!(program, ?args, "run command");
            let out = tokio::process::Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|source| CommandError::Spawn {
                    program: program.to_string(),
                    source,
                })?;

            let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
            if !out.status.success() {
                return Err(CommandError::Failed {
                    program: program.to_string(),
                    code: out.status.code(),
                    stderr: stderr.trim().to_string(),
                });
            }
            Ok(CommandOutput { stdout, stderr })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn run_returns_trimmed_stdout() {
        let out = TokioCommandRunner
            .run("sh", &args(&["-c", "echo '  hello  '"]))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = TokioCommandRunner
            .run("sh", &args(&["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        match &err {
            CommandError::Failed { code, stderr, .. } => {
                assert_eq!(*code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.stderr(), "boom");
        assert!(err.to_string().contains("exited with 3"));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = TokioCommandRunner
            .run("/definitely/not/a/binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn output_keeps_both_streams() {
        let out = TokioCommandRunner
            .output("sh", &args(&["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }
}

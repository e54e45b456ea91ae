use std::io;
use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Seam around external transcoder invocations so tests can substitute
/// scripted executors for the real binaries.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs the command to completion, collecting stdout and stderr.
    async fn run(&self, command: &mut Command) -> io::Result<Output>;

    /// Runs the command while forwarding stdout line by line to `lines`.
    /// Stderr is captured and returned in the output; stdout in the returned
    /// output is empty since it has already been streamed.
    async fn run_streaming(
        &self,
        command: &mut Command,
        lines: mpsc::Sender<String>,
    ) -> io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> io::Result<Output> {
        // The caller may abandon the future on a wall-clock ceiling; the
        // child must not outlive it.
        command.kill_on_drop(true);
        command.output().await
    }

    async fn run_streaming(
        &self,
        command: &mut Command,
        lines: mpsc::Sender<String>,
    ) -> io::Result<Output> {
        command
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stderr not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buffer = Vec::new();
            let _ = stderr.read_to_end(&mut buffer).await;
            buffer
        });

        let mut reader = BufReader::new(stdout).lines();
        let mut receiver_gone = false;
        while let Some(line) = reader.next_line().await? {
            if receiver_gone {
                continue;
            }
            if lines.send(line).await.is_err() {
                receiver_gone = true;
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(Output {
            status,
            stdout: Vec::new(),
            stderr,
        })
    }
}

/// Renders a command line for failure messages and debug logs.
pub fn command_line(program: &Path, args: &[String]) -> String {
    format!("{} {}", program.display(), args.join(" "))
}

/// Last few lines of a stderr capture, enough to diagnose a failure without
/// dumping the whole transcoder log into an error value.
pub fn stderr_excerpt(stderr: &[u8]) -> String {
    const MAX_LINES: usize = 6;
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(MAX_LINES);
    lines[start..].join("\n")
}

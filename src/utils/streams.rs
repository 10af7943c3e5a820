// src/utils/streams.rs
use std::fs::File;
use std::io;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::utils::command::ToolCommand;
use crate::utils::file::append_file;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

/// Collects every line a child writes to one of its output streams.
///
/// # Arguments
///
/// * `child` - Spawned process with the requested stream piped.
/// * `stream` - Which stream to drain.
///
/// # Returns
/// The lines, without terminators.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let lines: Vec<io::Result<String>> = match stream {
        ChildStream::Stdout => {
            let out = child.stdout.take().ok_or_else(|| anyhow!("Child stdout is not piped"))?;
            LinesStream::new(BufReader::new(out).lines()).collect().await
        }
        ChildStream::Stderr => {
            let err = child.stderr.take().ok_or_else(|| anyhow!("Child stderr is not piped"))?;
            LinesStream::new(BufReader::new(err).lines()).collect().await
        }
    };
    Ok(lines.into_iter().collect::<io::Result<Vec<String>>>()?)
}

/// Runs one external command to completion.
pub async fn run_command(command: &ToolCommand, stdout: Option<&Path>, stderr: Option<&Path>) -> Result<()> {
    run_chain(std::slice::from_ref(command), stdout, stderr).await
}

/// Runs commands as a shell-style pipeline (`a | b | c`). The first reads
/// nothing, the last writes to `stdout` (or nowhere), and every stage appends
/// its stderr to `stderr`. When both name the same file, stdout is appended
/// there as well. Each exit status is checked.
///
/// # Arguments
///
/// * `commands` - Pipeline stages in order.
/// * `stdout` - File receiving the last stage's stdout; truncated first.
/// * `stderr` - Log file receiving every stage's stderr.
///
/// # Returns
/// Ok once all stages exit successfully.
pub async fn run_chain(commands: &[ToolCommand], stdout: Option<&Path>, stderr: Option<&Path>) -> Result<()> {
    if commands.is_empty() {
        return Ok(());
    }
    let stderr_file = match stderr {
        Some(path) => Some(append_file(path)?),
        None => None,
    };

    let last = commands.len() - 1;
    let mut children: Vec<(&ToolCommand, Child)> = Vec::with_capacity(commands.len());
    let mut upstream: Option<ChildStdout> = None;

    for (i, tool_command) in commands.iter().enumerate() {
        let mut command = Command::new(&tool_command.program);
        command.args(&tool_command.args).kill_on_drop(true);

        let stdin: Stdio = match upstream.take() {
            Some(out) => out.try_into()?,
            None => Stdio::null(),
        };
        command.stdin(stdin);

        let out: Stdio = if i < last {
            Stdio::piped()
        } else {
            match (stdout, &stderr_file) {
                (Some(path), Some(file)) if stderr == Some(path) => Stdio::from(file.try_clone()?),
                (Some(path), _) => Stdio::from(File::create(path)?),
                (None, _) => Stdio::null(),
            }
        };
        command.stdout(out);

        let err: Stdio = match &stderr_file {
            Some(file) => Stdio::from(file.try_clone()?),
            None => Stdio::null(),
        };
        command.stderr(err);

        debug!("Running: {}", tool_command);
        let mut child = command
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}", tool_command.program.display(), e))?;
        if i < last {
            upstream = child.stdout.take();
        }
        children.push((tool_command, child));
    }

    let mut failures = Vec::new();
    for (tool_command, mut child) in children {
        let status = child.wait().await?;
        if !status.success() {
            failures.push(format!("{} exited with {}", tool_command.tool, status));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(failures.join("; ")))
    }
}

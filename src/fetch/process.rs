//! Running an external download tool with timeouts and cancellation.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Output lines kept for failure diagnosis.
const TAIL_LINES: usize = 40;

/// Time allowed for output readers to drain after the tool exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// No-progress limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    /// Allowed time before the first progress line.
    pub start_timeout: Duration,
    /// Allowed time between progress lines once transfer has started.
    pub stall_timeout: Duration,
    /// Time a killed tool gets to exit.
    pub kill_grace: Duration,
}

/// How the tool run ended.
#[derive(Debug)]
pub enum ToolExit {
    Success,
    Failed { code: Option<i32> },
    Cancelled,
    /// No progress within the active timeout.
    TimedOut { started: bool, after: Duration },
    /// The program could not be started at all.
    SpawnFailed(io::Error),
}

/// Result of a tool run.
#[derive(Debug)]
pub struct ToolRun {
    pub exit: ToolExit,
    /// Last output lines, oldest first.
    pub tail: Vec<String>,
}

/// Runs `command` until it exits, times out or is cancelled.
///
/// Every stdout and stderr record (split on `\n` or `\r`) is passed to
/// `on_line`, which returns true when the line showed real progress. The
/// first such line switches the idle limit from the start timeout to the
/// stall timeout; every later one pushes the deadline out again.
pub async fn run_tool<F>(
    command: &ToolCommand,
    policy: RunPolicy,
    cancel: &CancellationToken,
    mut on_line: F,
) -> ToolRun
where
    F: FnMut(&str) -> bool + Send,
{
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.cwd {
        cmd.current_dir(dir);
    }

    log::debug!("Spawning {} {}", command.program, command.args.join(" "));
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ToolRun {
                exit: ToolExit::SpawnFailed(e),
                tail: Vec::new(),
            };
        }
    };

    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_records(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_records(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let mut started = false;
    let mut limit = policy.start_timeout;
    let mut deadline = Instant::now() + limit;
    let mut lines_open = true;

    let exit = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                terminate(&mut child, policy.kill_grace).await;
                break ToolExit::Cancelled;
            }
            () = sleep_until(deadline) => {
                log::warn!("{} made no progress for {}s", command.program, limit.as_secs());
                terminate(&mut child, policy.kill_grace).await;
                break ToolExit::TimedOut { started, after: limit };
            }
            line = line_rx.recv(), if lines_open => match line {
                Some(line) => {
                    if on_line(&line) {
                        started = true;
                        limit = policy.stall_timeout;
                        deadline = Instant::now() + limit;
                    }
                    push_tail(&mut tail, line);
                }
                None => lines_open = false,
            },
            status = child.wait() => {
                break match status {
                    Ok(status) if status.success() => ToolExit::Success,
                    Ok(status) => {
                        log::debug!("{} exited with {status}", command.program);
                        ToolExit::Failed { code: status.code() }
                    }
                    Err(e) => {
                        log::error!("Error waiting for {}: {e}", command.program);
                        ToolExit::Failed { code: None }
                    }
                };
            }
        }
    };

    // Whatever the tool printed right before exiting matters most for diagnosis.
    if lines_open {
        let drain = async {
            while let Some(line) = line_rx.recv().await {
                on_line(&line);
                push_tail(&mut tail, line);
            }
        };
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
    }

    ToolRun {
        exit,
        tail: tail.into(),
    }
}

/// Runs `program --version` and returns the first line it prints.
///
/// # Errors
///
/// Returns [`Error::ToolUnavailable`] if the tool cannot be started or
/// exits unsuccessfully.
pub async fn check_tool(program: &str) -> Result<String> {
    let unavailable = |reason: String| Error::ToolUnavailable {
        tool: program.to_string(),
        reason,
    };
    let version = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(Duration::from_secs(10), version)
        .await
        .map_err(|_| unavailable("timed out".to_string()))?
        .map_err(|e| unavailable(e.to_string()))?;
    if !output.status.success() {
        return Err(unavailable(format!("--version exited with {}", output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    log::trace!("tool: {line}");
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

async fn terminate(child: &mut Child, grace: Duration) {
    if let Err(e) = child.start_kill() {
        log::debug!("Kill failed (already exited?): {e}");
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        log::error!("Tool did not exit within {}s of being killed", grace.as_secs());
    }
}

async fn forward_records<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut records = RecordReader::new(reader);
    loop {
        match records.next_record().await {
            Ok(Some(record)) => {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("Output read error: {e}");
                break;
            }
        }
    }
}

/// Longest record kept; a longer run without a delimiter is split.
const MAX_RECORD: usize = 64 * 1024;

/// Yields text records delimited by `\n` or `\r`.
///
/// Download tools redraw their progress line with bare carriage returns, so
/// newline-only splitting would surface progress late or not at all.
pub struct RecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    scratch: [u8; 4096],
}

impl<R> RecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            scratch: [0u8; 4096],
        }
    }

    /// Returns the next non-empty, trimmed record, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the underlying stream fails.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            let delimiter = self
                .pending
                .iter()
                .position(|&b| b == b'\n' || b == b'\r')
                .filter(|&idx| idx <= MAX_RECORD);
            if let Some(idx) = delimiter {
                let record: Vec<u8> = self.pending.drain(..idx).collect();
                let delimiters = self
                    .pending
                    .iter()
                    .take_while(|&&b| b == b'\n' || b == b'\r')
                    .count();
                self.pending.drain(..delimiters);

                let record = String::from_utf8_lossy(&record).trim().to_string();
                if !record.is_empty() {
                    return Ok(Some(record));
                }
                continue;
            }
            if self.pending.len() >= MAX_RECORD {
                let record: Vec<u8> = self.pending.drain(..MAX_RECORD).collect();
                let record = String::from_utf8_lossy(&record).trim().to_string();
                if !record.is_empty() {
                    return Ok(Some(record));
                }
                continue;
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                let record = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                return Ok((!record.is_empty()).then_some(record));
            }
            self.pending.extend_from_slice(&self.scratch[..n]);
        }
    }
}

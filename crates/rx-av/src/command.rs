//! Builder for executing external tool commands with cancellation support.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// A builder for constructing and executing external tool invocations.
///
/// Long-running invocations (transcodes, frame dumps) carry the run's
/// [`CancellationToken`]; when it fires the child is killed and the call
/// returns [`rx_core::Error::Cancelled`].
///
/// # Example
///
/// ```no_run
/// use rx_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> rx_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .arg("-v").arg("quiet")
///     .arg("-print_format").arg("json")
///     .arg("-show_format")
///     .arg("-show_streams")
///     .arg("/path/to/video.mkv")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: None,
            cancel: None,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = Some(d);
        self
    }

    /// Kill the process when `token` is cancelled.
    pub fn cancel_token(&mut self, token: CancellationToken) -> &mut Self {
        self.cancel = Some(token);
        self
    }

    /// The arguments collected so far.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// - [`rx_core::Error::Cancelled`] if the cancel token fires first.
    /// - [`rx_core::Error::Tool`] on timeout, spawn failure, or a non-zero
    ///   exit status (message includes stderr).
    pub async fn execute(&self) -> rx_core::Result<ToolOutput> {
        self.execute_with_line_callback(|_| {}).await
    }

    /// Execute the command, invoking `on_line` for every stdout line as it
    /// arrives. Used with ffmpeg's `-progress pipe:1`.
    pub async fn execute_with_line_callback<F>(&self, mut on_line: F) -> rx_core::Result<ToolOutput>
    where
        F: FnMut(&str) + Send,
    {
        let program_name = self.program_name();

        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(rx_core::Error::Cancelled);
            }
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(tool = %program_name, args = ?self.args, "spawning");

        let mut child = cmd.spawn().map_err(|e| rx_core::Error::Tool {
            tool: program_name.clone(),
            message: format!("failed to spawn: {e}"),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| rx_core::Error::Tool {
            tool: program_name.clone(),
            message: "stdout not captured".into(),
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| rx_core::Error::Tool {
            tool: program_name.clone(),
            message: "stderr not captured".into(),
        })?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).to_string()
        });

        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut collected = String::new();
            while let Some(line) = lines.next_line().await? {
                on_line(&line);
                collected.push_str(&line);
                collected.push('\n');
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, collected))
        };

        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let deadline = async {
            match self.timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            res = run => res,
            _ = cancelled => {
                tracing::debug!(tool = %program_name, "cancel requested, killing process");
                stderr_task.abort();
                return Err(rx_core::Error::Cancelled);
            }
            _ = deadline => {
                stderr_task.abort();
                return Err(rx_core::Error::Tool {
                    tool: program_name,
                    message: format!("timed out after {:?}", self.timeout.unwrap_or_default()),
                });
            }
        };
        // The child future was dropped on the early-return paths above, and
        // `kill_on_drop` reaps the process.

        let (status, stdout) = result.map_err(|e| rx_core::Error::Tool {
            tool: program_name.clone(),
            message: format!("I/O error waiting for process: {e}"),
        })?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(rx_core::Error::Tool {
                tool: program_name,
                message: format!("exited with status {status}: {}", last_lines(&stderr, 5)),
            });
        }

        Ok(ToolOutput {
            status,
            stdout,
            stderr,
        })
    }
}

/// The trailing `n` non-empty lines of `text`, joined by newlines.
fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

//! Subprocess execution - run one shell command, stream captured output
//!
//! The command runs under `sh -c` in the configured working directory with
//! stdout and stderr piped. A select loop reads bounded chunks from both
//! pipes and hands each one to the consumer in per-stream FIFO order, so
//! subscribers see output exactly as the command produced it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

/// Bytes read from a pipe per wake-up.
const READ_CHUNK: usize = 4096;

/// Exit classification of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Succeeded,
    Failed,
    Interrupted,
    Unknown,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Succeeded => "SUCCEEDED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Interrupted => "INTERRUPTED",
            CommandStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives the captured output of running commands.
pub trait StreamConsumer: Send + Sync {
    fn write_stdout(&self, cmd_id: u32, chunk: &[u8]);
    fn write_stderr(&self, cmd_id: u32, chunk: &[u8]);
}

/// One shell command bound to a command id.
pub struct SubProcess {
    command: String,
    working_dir: PathBuf,
    id: u32,
}

impl SubProcess {
    pub fn new(command: String, working_dir: impl AsRef<Path>, id: u32) -> Self {
        Self {
            command,
            working_dir: working_dir.as_ref().to_path_buf(),
            id,
        }
    }

    /// Run the command to completion, delivering output chunks to
    /// `consumer`. When the interrupt flag flips the child is killed and
    /// the run reports `Interrupted`.
    pub async fn run(
        &self,
        consumer: &dyn StreamConsumer,
        interrupt: &mut watch::Receiver<bool>,
    ) -> Result<CommandStatus> {
        debug!("spawning [{}] {}", self.id, self.command);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning '{}'", self.command))?;

        let mut stdout = child.stdout.take().context("child stdout not piped")?;
        let mut stderr = child.stderr.take().context("child stderr not piped")?;

        // Armed until the child is killed or the interrupt sender is gone.
        let mut armed = true;
        // Close the race where the flag flipped before we spawned.
        if *interrupt.borrow() {
            child.start_kill().ok();
            armed = false;
        }

        let mut out_buf = [0u8; READ_CHUNK];
        let mut err_buf = [0u8; READ_CHUNK];
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                r = stdout.read(&mut out_buf), if out_open => {
                    match r.context("reading child stdout")? {
                        0 => out_open = false,
                        n => consumer.write_stdout(self.id, &out_buf[..n]),
                    }
                }
                r = stderr.read(&mut err_buf), if err_open => {
                    match r.context("reading child stderr")? {
                        0 => err_open = false,
                        n => consumer.write_stderr(self.id, &err_buf[..n]),
                    }
                }
                r = interrupt.changed(), if armed => {
                    if r.is_err() {
                        armed = false;
                    } else if *interrupt.borrow() {
                        child.start_kill().ok();
                        armed = false;
                    }
                }
            }
        }

        // Pipes are closed; reap the child, still honoring a late interrupt.
        let status = loop {
            tokio::select! {
                s = child.wait() => break s.context("waiting for child")?,
                r = interrupt.changed(), if armed => {
                    if r.is_err() {
                        armed = false;
                    } else if *interrupt.borrow() {
                        child.start_kill().ok();
                        armed = false;
                    }
                }
            }
        };

        Ok(classify(status))
    }
}

#[cfg(unix)]
fn classify(status: std::process::ExitStatus) -> CommandStatus {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(0) => CommandStatus::Succeeded,
        Some(_) => CommandStatus::Failed,
        None if status.signal().is_some() => CommandStatus::Interrupted,
        None => CommandStatus::Unknown,
    }
}

#[cfg(not(unix))]
fn classify(status: std::process::ExitStatus) -> CommandStatus {
    match status.code() {
        Some(0) => CommandStatus::Succeeded,
        Some(_) => CommandStatus::Failed,
        None => CommandStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Collects chunks in memory, like the stream server would.
    #[derive(Default)]
    pub struct BufferConsumer {
        pub stdout: Mutex<Vec<u8>>,
        pub stderr: Mutex<Vec<u8>>,
    }

    impl StreamConsumer for BufferConsumer {
        fn write_stdout(&self, _cmd_id: u32, chunk: &[u8]) {
            self.stdout.lock().unwrap().extend_from_slice(chunk);
        }
        fn write_stderr(&self, _cmd_id: u32, chunk: &[u8]) {
            self.stderr.lock().unwrap().extend_from_slice(chunk);
        }
    }

    fn no_interrupt() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    async fn run(cmd: &str) -> (CommandStatus, String, String) {
        let consumer = BufferConsumer::default();
        let (_tx, mut rx) = no_interrupt();
        let process = SubProcess::new(cmd.to_string(), ".", 0);
        let status = process.run(&consumer, &mut rx).await.unwrap();
        let stdout = String::from_utf8(consumer.stdout.into_inner().unwrap()).unwrap();
        let stderr = String::from_utf8(consumer.stderr.into_inner().unwrap()).unwrap();
        (status, stdout, stderr)
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let (status, stdout, stderr) = run("echo -n To STDOUT").await;
        assert_eq!(status, CommandStatus::Succeeded);
        assert_eq!(stdout, "To STDOUT");
        assert_eq!(stderr, "");
    }

    #[tokio::test]
    async fn test_captures_stderr() {
        let (status, stdout, stderr) = run("echo -n To STDERR >&2").await;
        assert_eq!(status, CommandStatus::Succeeded);
        assert_eq!(stdout, "");
        assert_eq!(stderr, "To STDERR");
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let (status, stdout, stderr) = run("echo -n To STDOUT >&1 ; echo -n To STDERR >&2").await;
        assert_eq!(status, CommandStatus::Succeeded);
        assert_eq!(stdout, "To STDOUT");
        assert_eq!(stderr, "To STDERR");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let (status, _, _) = run("false").await;
        assert_eq!(status, CommandStatus::Failed);

        let (status, _, _) = run("exit 3").await;
        assert_eq!(status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn test_interrupt_kills_child() {
        let consumer = BufferConsumer::default();
        let (tx, mut rx) = no_interrupt();
        let process = SubProcess::new("sleep 30".to_string(), ".", 0);

        let killer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send_replace(true);
            tx
        });

        let started = std::time::Instant::now();
        let status = process.run(&consumer, &mut rx).await.unwrap();
        assert_eq!(status, CommandStatus::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
        killer.await.unwrap();
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("probe"), "here").unwrap();
        let consumer = BufferConsumer::default();
        let (_tx, mut rx) = no_interrupt();
        let process = SubProcess::new("cat probe".to_string(), dir.path(), 7);
        let status = process.run(&consumer, &mut rx).await.unwrap();
        assert_eq!(status, CommandStatus::Succeeded);
        assert_eq!(&*consumer.stdout.lock().unwrap(), b"here");
    }
}

//! PTY-backed subprocess handle.
//!
//! Output is read on a dedicated thread and forwarded over an unbounded
//! channel. The exit notification is published only after the reader has
//! hit EOF (or a short drain deadline has passed), so no trailing output is
//! lost between "process exited" and "last bytes delivered".

use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::error::{SessionError, SessionResult};

/// How long the exit waiter lets the reader drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_BUF_SIZE: usize = 8192;

/// A program invocation: executable, arguments, working directory, environment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Variables removed from the inherited environment.
    pub unset: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn envs(mut self, env: &HashMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.unset.push(key.into());
        self
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Code(u32),
    Signal(String),
    /// The exit could not be observed (waiter failed).
    Unknown,
}

impl ExitReason {
    pub fn success(&self) -> bool {
        matches!(self, ExitReason::Code(0))
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Code(code) => write!(f, "exit code {code}"),
            ExitReason::Signal(sig) => write!(f, "signal {sig}"),
            ExitReason::Unknown => write!(f, "unknown exit"),
        }
    }
}

/// One running subprocess on its own pseudo-terminal.
pub struct ProcessHandle {
    program: String,
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    output: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    exit_rx: watch::Receiver<Option<ExitReason>>,
}

impl ProcessHandle {
    /// Spawn `spec` on a new PTY of `cols`×`rows` cells.
    pub fn start(spec: &LaunchSpec, cols: u16, rows: u16) -> SessionResult<Self> {
        let program = spec.program.clone();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::spawn_failed(&program, &e))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        for key in &spec.unset {
            cmd.env_remove(key);
        }
        if std::env::var_os("TERM").is_none() && !spec.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::spawn_failed(&program, &e))?;
        // The reader only sees EOF once every slave fd is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::spawn_failed(&program, &e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::spawn_failed(&program, &e))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name(format!("pty-read-{}", pid.unwrap_or_default()))
            .spawn(move || {
                Self::reader_loop(reader, out_tx);
                drop(done_tx);
            })
            .map_err(|e| SessionError::spawn_failed(&program, &e))?;

        let wait_program = program.clone();
        std::thread::Builder::new()
            .name(format!("pty-wait-{}", pid.unwrap_or_default()))
            .spawn(move || {
                let reason = match child.wait() {
                    Ok(status) => match status.signal() {
                        Some(sig) => ExitReason::Signal(sig.to_string()),
                        None => ExitReason::Code(status.exit_code()),
                    },
                    Err(e) => {
                        tracing::warn!(program = %wait_program, error = %e, "wait failed");
                        ExitReason::Unknown
                    }
                };
                // Drain: the reader closes `done_tx` at EOF.
                let _ = done_rx.recv_timeout(DRAIN_TIMEOUT);
                tracing::debug!(program = %wait_program, %reason, "process exited");
                let _ = exit_tx.send(Some(reason));
            })
            .map_err(|e| SessionError::spawn_failed(&program, &e))?;

        tracing::info!(program = %program, pid = ?pid, "process started");

        Ok(Self {
            program,
            pid,
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            output: Mutex::new(Some(out_rx)),
            exit_rx,
        })
    }

    fn reader_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Vec<u8>>) {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    // Keep draining even when nobody listens.
                    let _ = tx.send(buf[..n].to_vec());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the output stream. Only the first caller receives it; the stream
    /// ends once the process output reaches EOF.
    pub fn take_output(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.output.lock().take()
    }

    /// Write raw bytes to the process input.
    pub fn write(&self, data: &[u8]) -> SessionResult<()> {
        if self.has_exited() {
            return Err(SessionError::ChannelClosed);
        }
        let mut writer = self.writer.lock();
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|_| SessionError::ChannelClosed)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> SessionResult<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|_| SessionError::ChannelClosed)
    }

    pub fn exit_status(&self) -> Option<ExitReason> {
        self.exit_rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// A receiver that flips to `Some` once the process has exited and its
    /// output has been drained.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitReason>> {
        self.exit_rx.clone()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ExitReason {
        wait_exit(self.exit_rx.clone()).await
    }

    /// Hang up, then kill after `grace`. Returns `None` if the process is
    /// still not observed as exited after the forceful kill.
    pub async fn terminate(&self, grace: Duration) -> Option<ExitReason> {
        if let Some(reason) = self.exit_status() {
            return Some(reason);
        }

        self.hangup();
        if let Ok(reason) = tokio::time::timeout(grace, self.wait()).await {
            return Some(reason);
        }

        tracing::warn!(program = %self.program, pid = ?self.pid, "grace period elapsed, killing");
        self.kill();
        tokio::time::timeout(grace, self.wait()).await.ok()
    }

    /// Forcefully kill the process.
    pub fn kill(&self) {
        if let Err(e) = self.killer.lock().kill() {
            tracing::debug!(program = %self.program, error = %e, "kill failed");
        }
    }

    fn hangup(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SIGHUP ends interactive shells, which ignore SIGINT/SIGTERM.
            unsafe {
                libc::kill(pid as i32, libc::SIGHUP);
            }
            return;
        }
        self.kill();
    }
}

/// Resolve once the watched process has exited.
pub async fn wait_exit(mut rx: watch::Receiver<Option<ExitReason>>) -> ExitReason {
    let got = rx
        .wait_for(Option::is_some)
        .await
        .map(|reason| reason.clone())
        .ok()
        .flatten();
    got.or_else(|| rx.borrow().clone())
        .unwrap_or(ExitReason::Unknown)
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.kill();
        }
    }
}

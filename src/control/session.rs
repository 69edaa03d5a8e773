//! A live tmux control-mode client: subprocess, reader task, command
//! channel and parsed snapshot.

use parking_lot::{Mutex, RwLock};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::control::channel::CommandChannel;
use crate::control::commands::{self, ControlCommand};
use crate::control::parser::{ControlEvent, ControlParser, PaneOutput, SharedSnapshot};
use crate::control::protocol::{PaneId, Reply};
use crate::control::snapshot::{PaneInfo, PaneTitle, Snapshot, WindowInfo};
use crate::error::{SessionError, SessionResult};
use crate::process::LaunchSpec;

const READ_BUF_SIZE: usize = 8192;

/// Connection state as seen by the reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Waiting for tmux to finish the command it was launched with.
    Starting,
    Ready,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub handshake_timeout: Duration,
    pub command_timeout: Duration,
    pub cols: u16,
    pub rows: u16,
    pub event_capacity: usize,
    pub output_capacity: usize,
}

impl ControlOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            command_timeout: config.command_timeout(),
            cols: config.default_cols,
            rows: config.default_rows,
            event_capacity: config.output_buffer.max(16),
            output_capacity: config.output_buffer.max(16),
        }
    }
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct ControlSession {
    pid: Option<u32>,
    channel: Arc<CommandChannel>,
    snapshot: SharedSnapshot,
    events: broadcast::Sender<ControlEvent>,
    output: Mutex<Option<mpsc::Receiver<PaneOutput>>>,
    link: watch::Receiver<LinkState>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Vec<JoinHandle<()>>,
    options: ControlOptions,
}

impl ControlSession {
    /// Launch `spec` (a `tmux -C ...` invocation) and complete the handshake.
    pub async fn spawn(
        spec: &LaunchSpec,
        session: &str,
        options: ControlOptions,
    ) -> SessionResult<Self> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for key in &spec.unset {
            cmd.env_remove(key);
        }
        cmd.envs(&spec.env);

        let mut child = cmd
            .spawn()
            .map_err(|e| SessionError::spawn_failed(&spec.program, &e))?;
        let stdin = child.stdin.take().ok_or(SessionError::ChannelClosed)?;
        let stdout = child.stdout.take().ok_or(SessionError::ChannelClosed)?;
        tracing::debug!(session, pid = ?child.id(), "control client started");

        Self::from_streams(session, stdout, stdin, Some(child), options).await
    }

    /// Build a session over existing streams. `child`, when given, is
    /// reaped on [`detach`](Self::detach).
    pub async fn from_streams<R, W>(
        session: &str,
        reader: R,
        writer: W,
        child: Option<Child>,
        options: ControlOptions,
    ) -> SessionResult<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let snapshot: SharedSnapshot = Arc::new(RwLock::new(Snapshot::new(session)));
        let (events, _) = broadcast::channel(options.event_capacity);
        let (output_tx, output_rx) = mpsc::channel(options.output_capacity);
        let channel = Arc::new(CommandChannel::new(writer, options.command_timeout));
        let parser = ControlParser::new(snapshot.clone(), events.clone(), Some(output_tx));
        let (link_tx, link) = watch::channel(LinkState::Starting);

        let refresh_events = events.subscribe();
        let reader_task = tokio::spawn(read_loop(reader, parser, channel.clone(), link_tx));
        let refresh_task = tokio::spawn(refresh_loop(
            refresh_events,
            link.clone(),
            channel.clone(),
            snapshot.clone(),
        ));

        let session = Self {
            pid: child.as_ref().and_then(Child::id),
            channel,
            snapshot,
            events,
            output: Mutex::new(Some(output_rx)),
            link,
            child: tokio::sync::Mutex::new(child),
            tasks: vec![reader_task, refresh_task],
            options,
        };

        let timeout = session.options.handshake_timeout;
        match tokio::time::timeout(timeout, session.handshake()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session.abort().await;
                return Err(e);
            }
            Err(_) => {
                session.abort().await;
                return Err(SessionError::HandshakeTimeout(timeout.as_millis() as u64));
            }
        }

        let (cols, rows) = (session.options.cols, session.options.rows);
        if let Err(e) = session.execute(commands::refresh_client_size(cols, rows)).await {
            tracing::warn!(error = %e, "could not size control client");
        }
        if let Err(e) = session.refresh().await {
            tracing::warn!(error = %e, "initial window listing failed");
        }
        tracing::info!(session = %session.name(), "control session ready");
        Ok(session)
    }

    async fn handshake(&self) -> SessionResult<()> {
        // tmux answers the command it was launched with first; nothing may be
        // sent before that reply so numbering starts in step.
        let mut link = self.link.clone();
        let state = link
            .wait_for(|s| *s != LinkState::Starting)
            .await
            .map(|s| *s)
            .unwrap_or(LinkState::Closed);
        if state == LinkState::Closed {
            return Err(SessionError::ChannelClosed);
        }

        let reply = self.execute(commands::handshake()).await?;
        let name = reply.text();
        let name = name.trim();
        if !name.is_empty() {
            self.snapshot.write().session = name.to_string();
        }
        Ok(())
    }

    async fn abort(&self) {
        self.channel.fail_all();
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
    }

    pub fn name(&self) -> String {
        self.snapshot.read().session.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// A copy of the current windows and panes.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    pub fn shared_snapshot(&self) -> SharedSnapshot {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Take the pane output stream. Only the first caller receives it.
    pub fn take_output(&self) -> Option<mpsc::Receiver<PaneOutput>> {
        self.output.lock().take()
    }

    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        *self.link.borrow() != LinkState::Closed
    }

    pub fn link_watch(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    /// Resolve once the control stream has ended.
    pub async fn wait_closed(&self) {
        let mut link = self.link.clone();
        let _ = link.wait_for(|s| *s == LinkState::Closed).await;
    }

    /// Issue a command without waiting. Its effect shows up in the snapshot.
    pub async fn run(&self, command: ControlCommand) -> SessionResult<u64> {
        self.channel.send(command.as_str()).await
    }

    pub async fn execute(&self, command: ControlCommand) -> SessionResult<Reply> {
        self.channel.execute(command.as_str()).await
    }

    /// Re-read windows, layouts and pane attributes from tmux.
    pub async fn refresh(&self) -> SessionResult<()> {
        let windows = self.execute(commands::list_windows()).await?;
        let rows: Vec<WindowInfo> = windows
            .output
            .iter()
            .filter_map(|l| WindowInfo::parse_line(l))
            .collect();
        self.snapshot.write().apply_window_info(&rows);
        refresh_panes(&self.channel, &self.snapshot).await
    }

    /// Type raw bytes into the active pane.
    pub async fn send_input(&self, data: &[u8]) -> SessionResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let pane = self.snapshot.read().active_pane().map(|p| p.id);
        self.run(commands::send_bytes(pane, data)).await.map(|_| ())
    }

    pub async fn send_keys(&self, pane: PaneId, text: &str) -> SessionResult<()> {
        self.run(commands::send_keys(pane, text)).await.map(|_| ())
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> SessionResult<()> {
        self.run(commands::refresh_client_size(cols, rows))
            .await
            .map(|_| ())
    }

    /// Detach from tmux, leaving the tmux session running. Waits up to
    /// `grace` for the client to exit before killing it. Idempotent.
    pub async fn detach(&self, grace: Duration) {
        if self.is_connected() {
            if let Err(e) = self.run(commands::detach_client()).await {
                tracing::debug!(error = %e, "detach-client not delivered");
            }
        }
        self.channel.close_writer().await;

        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "control client exited"),
                Ok(Err(e)) => tracing::debug!(error = %e, "control client wait failed"),
                Err(_) => {
                    tracing::warn!(pid = ?self.pid, "control client ignored detach, killing");
                    let _ = child.kill().await;
                }
            }
        }
        drop(child);

        if tokio::time::timeout(grace, self.wait_closed()).await.is_err() {
            tracing::debug!("control stream still open after detach");
        }
        self.channel.fail_all();
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut parser: ControlParser,
    channel: Arc<CommandChannel>,
    link: watch::Sender<LinkState>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "control stream read failed");
                break;
            }
        };
        for reply in parser.feed(&buf[..n]) {
            link.send_if_modified(|s| {
                let starting = *s == LinkState::Starting;
                if starting {
                    *s = LinkState::Ready;
                }
                starting
            });
            channel.resolve(reply);
        }
    }

    for reply in parser.finish() {
        channel.resolve(reply);
    }
    channel.fail_all();
    link.send_replace(LinkState::Closed);
    tracing::debug!("control stream closed");
}

async fn refresh_panes(channel: &CommandChannel, snapshot: &SharedSnapshot) -> SessionResult<()> {
    let reply = channel.execute(commands::list_panes().as_str()).await?;
    let rows: Vec<PaneInfo> = reply
        .output
        .iter()
        .filter_map(|l| PaneInfo::parse_line(l))
        .collect();
    let reply = channel.execute(commands::list_pane_titles().as_str()).await?;
    let titles: Vec<PaneTitle> = reply
        .output
        .iter()
        .filter_map(|l| PaneTitle::parse_line(l))
        .collect();
    let mut snapshot = snapshot.write();
    snapshot.apply_pane_info(&rows);
    snapshot.apply_pane_titles(&titles);
    Ok(())
}

fn wants_pane_refresh(event: &ControlEvent) -> bool {
    matches!(
        event,
        ControlEvent::ActivePaneChanged { .. }
            | ControlEvent::PaneModeChanged(_)
            | ControlEvent::WindowAdded(_)
            | ControlEvent::LayoutChanged(_)
    )
}

/// Keeps pane attributes (active, mode, cwd, title) current; tmux only
/// announces that they changed, not their values.
async fn refresh_loop(
    mut events: broadcast::Receiver<ControlEvent>,
    mut link: watch::Receiver<LinkState>,
    channel: Arc<CommandChannel>,
    snapshot: SharedSnapshot,
) {
    if link.wait_for(|s| *s != LinkState::Starting).await.is_err() {
        return;
    }
    loop {
        let mut refresh = match events.recv().await {
            Ok(ControlEvent::Disconnected) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(event) => wants_pane_refresh(&event),
            Err(broadcast::error::RecvError::Lagged(_)) => true,
        };
        // Coalesce bursts into one query.
        loop {
            match events.try_recv() {
                Ok(ControlEvent::Disconnected) => return,
                Ok(event) => refresh |= wants_pane_refresh(&event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => refresh = true,
                Err(_) => break,
            }
        }
        if refresh {
            if let Err(e) = refresh_panes(&channel, &snapshot).await {
                tracing::debug!(error = %e, "pane refresh failed");
            }
        }
    }
}

//! Stateful control-mode stream parser.
//!
//! Bytes go in through [`ControlParser::feed`]; notifications update the
//! shared [`Snapshot`] and are published as [`ControlEvent`]s, pane output is
//! forwarded to the output sink, and completed command replies are handed
//! back to the caller for correlation.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::control::layout::Layout;
use crate::control::protocol::{
    parse_notification, parse_output_line, ControlReader, Frame, LineFramer, Notification, PaneId,
    Reply, WindowId,
};
use crate::control::snapshot::Snapshot;

pub type SharedSnapshot = Arc<RwLock<Snapshot>>;

/// Structural changes reported by a control-mode connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    WindowAdded(WindowId),
    WindowClosed(WindowId),
    WindowRenamed { window: WindowId, name: String },
    LayoutChanged(WindowId),
    ActivePaneChanged { window: WindowId, pane: PaneId },
    ActiveWindowChanged(WindowId),
    SessionRenamed(String),
    PaneModeChanged(PaneId),
    PaneExited(PaneId),
    ClientDetached,
    /// tmux sent `%exit`; the stream ends next.
    Exited { reason: Option<String> },
    /// The stream reached EOF. Nothing follows.
    Disconnected,
}

/// Decoded output of one pane.
#[derive(Debug, Clone, PartialEq)]
pub struct PaneOutput {
    pub pane: PaneId,
    pub data: Vec<u8>,
}

pub struct ControlParser {
    framer: LineFramer,
    reader: ControlReader,
    snapshot: SharedSnapshot,
    events: broadcast::Sender<ControlEvent>,
    output: Option<mpsc::Sender<PaneOutput>>,
    /// Set while the output sink is full, so drops are logged once per burst.
    dropping: bool,
    dropped: u64,
    disconnected: bool,
}

impl ControlParser {
    pub fn new(
        snapshot: SharedSnapshot,
        events: broadcast::Sender<ControlEvent>,
        output: Option<mpsc::Sender<PaneOutput>>,
    ) -> Self {
        Self {
            framer: LineFramer::new(),
            reader: ControlReader::new(),
            snapshot,
            events,
            output,
            dropping: false,
            dropped: 0,
            disconnected: false,
        }
    }

    pub fn snapshot(&self) -> &SharedSnapshot {
        &self.snapshot
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Output chunks discarded because the sink was full.
    pub fn dropped_output(&self) -> u64 {
        self.dropped
    }

    /// Consume a chunk of the stream. Returns command replies completed by it.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Reply> {
        let mut replies = Vec::new();
        if self.disconnected {
            return replies;
        }
        for line in self.framer.push(data) {
            self.handle_line(&line, &mut replies);
        }
        replies
    }

    /// Handle end of stream: flush a dangling line and emit `Disconnected`.
    pub fn finish(&mut self) -> Vec<Reply> {
        let mut replies = Vec::new();
        if self.disconnected {
            return replies;
        }
        if let Some(line) = self.framer.finish() {
            self.handle_line(&line, &mut replies);
        }
        if self.reader.in_block() {
            tracing::debug!("stream ended inside a command block");
        }
        self.disconnected = true;
        self.emit(ControlEvent::Disconnected);
        replies
    }

    fn handle_line(&mut self, line: &[u8], replies: &mut Vec<Reply>) {
        // Pane output is the only traffic that may carry non-UTF-8 bytes.
        if !self.reader.in_block() {
            if let Some(parsed) = parse_output_line(line) {
                match parsed {
                    Ok(notification) => self.apply(notification),
                    Err(e) => tracing::warn!(error = %e, "skipping control-mode line"),
                }
                return;
            }
        }
        let line = String::from_utf8_lossy(line);
        let frame = match self.reader.push_line(&line) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "skipping control-mode line");
                return;
            }
        };
        match frame {
            Frame::Reply(reply) => replies.push(reply),
            Frame::Notification(raw) => match parse_notification(&raw) {
                Ok(Some(notification)) => self.apply(notification),
                Ok(None) => tracing::trace!(line = %raw, "ignoring notification"),
                Err(e) => tracing::warn!(error = %e, "skipping control-mode line"),
            },
        }
    }

    fn emit(&self, event: ControlEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn forward_output(&mut self, pane: PaneId, data: Vec<u8>) {
        let Some(sink) = &self.output else { return };
        match sink.try_send(PaneOutput { pane, data }) {
            Ok(()) => {
                if self.dropping {
                    tracing::debug!(dropped = self.dropped, "output sink drained");
                    self.dropping = false;
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                if !self.dropping {
                    tracing::warn!(pane = %pane, "output sink full; dropping pane output");
                    self.dropping = true;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("output sink closed");
                self.output = None;
            }
        }
    }

    fn apply(&mut self, notification: Notification) {
        match notification {
            Notification::Output { pane, data } => self.forward_output(pane, data),
            Notification::LayoutChange { window, layout, .. } => {
                // Parse before locking so readers never wait on parsing.
                let layout = match Layout::parse(&layout) {
                    Ok(layout) => layout,
                    Err(e) => {
                        tracing::warn!(window = %window, error = %e, "skipping layout change");
                        return;
                    }
                };
                self.snapshot.write().apply_layout(window, &layout);
                self.emit(ControlEvent::LayoutChanged(window));
            }
            Notification::WindowAdd { window } => {
                self.snapshot.write().add_window(window);
                self.emit(ControlEvent::WindowAdded(window));
            }
            Notification::WindowClose { window } => {
                self.snapshot.write().close_window(window);
                self.emit(ControlEvent::WindowClosed(window));
            }
            Notification::WindowRenamed { window, name } => {
                self.snapshot.write().rename_window(window, &name);
                self.emit(ControlEvent::WindowRenamed { window, name });
            }
            Notification::UnlinkedWindow { window } => {
                tracing::trace!(window = %window, "ignoring unlinked window");
            }
            Notification::WindowPaneChanged { window, pane } => {
                self.snapshot.write().set_active_pane(window, pane);
                self.emit(ControlEvent::ActivePaneChanged { window, pane });
            }
            Notification::SessionWindowChanged { window, .. } => {
                self.snapshot.write().set_active_window(window);
                self.emit(ControlEvent::ActiveWindowChanged(window));
            }
            Notification::SessionChanged { name, .. } => {
                self.snapshot.write().session = name;
            }
            Notification::SessionRenamed { name } => {
                self.snapshot.write().session = name.clone();
                self.emit(ControlEvent::SessionRenamed(name));
            }
            Notification::SessionsChanged => {}
            Notification::PaneModeChanged { pane } => {
                self.emit(ControlEvent::PaneModeChanged(pane));
            }
            Notification::PaneExited { pane } => {
                self.snapshot.write().mark_pane_dead(pane);
                self.emit(ControlEvent::PaneExited(pane));
            }
            Notification::ClientDetached { .. } => {
                self.emit(ControlEvent::ClientDetached);
            }
            Notification::Exit { reason } => {
                self.snapshot.write().exited = true;
                tracing::debug!(reason = ?reason, "control client exiting");
                self.emit(ControlEvent::Exited { reason });
            }
        }
    }
}

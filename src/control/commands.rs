//! Builders for the control-mode commands this client issues.
//!
//! Targets are always tmux ids (`%pane`, `@window`) so commands stay valid
//! when indexes shift.

use std::fmt;
use std::fmt::Write as _;

use crate::control::protocol::{PaneId, WindowId};
use crate::control::snapshot::{PANE_FORMAT, PANE_TITLE_FORMAT, WINDOW_FORMAT};
use crate::tmux::quote_tmux_arg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    fn flag(self) -> &'static str {
        match self {
            Direction::Up => "-U",
            Direction::Down => "-D",
            Direction::Left => "-L",
            Direction::Right => "-R",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" | "u" => Ok(Direction::Up),
            "down" | "d" => Ok(Direction::Down),
            "left" | "l" => Ok(Direction::Left),
            "right" | "r" => Ok(Direction::Right),
            _ => Err(anyhow::anyhow!("Unknown direction: {s}")),
        }
    }
}

/// A single command line, without the trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand(String);

impl ControlCommand {
    fn new(command: impl Into<String>) -> Self {
        Self(command.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Panes ───────────────────────────────────────────────────────────

/// Split `pane` into two panes side by side.
pub fn split_horizontal(pane: PaneId) -> ControlCommand {
    ControlCommand::new(format!("split-window -h -t {pane}"))
}

/// Split `pane` into two stacked panes.
pub fn split_vertical(pane: PaneId) -> ControlCommand {
    ControlCommand::new(format!("split-window -v -t {pane}"))
}

/// Move focus to the neighbouring pane in `direction`.
pub fn select_pane(direction: Direction) -> ControlCommand {
    ControlCommand::new(format!("select-pane {}", direction.flag()))
}

pub fn focus_pane(pane: PaneId) -> ControlCommand {
    ControlCommand::new(format!("select-pane -t {pane}"))
}

/// Grow the active pane's edge in `direction` by `amount` cells.
pub fn resize_pane(direction: Direction, amount: u16) -> ControlCommand {
    ControlCommand::new(format!("resize-pane {} {amount}", direction.flag()))
}

pub fn swap_pane(a: PaneId, b: PaneId) -> ControlCommand {
    ControlCommand::new(format!("swap-pane -s {a} -t {b}"))
}

/// Move `pane` into a new window of its own.
pub fn break_pane(pane: PaneId) -> ControlCommand {
    ControlCommand::new(format!("break-pane -s {pane}"))
}

/// Move `pane` into `window`.
pub fn join_pane(pane: PaneId, window: WindowId) -> ControlCommand {
    ControlCommand::new(format!("join-pane -s {pane} -t {window}"))
}

/// Toggle zoom on `pane`.
pub fn zoom_pane(pane: PaneId) -> ControlCommand {
    ControlCommand::new(format!("resize-pane -Z -t {pane}"))
}

pub fn kill_pane(pane: PaneId) -> ControlCommand {
    ControlCommand::new(format!("kill-pane -t {pane}"))
}

// ── Windows ─────────────────────────────────────────────────────────

pub fn new_window() -> ControlCommand {
    ControlCommand::new("new-window")
}

pub fn select_window(window: WindowId) -> ControlCommand {
    ControlCommand::new(format!("select-window -t {window}"))
}

pub fn rename_window(window: WindowId, name: &str) -> ControlCommand {
    ControlCommand::new(format!(
        "rename-window -t {window} {}",
        quote_tmux_arg(name)
    ))
}

pub fn close_window(window: WindowId) -> ControlCommand {
    ControlCommand::new(format!("kill-window -t {window}"))
}

// ── Input ───────────────────────────────────────────────────────────

/// Send raw bytes as hex keys. Without a pane, tmux uses the active pane.
pub fn send_bytes(pane: Option<PaneId>, data: &[u8]) -> ControlCommand {
    let mut cmd = String::from("send-keys");
    if let Some(pane) = pane {
        let _ = write!(cmd, " -t {pane}");
    }
    cmd.push_str(" -H");
    for b in data {
        let _ = write!(cmd, " {b:02x}");
    }
    ControlCommand::new(cmd)
}

/// Type `text` literally into `pane`. Text with control characters is sent as hex.
pub fn send_keys(pane: PaneId, text: &str) -> ControlCommand {
    if text.chars().any(char::is_control) {
        return send_bytes(Some(pane), text.as_bytes());
    }
    ControlCommand::new(format!("send-keys -t {pane} -l {}", quote_tmux_arg(text)))
}

// ── Client and introspection ────────────────────────────────────────

/// Set the size tmux uses for this control client.
pub fn refresh_client_size(cols: u16, rows: u16) -> ControlCommand {
    ControlCommand::new(format!("refresh-client -C {cols}x{rows}"))
}

/// First command after connecting; replies with the session name.
pub fn handshake() -> ControlCommand {
    ControlCommand::new("display-message -p '#{session_name}'")
}

pub fn list_panes() -> ControlCommand {
    ControlCommand::new(format!("list-panes -s -F {}", quote_tmux_arg(PANE_FORMAT)))
}

pub fn list_pane_titles() -> ControlCommand {
    ControlCommand::new(format!("list-panes -s -F {}", quote_tmux_arg(PANE_TITLE_FORMAT)))
}

pub fn list_windows() -> ControlCommand {
    ControlCommand::new(format!("list-windows -F {}", quote_tmux_arg(WINDOW_FORMAT)))
}

pub fn detach_client() -> ControlCommand {
    ControlCommand::new("detach-client")
}

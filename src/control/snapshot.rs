//! Live model of a control-mode session's windows and panes.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::control::layout::{Layout, Rect};
use crate::control::protocol::{PaneId, WindowId};

// tmux prints control characters in `-F` output as `_`, so rows are space
// separated and each format carries at most one free-text field, last.

/// Format for `list-panes -s -F`; the working directory is last.
pub const PANE_FORMAT: &str =
    "#{pane_id} #{window_id} #{pane_active} #{pane_in_mode} #{pane_dead} #{pane_current_path}";

/// Format for `list-panes -s -F` reading titles.
pub const PANE_TITLE_FORMAT: &str = "#{pane_id} #{pane_title}";

/// Format for `list-windows -F`; the name is last.
pub const WINDOW_FORMAT: &str = "#{window_id} #{window_active} #{window_layout} #{window_name}";

#[derive(Debug, Clone, PartialEq)]
pub struct Pane {
    pub id: PaneId,
    pub window: WindowId,
    pub rect: Rect,
    pub active: bool,
    /// In copy mode (or another pane mode).
    pub in_mode: bool,
    pub cwd: Option<PathBuf>,
    pub title: String,
    pub dead: bool,
}

impl Pane {
    fn new(id: PaneId, window: WindowId) -> Self {
        Self {
            id,
            window,
            rect: Rect::default(),
            active: false,
            in_mode: false,
            cwd: None,
            title: String::new(),
            dead: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub id: WindowId,
    pub name: String,
    pub active: bool,
    pub width: u16,
    pub height: u16,
    /// Panes in layout order.
    pub panes: Vec<PaneId>,
}

impl Window {
    fn new(id: WindowId) -> Self {
        Self {
            id,
            name: String::new(),
            active: false,
            width: 0,
            height: 0,
            panes: Vec::new(),
        }
    }
}

/// One row of `list-panes` output in [`PANE_FORMAT`].
#[derive(Debug, Clone, PartialEq)]
pub struct PaneInfo {
    pub pane: PaneId,
    pub window: WindowId,
    pub active: bool,
    pub in_mode: bool,
    pub dead: bool,
    pub cwd: Option<PathBuf>,
}

impl PaneInfo {
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut f = line.splitn(6, ' ');
        let pane = f.next()?.parse().ok()?;
        let window = f.next()?.parse().ok()?;
        let active = flag(f.next()?)?;
        let in_mode = flag(f.next()?)?;
        let dead = flag(f.next()?)?;
        let cwd = f.next().filter(|s| !s.is_empty()).map(PathBuf::from);
        Some(Self {
            pane,
            window,
            active,
            in_mode,
            dead,
            cwd,
        })
    }
}

/// One row of `list-panes` output in [`PANE_TITLE_FORMAT`].
#[derive(Debug, Clone, PartialEq)]
pub struct PaneTitle {
    pub pane: PaneId,
    pub title: String,
}

impl PaneTitle {
    pub fn parse_line(line: &str) -> Option<Self> {
        let (pane, title) = line.split_once(' ').unwrap_or((line, ""));
        Some(Self {
            pane: pane.parse().ok()?,
            title: title.to_string(),
        })
    }
}

fn flag(field: &str) -> Option<bool> {
    match field {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

/// One row of `list-windows` output in [`WINDOW_FORMAT`].
#[derive(Debug, Clone, PartialEq)]
pub struct WindowInfo {
    pub window: WindowId,
    pub active: bool,
    pub layout: String,
    pub name: String,
}

impl WindowInfo {
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut f = line.splitn(4, ' ');
        let window = f.next()?.parse().ok()?;
        let active = flag(f.next()?)?;
        let layout = f.next().filter(|s| !s.is_empty())?.to_string();
        let name = f.next().unwrap_or_default().to_string();
        Some(Self {
            window,
            active,
            layout,
            name,
        })
    }
}

/// Windows and panes of one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub session: String,
    windows: BTreeMap<WindowId, Window>,
    panes: BTreeMap<PaneId, Pane>,
    /// tmux reported `%exit` for this client.
    pub exited: bool,
}

impl Snapshot {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            ..Self::default()
        }
    }

    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        self.windows.values()
    }

    pub fn window(&self, id: WindowId) -> Option<&Window> {
        self.windows.get(&id)
    }

    pub fn pane(&self, id: PaneId) -> Option<&Pane> {
        self.panes.get(&id)
    }

    pub fn pane_count(&self) -> usize {
        self.panes.len()
    }

    /// Panes of `window` in layout order.
    pub fn panes_in(&self, window: WindowId) -> Vec<&Pane> {
        self.windows
            .get(&window)
            .map(|w| w.panes.iter().filter_map(|p| self.panes.get(p)).collect())
            .unwrap_or_default()
    }

    pub fn active_window(&self) -> Option<&Window> {
        self.windows.values().find(|w| w.active)
    }

    /// The active pane of the active window.
    pub fn active_pane(&self) -> Option<&Pane> {
        let window = self.active_window()?;
        self.panes_in(window.id).into_iter().find(|p| p.active)
    }

    /// Returns `false` if the window was already known.
    pub fn add_window(&mut self, id: WindowId) -> bool {
        if self.windows.contains_key(&id) {
            return false;
        }
        self.windows.insert(id, Window::new(id));
        true
    }

    /// Remove a window together with its panes.
    pub fn close_window(&mut self, id: WindowId) -> bool {
        match self.windows.remove(&id) {
            Some(window) => {
                for pane in window.panes {
                    self.panes.remove(&pane);
                }
                true
            }
            None => false,
        }
    }

    pub fn rename_window(&mut self, id: WindowId, name: &str) -> bool {
        match self.windows.get_mut(&id) {
            Some(window) => {
                window.name = name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn set_active_window(&mut self, id: WindowId) {
        for window in self.windows.values_mut() {
            window.active = window.id == id;
        }
    }

    pub fn set_active_pane(&mut self, window: WindowId, pane: PaneId) {
        for p in self.panes.values_mut().filter(|p| p.window == window) {
            p.active = p.id == pane;
        }
    }

    pub fn mark_pane_dead(&mut self, pane: PaneId) -> bool {
        match self.panes.get_mut(&pane) {
            Some(p) => {
                p.dead = true;
                true
            }
            None => false,
        }
    }

    /// Replace the geometry of `window` with `layout`.
    ///
    /// Panes absent from the layout are dropped; panes that moved in from
    /// another window are detached from it. Pane attributes other than
    /// geometry are preserved.
    pub fn apply_layout(&mut self, window: WindowId, layout: &Layout) {
        self.add_window(window);
        let placed = layout.panes();

        let old: Vec<PaneId> = self
            .windows
            .get(&window)
            .map(|w| w.panes.clone())
            .unwrap_or_default();
        for pane in old {
            if !placed.iter().any(|(id, _)| *id == pane) {
                self.panes.remove(&pane);
            }
        }

        for (id, rect) in &placed {
            let pane = self
                .panes
                .entry(*id)
                .or_insert_with(|| Pane::new(*id, window));
            if pane.window != window {
                let previous = pane.window;
                pane.window = window;
                pane.active = false;
                if let Some(w) = self.windows.get_mut(&previous) {
                    w.panes.retain(|p| p != id);
                }
            }
            pane.rect = *rect;
        }

        let (width, height) = layout.size();
        if let Some(w) = self.windows.get_mut(&window) {
            w.width = width;
            w.height = height;
            w.panes = placed.into_iter().map(|(id, _)| id).collect();
        }
    }

    /// Merge `list-panes` attributes into known panes.
    pub fn apply_pane_info(&mut self, rows: &[PaneInfo]) {
        for row in rows {
            if let Some(pane) = self.panes.get_mut(&row.pane) {
                if pane.window != row.window {
                    continue;
                }
                pane.active = row.active;
                pane.in_mode = row.in_mode;
                pane.dead = row.dead;
                pane.cwd = row.cwd.clone();
            }
        }
    }

    pub fn apply_pane_titles(&mut self, rows: &[PaneTitle]) {
        for row in rows {
            if let Some(pane) = self.panes.get_mut(&row.pane) {
                pane.title = row.title.clone();
            }
        }
    }

    /// Rebuild the window set from `list-windows` output.
    /// Rows with unparseable layouts keep their window but no panes.
    pub fn apply_window_info(&mut self, rows: &[WindowInfo]) {
        let listed: Vec<WindowId> = rows.iter().map(|r| r.window).collect();
        let stale: Vec<WindowId> = self
            .windows
            .keys()
            .filter(|id| !listed.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.close_window(id);
        }
        for row in rows {
            match Layout::parse(&row.layout) {
                Ok(layout) => self.apply_layout(row.window, &layout),
                Err(e) => {
                    tracing::warn!(window = %row.window, error = %e, "skipping window layout");
                    self.add_window(row.window);
                }
            }
            if let Some(w) = self.windows.get_mut(&row.window) {
                w.name = row.name.clone();
                w.active = row.active;
            }
        }
    }

    /// Plain-text rendering for logs and tests.
    pub fn describe(&self) -> String {
        let mut out = format!("session {}", self.session);
        if self.exited {
            out.push_str(" (exited)");
        }
        for window in self.windows.values() {
            let _ = write!(
                out,
                "\n{} {:?} {}x{}",
                window.id, window.name, window.width, window.height
            );
            if window.active {
                out.push_str(" *");
            }
            for pane in self.panes_in(window.id) {
                let r = pane.rect;
                let _ = write!(out, "\n  {} {}x{}+{}+{}", pane.id, r.width, r.height, r.x, r.y);
                if pane.active {
                    out.push_str(" *");
                }
                if pane.in_mode {
                    out.push_str(" [mode]");
                }
                if pane.dead {
                    out.push_str(" [dead]");
                }
                if let Some(cwd) = &pane.cwd {
                    let _ = write!(out, " {}", cwd.display());
                }
            }
        }
        out
    }
}

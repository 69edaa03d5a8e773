//! tmux window layout strings.
//!
//! Format: `csum,WxH,X,Y` followed by either `,<pane>` for a leaf,
//! `{child,child,...}` for children laid out left to right, or
//! `[child,child,...]` for children stacked top to bottom. Example:
//! `020a,80x24,0,0{40x24,0,0,1,39x24,41,0,2}`.

use crate::control::protocol::PaneId;
use crate::error::{SessionError, SessionResult};

/// A cell rectangle inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn area(&self) -> u32 {
        self.width as u32 * self.height as u32
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        let (ax, ay, bx, by) = (self.x as u32, self.y as u32, other.x as u32, other.y as u32);
        ax < bx + other.width as u32
            && bx < ax + self.width as u32
            && ay < by + other.height as u32
            && by < ay + self.height as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitAxis {
    /// `{...}`: children side by side.
    LeftRight,
    /// `[...]`: children stacked.
    TopBottom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutNode {
    Pane {
        rect: Rect,
        pane: PaneId,
    },
    Split {
        rect: Rect,
        axis: SplitAxis,
        children: Vec<LayoutNode>,
    },
}

impl LayoutNode {
    pub fn rect(&self) -> Rect {
        match self {
            LayoutNode::Pane { rect, .. } | LayoutNode::Split { rect, .. } => *rect,
        }
    }
}

/// A parsed window layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: LayoutNode,
}

/// tmux's layout checksum over the text following `csum,`.
pub fn layout_checksum(body: &str) -> u16 {
    body.bytes().fold(0u16, |csum, b| {
        ((csum >> 1) | ((csum & 1) << 15)).wrapping_add(b as u16)
    })
}

fn malformed(input: &str, what: &str) -> SessionError {
    SessionError::MalformedProtocolLine(format!("layout {what}: {input}"))
}

impl Layout {
    /// Parse a layout string. A leading checksum, when present, must match.
    pub fn parse(input: &str) -> SessionResult<Self> {
        let input = input.trim();
        let body = match input.split_once(',') {
            Some((csum, body)) if csum.len() == 4 && !csum.contains('x') => {
                let expected = u16::from_str_radix(csum, 16)
                    .map_err(|_| malformed(input, "checksum"))?;
                if layout_checksum(body) != expected {
                    return Err(malformed(input, "checksum mismatch"));
                }
                body
            }
            _ => input,
        };

        let mut cursor = Cursor { rest: body, input };
        let root = cursor.node()?;
        if !cursor.rest.is_empty() {
            return Err(malformed(input, "trailing text"));
        }
        Ok(Self { root })
    }

    /// Size of the whole window in cells.
    pub fn size(&self) -> (u16, u16) {
        let rect = self.root.rect();
        (rect.width, rect.height)
    }

    /// Every pane with its rectangle, in layout order.
    pub fn panes(&self) -> Vec<(PaneId, Rect)> {
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }
}

fn collect(node: &LayoutNode, out: &mut Vec<(PaneId, Rect)>) {
    match node {
        LayoutNode::Pane { rect, pane } => out.push((*pane, *rect)),
        LayoutNode::Split { children, .. } => {
            for child in children {
                collect(child, out);
            }
        }
    }
}

struct Cursor<'a> {
    rest: &'a str,
    input: &'a str,
}

impl<'a> Cursor<'a> {
    fn number(&mut self) -> SessionResult<u32> {
        let end = self
            .rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(self.rest.len());
        if end == 0 {
            return Err(malformed(self.input, "expected number"));
        }
        let n = self.rest[..end]
            .parse()
            .map_err(|_| malformed(self.input, "number out of range"))?;
        self.rest = &self.rest[end..];
        Ok(n)
    }

    fn dimension(&mut self) -> SessionResult<u16> {
        u16::try_from(self.number()?).map_err(|_| malformed(self.input, "dimension out of range"))
    }

    fn expect(&mut self, c: char) -> SessionResult<()> {
        self.rest = self
            .rest
            .strip_prefix(c)
            .ok_or_else(|| malformed(self.input, &format!("expected '{c}'")))?;
        Ok(())
    }

    fn node(&mut self) -> SessionResult<LayoutNode> {
        let width = self.dimension()?;
        self.expect('x')?;
        let height = self.dimension()?;
        self.expect(',')?;
        let x = self.dimension()?;
        self.expect(',')?;
        let y = self.dimension()?;
        let rect = Rect {
            x,
            y,
            width,
            height,
        };

        let (axis, close) = match self.rest.chars().next() {
            Some('{') => (SplitAxis::LeftRight, '}'),
            Some('[') => (SplitAxis::TopBottom, ']'),
            Some(',') => {
                self.rest = &self.rest[1..];
                let pane = PaneId(self.number()?);
                return Ok(LayoutNode::Pane { rect, pane });
            }
            _ => return Err(malformed(self.input, "expected pane or split")),
        };
        self.rest = &self.rest[1..];

        let mut children = Vec::new();
        loop {
            children.push(self.node()?);
            match self.rest.chars().next() {
                Some(',') => self.rest = &self.rest[1..],
                Some(c) if c == close => {
                    self.rest = &self.rest[1..];
                    break;
                }
                _ => return Err(malformed(self.input, "unterminated split")),
            }
        }
        Ok(LayoutNode::Split {
            rect,
            axis,
            children,
        })
    }
}

//! Wire-level pieces of tmux control mode.
//!
//! tmux control mode writes:
//! - `%begin <time> <number> <flags>` ... `%end|%error <time> <number> <flags>` around
//!   the output of every command
//! - `%<notification> ...` lines at any point outside such a block
//!
//! Lines inside a block are command output, even when they start with `%`
//! (`list-panes -F '#{pane_id}'` prints `%3`).

use std::fmt;
use std::str::FromStr;

use crate::error::{SessionError, SessionResult};

// ── Identifiers ─────────────────────────────────────────────────────

/// A tmux pane id (`%N` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaneId(pub u32);

/// A tmux window id (`@N` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u32);

fn parse_prefixed(s: &str, prefix: char) -> SessionResult<u32> {
    s.strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| SessionError::MalformedProtocolLine(format!("bad {prefix} id: {s}")))
}

impl FromStr for PaneId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, '%').map(PaneId)
    }
}

impl FromStr for WindowId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_prefixed(s, '@').map(WindowId)
    }
}

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

// ── Line framing ────────────────────────────────────────────────────

/// Splits a byte stream into newline-terminated lines, holding back a
/// trailing partial line until the next read completes it.
///
/// Lines stay raw bytes: tmux passes bytes >= 0x80 through unescaped, so a
/// pane's output line need not be valid UTF-8.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every line it completes, without terminators.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            if self.partial.last() == Some(&b'\r') {
                self.partial.pop();
            }
            lines.push(std::mem::take(&mut self.partial));
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
        lines
    }

    /// Return the unterminated tail at end of stream, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.partial.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.partial))
    }

    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

// ── Line classification ─────────────────────────────────────────────

/// The `<time> <number> <flags>` triple of a `%begin`/`%end`/`%error` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guard {
    pub time: i64,
    pub number: u64,
    pub flags: u32,
}

impl Guard {
    /// Whether the command came from this client (as opposed to a hook or config).
    pub fn from_client(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// A single classified line of control-mode output.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlLine {
    Begin(Guard),
    End(Guard),
    Error(Guard),
    Notification(String),
    Data(String),
}

fn parse_guard(line: &str, rest: &str) -> SessionResult<Guard> {
    let malformed = || SessionError::MalformedProtocolLine(line.to_string());
    let mut parts = rest.split_ascii_whitespace();
    let time = parts.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
    let number = parts.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
    let flags = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok(Guard {
        time,
        number,
        flags,
    })
}

/// Classify one line of control-mode output, ignoring block context.
pub fn parse_control_line(line: &str) -> SessionResult<ControlLine> {
    if let Some(rest) = line.strip_prefix("%begin ") {
        return parse_guard(line, rest).map(ControlLine::Begin);
    }
    if let Some(rest) = line.strip_prefix("%end ") {
        return parse_guard(line, rest).map(ControlLine::End);
    }
    if let Some(rest) = line.strip_prefix("%error ") {
        return parse_guard(line, rest).map(ControlLine::Error);
    }
    if line.starts_with('%') {
        return Ok(ControlLine::Notification(line.to_string()));
    }
    Ok(ControlLine::Data(line.to_string()))
}

// ── Block tracking ──────────────────────────────────────────────────

/// The complete output of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// tmux's command number from the guard lines.
    pub number: u64,
    pub flags: u32,
    pub success: bool,
    pub output: Vec<String>,
}

impl Reply {
    pub fn from_client(&self) -> bool {
        self.flags & 1 != 0
    }

    /// Output lines joined with `\n`.
    pub fn text(&self) -> String {
        self.output.join("\n")
    }
}

/// What a line turned into once block context is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Reply(Reply),
    /// A `%` line outside any block, not yet interpreted.
    Notification(String),
}

/// Tracks `%begin`..`%end` blocks across lines.
#[derive(Debug, Default)]
pub struct ControlReader {
    open: Option<(Guard, Vec<String>)>,
}

impl ControlReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_block(&self) -> bool {
        self.open.is_some()
    }

    /// Feed one line. `Ok(None)` means the line was absorbed into a block.
    pub fn push_line(&mut self, line: &str) -> SessionResult<Option<Frame>> {
        if let Some((guard, output)) = self.open.as_mut() {
            // Only the guard carrying the same number closes the block.
            let closing = match line.split_once(' ') {
                Some(("%end", rest)) => Some((true, rest)),
                Some(("%error", rest)) => Some((false, rest)),
                _ => None,
            };
            if let Some((success, rest)) = closing {
                if let Ok(end) = parse_guard(line, rest) {
                    if end.number == guard.number {
                        let reply = Reply {
                            number: guard.number,
                            flags: guard.flags,
                            success,
                            output: std::mem::take(output),
                        };
                        self.open = None;
                        return Ok(Some(Frame::Reply(reply)));
                    }
                }
            }
            output.push(line.to_string());
            return Ok(None);
        }

        match parse_control_line(line)? {
            ControlLine::Begin(guard) => {
                self.open = Some((guard, Vec::new()));
                Ok(None)
            }
            ControlLine::End(_) | ControlLine::Error(_) => Err(
                SessionError::MalformedProtocolLine(format!("guard outside block: {line}")),
            ),
            ControlLine::Notification(raw) => Ok(Some(Frame::Notification(raw))),
            // tmux prints nothing bare outside a block except the
            // empty line some versions emit on detach.
            ControlLine::Data(data) if data.is_empty() => Ok(None),
            ControlLine::Data(data) => Err(SessionError::MalformedProtocolLine(data)),
        }
    }
}

// ── Escapes ─────────────────────────────────────────────────────────

/// Decode tmux control mode octal escape sequences into raw bytes.
/// `\012` → newline, `\134` → backslash. tmux escapes each byte of a
/// multi-byte character separately, so the result may be any byte string.
pub fn decode_octal_escapes(input: impl AsRef<[u8]>) -> Vec<u8> {
    let src = input.as_ref();
    let len = src.len();
    let mut buf = Vec::with_capacity(len);
    let mut i = 0;

    while i < len {
        if src[i] == b'\\' && i + 3 < len {
            let d1 = src[i + 1];
            let d2 = src[i + 2];
            let d3 = src[i + 3];
            if (b'0'..=b'7').contains(&d1)
                && (b'0'..=b'7').contains(&d2)
                && (b'0'..=b'7').contains(&d3)
            {
                let val = (d1 - b'0') as u16 * 64 + (d2 - b'0') as u16 * 8 + (d3 - b'0') as u16;
                if let Ok(byte) = u8::try_from(val) {
                    buf.push(byte);
                    i += 4;
                    continue;
                }
                // > 255 (e.g. \777) is not a byte; keep it literal
            }
        }
        buf.push(src[i]);
        i += 1;
    }

    buf
}

// ── Notifications ───────────────────────────────────────────────────

/// Asynchronous notifications from tmux control mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// `%output %<pane> <escaped>` or `%extended-output %<pane> <age> ... : <escaped>`
    Output { pane: PaneId, data: Vec<u8> },
    /// `%layout-change @<window> <layout> [<visible-layout> <flags>]`
    LayoutChange {
        window: WindowId,
        layout: String,
        visible_layout: Option<String>,
        flags: Option<String>,
    },
    WindowAdd { window: WindowId },
    WindowClose { window: WindowId },
    WindowRenamed { window: WindowId, name: String },
    /// Any `%unlinked-window-*`: a window of another session.
    UnlinkedWindow { window: WindowId },
    WindowPaneChanged { window: WindowId, pane: PaneId },
    SessionWindowChanged { session: String, window: WindowId },
    SessionChanged { session: String, name: String },
    SessionRenamed { name: String },
    SessionsChanged,
    PaneModeChanged { pane: PaneId },
    /// `%pane-exited %<pane>` (tmux 3.2+ with remain-on-exit).
    PaneExited { pane: PaneId },
    ClientDetached { client: String },
    Exit { reason: Option<String> },
}

fn malformed(line: &str) -> SessionError {
    SessionError::MalformedProtocolLine(line.to_string())
}

fn malformed_bytes(line: &[u8]) -> SessionError {
    SessionError::MalformedProtocolLine(String::from_utf8_lossy(line).into_owned())
}

fn split_space(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().position(|&b| b == b' ') {
        Some(pos) => (&bytes[..pos], &bytes[pos + 1..]),
        None => (bytes, &[]),
    }
}

fn parse_pane_bytes(pane: &[u8], line: &[u8]) -> SessionResult<PaneId> {
    std::str::from_utf8(pane)
        .map_err(|_| malformed_bytes(line))?
        .parse()
}

/// Parse a raw `%output` or `%extended-output` line without going through
/// UTF-8, so the payload keeps its exact bytes.
///
/// Returns `None` for any other line.
pub fn parse_output_line(line: &[u8]) -> Option<SessionResult<Notification>> {
    if let Some(rest) = line.strip_prefix(b"%output ") {
        let (pane, data) = split_space(rest);
        return Some(parse_pane_bytes(pane, line).map(|pane| Notification::Output {
            pane,
            data: decode_octal_escapes(data),
        }));
    }
    let rest = line.strip_prefix(b"%extended-output ")?;
    let (pane, tail) = split_space(rest);
    let Some(pos) = tail.windows(3).position(|w| w == b" : ") else {
        return Some(Err(malformed_bytes(line)));
    };
    Some(parse_pane_bytes(pane, line).map(|pane| Notification::Output {
        pane,
        data: decode_octal_escapes(&tail[pos + 3..]),
    }))
}

/// Parse a `%` notification line.
///
/// Returns `Ok(None)` for notification types this client does not track and
/// an error for a known type whose arguments cannot be parsed.
pub fn parse_notification(line: &str) -> SessionResult<Option<Notification>> {
    let (kind, rest) = match line.split_once(' ') {
        Some((kind, rest)) => (kind, rest),
        None => (line, ""),
    };

    let notification = match kind {
        "%output" | "%extended-output" => {
            return match parse_output_line(line.as_bytes()) {
                Some(parsed) => parsed.map(Some),
                None => Err(malformed(line)),
            };
        }
        "%layout-change" => {
            let mut parts = rest.split(' ');
            let window = parts.next().ok_or_else(|| malformed(line))?.parse()?;
            let layout = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| malformed(line))?
                .to_string();
            Notification::LayoutChange {
                window,
                layout,
                visible_layout: parts.next().map(str::to_string),
                flags: parts.next().map(str::to_string),
            }
        }
        "%window-add" => Notification::WindowAdd {
            window: rest.trim().parse()?,
        },
        "%window-close" => Notification::WindowClose {
            window: rest.trim().parse()?,
        },
        "%window-renamed" => {
            let (window, name) = rest.split_once(' ').unwrap_or((rest, ""));
            Notification::WindowRenamed {
                window: window.parse()?,
                name: name.to_string(),
            }
        }
        "%unlinked-window-add" | "%unlinked-window-close" | "%unlinked-window-renamed" => {
            let window = rest.split(' ').next().unwrap_or_default();
            Notification::UnlinkedWindow {
                window: window.parse()?,
            }
        }
        "%window-pane-changed" => {
            let (window, pane) = rest.split_once(' ').ok_or_else(|| malformed(line))?;
            Notification::WindowPaneChanged {
                window: window.parse()?,
                pane: pane.trim().parse()?,
            }
        }
        "%session-window-changed" => {
            let (session, window) = rest.split_once(' ').ok_or_else(|| malformed(line))?;
            Notification::SessionWindowChanged {
                session: session.to_string(),
                window: window.trim().parse()?,
            }
        }
        "%session-changed" => {
            let (session, name) = rest.split_once(' ').ok_or_else(|| malformed(line))?;
            Notification::SessionChanged {
                session: session.to_string(),
                name: name.to_string(),
            }
        }
        "%session-renamed" => {
            // tmux 3.x sends `$id name`, older versions only the name.
            let name = match rest.split_once(' ') {
                Some((id, name)) if id.starts_with('$') => name,
                _ => rest,
            };
            Notification::SessionRenamed {
                name: name.to_string(),
            }
        }
        "%sessions-changed" => Notification::SessionsChanged,
        "%pane-mode-changed" => Notification::PaneModeChanged {
            pane: rest.trim().parse()?,
        },
        "%pane-exited" => Notification::PaneExited {
            pane: rest.trim().parse()?,
        },
        "%client-detached" => Notification::ClientDetached {
            client: rest.to_string(),
        },
        "%exit" => Notification::Exit {
            reason: Some(rest.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        },
        _ => return Ok(None),
    };
    Ok(Some(notification))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── LineFramer ──────────────────────────────────────────────────

    #[test]
    fn framer_whole_lines() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"a\nb\n"), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(!framer.has_partial());
    }

    #[test]
    fn framer_holds_partial_line() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"%window-ad").is_empty());
        assert!(framer.has_partial());
        assert_eq!(framer.push(b"d @1\n"), vec![b"%window-add @1".to_vec()]);
    }

    #[test]
    fn framer_strips_carriage_return() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"x\r\n"), vec![b"x".to_vec()]);
    }

    #[test]
    fn framer_finish_returns_tail() {
        let mut framer = LineFramer::new();
        framer.push(b"done\ntail");
        assert_eq!(framer.finish().as_deref(), Some(&b"tail"[..]));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn framer_split_between_cr_and_lf() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"x\r").is_empty());
        assert_eq!(framer.push(b"\n"), vec![b"x".to_vec()]);
    }

    #[test]
    fn framer_keeps_non_utf8_bytes() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"%output %1 \xe2").is_empty());
        assert_eq!(
            framer.push(b"\x97\xff\n"),
            vec![b"%output %1 \xe2\x97\xff".to_vec()]
        );
    }

    // ── parse_control_line ──────────────────────────────────────────

    #[test]
    fn parse_begin_guard() {
        assert_eq!(
            parse_control_line("%begin 1234567890 42 1").unwrap(),
            ControlLine::Begin(Guard {
                time: 1234567890,
                number: 42,
                flags: 1
            })
        );
    }

    #[test]
    fn parse_end_and_error() {
        assert!(matches!(
            parse_control_line("%end 1 2 0").unwrap(),
            ControlLine::End(Guard { number: 2, .. })
        ));
        assert!(matches!(
            parse_control_line("%error 1 3 1").unwrap(),
            ControlLine::Error(Guard { number: 3, .. })
        ));
    }

    #[test]
    fn parse_guard_malformed() {
        assert!(matches!(
            parse_control_line("%begin abc"),
            Err(SessionError::MalformedProtocolLine(_))
        ));
    }

    #[test]
    fn parse_notification_and_data() {
        assert_eq!(
            parse_control_line("%output %5 hi").unwrap(),
            ControlLine::Notification("%output %5 hi".to_string())
        );
        assert_eq!(
            parse_control_line("plain").unwrap(),
            ControlLine::Data("plain".to_string())
        );
    }

    // ── ControlReader ───────────────────────────────────────────────

    #[test]
    fn reader_collects_block() {
        let mut reader = ControlReader::new();
        assert_eq!(reader.push_line("%begin 1 7 1").unwrap(), None);
        assert_eq!(reader.push_line("line one").unwrap(), None);
        assert_eq!(reader.push_line("line two").unwrap(), None);
        let frame = reader.push_line("%end 1 7 1").unwrap();
        assert_eq!(
            frame,
            Some(Frame::Reply(Reply {
                number: 7,
                flags: 1,
                success: true,
                output: vec!["line one".to_string(), "line two".to_string()],
            }))
        );
        assert!(!reader.in_block());
    }

    #[test]
    fn reader_percent_lines_inside_block_are_data() {
        let mut reader = ControlReader::new();
        reader.push_line("%begin 1 8 1").unwrap();
        assert_eq!(reader.push_line("%3").unwrap(), None);
        assert_eq!(reader.push_line("%output %1 not-a-notification").unwrap(), None);
        let Some(Frame::Reply(reply)) = reader.push_line("%end 1 8 1").unwrap() else {
            panic!("expected reply");
        };
        assert_eq!(reply.output, vec!["%3", "%output %1 not-a-notification"]);
    }

    #[test]
    fn reader_ignores_mismatched_end_number() {
        let mut reader = ControlReader::new();
        reader.push_line("%begin 1 9 1").unwrap();
        assert_eq!(reader.push_line("%end 1 10 1").unwrap(), None);
        let Some(Frame::Reply(reply)) = reader.push_line("%end 1 9 1").unwrap() else {
            panic!("expected reply");
        };
        assert_eq!(reply.output, vec!["%end 1 10 1"]);
    }

    #[test]
    fn reader_error_block() {
        let mut reader = ControlReader::new();
        reader.push_line("%begin 1 4 1").unwrap();
        reader.push_line("unknown command: bogus").unwrap();
        let Some(Frame::Reply(reply)) = reader.push_line("%error 1 4 1").unwrap() else {
            panic!("expected reply");
        };
        assert!(!reply.success);
        assert_eq!(reply.text(), "unknown command: bogus");
    }

    #[test]
    fn reader_notification_outside_block() {
        let mut reader = ControlReader::new();
        assert_eq!(
            reader.push_line("%window-add @2").unwrap(),
            Some(Frame::Notification("%window-add @2".to_string()))
        );
    }

    #[test]
    fn reader_stray_end_is_malformed() {
        let mut reader = ControlReader::new();
        assert!(reader.push_line("%end 1 1 1").is_err());
        assert!(reader.push_line("garbage").is_err());
        assert_eq!(reader.push_line("").unwrap(), None);
    }

    // ── decode_octal_escapes ────────────────────────────────────────

    #[test]
    fn decode_octal_newline() {
        assert_eq!(decode_octal_escapes("hello\\012world"), b"hello\nworld");
    }

    #[test]
    fn decode_octal_backslash() {
        assert_eq!(decode_octal_escapes("path\\134file"), b"path\\file");
    }

    #[test]
    fn decode_octal_trailing_and_partial() {
        assert_eq!(decode_octal_escapes("end\\"), b"end\\");
        assert_eq!(decode_octal_escapes("end\\01"), b"end\\01");
        assert_eq!(decode_octal_escapes("x\\089y"), b"x\\089y");
    }

    #[test]
    fn decode_octal_escape_at_end() {
        assert_eq!(decode_octal_escapes("a\\033"), b"a\x1b");
    }

    #[test]
    fn decode_octal_non_utf8_bytes() {
        assert_eq!(decode_octal_escapes("\\377\\000"), vec![0xff, 0x00]);
    }

    #[test]
    fn decode_octal_multibyte_utf8() {
        assert_eq!(decode_octal_escapes("\\342\\227\\217"), "●".as_bytes());
    }

    #[test]
    fn decode_octal_out_of_range_kept() {
        assert_eq!(decode_octal_escapes("\\777"), b"\\777");
    }

    // ── parse_notification ──────────────────────────────────────────

    #[test]
    fn notification_output() {
        assert_eq!(
            parse_notification("%output %5 hello\\015\\012").unwrap(),
            Some(Notification::Output {
                pane: PaneId(5),
                data: b"hello\r\n".to_vec(),
            })
        );
    }

    #[test]
    fn notification_output_payload_starting_with_percent() {
        assert_eq!(
            parse_notification("%output %1 %begin 1 2 3").unwrap(),
            Some(Notification::Output {
                pane: PaneId(1),
                data: b"%begin 1 2 3".to_vec(),
            })
        );
    }

    #[test]
    fn output_line_keeps_raw_high_bytes() {
        let line = b"%output %1 \xe2\x97\\012\x8f";
        assert_eq!(
            parse_output_line(line).unwrap().unwrap(),
            Notification::Output {
                pane: PaneId(1),
                data: vec![0xe2, 0x97, b'\n', 0x8f],
            }
        );
        assert!(parse_output_line(b"%window-add @1").is_none());
        assert!(parse_output_line(b"%output x\xff data").unwrap().is_err());
        assert!(parse_output_line(b"%extended-output %1 12 no-colon")
            .unwrap()
            .is_err());
    }

    #[test]
    fn notification_extended_output() {
        assert_eq!(
            parse_notification("%extended-output %2 120 : ab\\012").unwrap(),
            Some(Notification::Output {
                pane: PaneId(2),
                data: b"ab\n".to_vec(),
            })
        );
    }

    #[test]
    fn notification_layout_change() {
        let n = parse_notification(
            "%layout-change @1 b25d,80x24,0,0{40x24,0,0,1,39x24,41,0,2} b25d,80x24,0,0{40x24,0,0,1,39x24,41,0,2} *",
        )
        .unwrap();
        let Some(Notification::LayoutChange {
            window,
            layout,
            visible_layout,
            flags,
        }) = n
        else {
            panic!("expected layout change");
        };
        assert_eq!(window, WindowId(1));
        assert!(layout.starts_with("b25d,80x24"));
        assert!(visible_layout.is_some());
        assert_eq!(flags.as_deref(), Some("*"));
    }

    #[test]
    fn notification_window_lifecycle() {
        assert_eq!(
            parse_notification("%window-add @3").unwrap(),
            Some(Notification::WindowAdd {
                window: WindowId(3)
            })
        );
        assert_eq!(
            parse_notification("%window-close @3").unwrap(),
            Some(Notification::WindowClose {
                window: WindowId(3)
            })
        );
        assert_eq!(
            parse_notification("%window-renamed @3 build logs").unwrap(),
            Some(Notification::WindowRenamed {
                window: WindowId(3),
                name: "build logs".to_string(),
            })
        );
    }

    #[test]
    fn notification_session_variants() {
        assert_eq!(
            parse_notification("%session-changed $1 termq-ab12cd34").unwrap(),
            Some(Notification::SessionChanged {
                session: "$1".to_string(),
                name: "termq-ab12cd34".to_string(),
            })
        );
        assert_eq!(
            parse_notification("%session-renamed $1 renamed").unwrap(),
            Some(Notification::SessionRenamed {
                name: "renamed".to_string()
            })
        );
        assert_eq!(
            parse_notification("%session-window-changed $1 @4").unwrap(),
            Some(Notification::SessionWindowChanged {
                session: "$1".to_string(),
                window: WindowId(4),
            })
        );
    }

    #[test]
    fn notification_exit_with_and_without_reason() {
        assert_eq!(
            parse_notification("%exit").unwrap(),
            Some(Notification::Exit { reason: None })
        );
        assert_eq!(
            parse_notification("%exit server exited").unwrap(),
            Some(Notification::Exit {
                reason: Some("server exited".to_string())
            })
        );
    }

    #[test]
    fn notification_unknown_is_ignored() {
        assert_eq!(parse_notification("%paste-buffer-changed buf0").unwrap(), None);
        assert_eq!(parse_notification("%subscription-changed x").unwrap(), None);
        assert_eq!(parse_notification("").unwrap(), None);
    }

    #[test]
    fn notification_known_with_bad_ids_is_malformed() {
        assert!(parse_notification("%window-add 3").is_err());
        assert!(parse_notification("%output 5 data").is_err());
        assert!(parse_notification("%layout-change @1").is_err());
    }

    #[test]
    fn ids_display_and_parse() {
        assert_eq!(PaneId(12).to_string(), "%12");
        assert_eq!(WindowId(4).to_string(), "@4");
        assert_eq!("%12".parse::<PaneId>().unwrap(), PaneId(12));
        assert!("@x".parse::<WindowId>().is_err());
    }

    // ── proptest ────────────────────────────────────────────────────

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_octal_never_panics(input in ".*") {
                let _ = decode_octal_escapes(&input);
            }

            #[test]
            fn decode_octal_preserves_ascii_without_backslash(
                input in "[a-zA-Z0-9 ]{0,100}"
            ) {
                prop_assert_eq!(decode_octal_escapes(&input), input.as_bytes().to_vec());
            }

            #[test]
            fn parse_notification_never_panics(input in "%.*") {
                let _ = parse_notification(&input);
            }

            #[test]
            fn reader_never_panics(lines in proptest::collection::vec(".*", 0..20)) {
                let mut reader = ControlReader::new();
                for line in &lines {
                    let _ = reader.push_line(line);
                }
            }

            #[test]
            fn framer_split_point_does_not_change_lines(
                text in "[a-z%@ \\n]{0,200}",
                split in 0usize..200,
            ) {
                let bytes = text.as_bytes();
                let split = split.min(bytes.len());
                let mut whole = LineFramer::new();
                let expected = whole.push(bytes);
                let mut parts = LineFramer::new();
                let mut got = parts.push(&bytes[..split]);
                got.extend(parts.push(&bytes[split..]));
                prop_assert_eq!(got, expected);
            }
        }
    }
}

//! Command/response correlation over a control-mode pipe.
//!
//! Every command is assigned a local sequence number when it is written.
//! tmux numbers commands with a server-wide counter that other clients and
//! hooks also advance, and it runs one client's commands in the order they
//! were written. So a reply carrying a number newer than any seen before
//! answers the oldest pending command, and the offset between tmux numbers
//! and local sequence numbers is re-based on it. A reply arriving behind a
//! newer one (or the very first reply) is placed by keyed lookup through the
//! offset. Replies not issued by this client are discarded.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::control::protocol::Reply;
use crate::error::{SessionError, SessionResult};

type Writer = Pin<Box<dyn AsyncWrite + Send>>;

struct Pending {
    command: String,
    reply: Option<oneshot::Sender<SessionResult<Reply>>>,
}

struct ChannelState {
    next_seq: u64,
    /// tmux command number minus local sequence number.
    offset: i64,
    /// Highest tmux number resolved so far.
    last_number: Option<u64>,
    pending: HashMap<u64, Pending>,
    closed: bool,
}

/// A command in flight.
pub struct PendingReply {
    seq: u64,
    rx: oneshot::Receiver<SessionResult<Reply>>,
}

impl PendingReply {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the reply. `%error` replies are returned, not mapped to errors.
    ///
    /// On timeout the command stays in the table without a waiter, so its
    /// late reply is consumed there instead of answering a newer command.
    pub async fn wait(self, timeout: Duration) -> SessionResult<Reply> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::ChannelClosed),
            Err(_) => Err(SessionError::Multiplexer(format!(
                "command {} timed out after {}ms",
                self.seq,
                timeout.as_millis()
            ))),
        }
    }
}

pub struct CommandChannel {
    /// Held across "assign sequence + write" so write order matches sequence order.
    writer: tokio::sync::Mutex<Option<Writer>>,
    state: Mutex<ChannelState>,
    timeout: Duration,
}

impl CommandChannel {
    pub fn new(writer: impl AsyncWrite + Send + 'static, timeout: Duration) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(Box::pin(writer))),
            state: Mutex::new(ChannelState {
                next_seq: 1,
                offset: 0,
                last_number: None,
                pending: HashMap::new(),
                closed: false,
            }),
            timeout,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Write a command without waiting for its reply. Returns its sequence number.
    pub async fn send(&self, command: &str) -> SessionResult<u64> {
        self.write(command, None).await
    }

    /// Write a command and return a handle to await its reply.
    pub async fn request(&self, command: &str) -> SessionResult<PendingReply> {
        let (tx, rx) = oneshot::channel();
        let seq = self.write(command, Some(tx)).await?;
        Ok(PendingReply { seq, rx })
    }

    /// Run a command and wait for it; `%error` becomes [`SessionError::Multiplexer`].
    pub async fn execute(&self, command: &str) -> SessionResult<Reply> {
        let reply = self.request(command).await?.wait(self.timeout).await?;
        if reply.success {
            Ok(reply)
        } else {
            Err(SessionError::Multiplexer(reply.text()))
        }
    }

    async fn write(
        &self,
        command: &str,
        reply: Option<oneshot::Sender<SessionResult<Reply>>>,
    ) -> SessionResult<u64> {
        if command.contains(['\n', '\r']) {
            return Err(SessionError::Multiplexer(
                "command contains a line break".to_string(),
            ));
        }

        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Err(SessionError::ChannelClosed);
        };

        let seq = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SessionError::ChannelClosed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.insert(
                seq,
                Pending {
                    command: command.to_string(),
                    reply,
                },
            );
            seq
        };

        let line = format!("{command}\n");
        let result = async {
            w.write_all(line.as_bytes()).await?;
            w.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::debug!(error = %e, "control-mode write failed");
            *writer = None;
            drop(writer);
            self.fail_all();
            return Err(SessionError::ChannelClosed);
        }
        tracing::trace!(seq, command, "sent");
        Ok(seq)
    }

    /// Route a completed reply to its pending command.
    /// Returns the resolved sequence number, or `None` if the reply was discarded.
    pub fn resolve(&self, reply: Reply) -> Option<u64> {
        let pending = {
            let mut state = self.state.lock();
            if !reply.from_client() {
                tracing::trace!(number = reply.number, "discarding reply not issued here");
                return None;
            }
            let oldest = *state.pending.keys().min()?;
            let local = reply.number as i64 - state.offset;
            let keyed = u64::try_from(local)
                .ok()
                .filter(|seq| state.pending.contains_key(seq));
            let seq = match (keyed, state.last_number) {
                (Some(seq), Some(last)) if reply.number < last => seq,
                (None, Some(last)) if reply.number <= last => {
                    tracing::debug!(number = reply.number, "discarding stale reply");
                    return None;
                }
                (Some(seq), None) => seq,
                _ => oldest,
            };
            if seq == oldest && local != oldest as i64 {
                state.offset = reply.number as i64 - oldest as i64;
                tracing::debug!(
                    number = reply.number,
                    seq = oldest,
                    "resynchronised command numbering"
                );
            }
            state.last_number = state.last_number.max(Some(reply.number));
            state.pending.remove(&seq).map(|p| (seq, p))
        };

        let (seq, pending) = pending?;
        if !reply.success {
            tracing::debug!(seq, command = %pending.command, error = %reply.text(), "command failed");
        }
        if let Some(tx) = pending.reply {
            let _ = tx.send(Ok(reply));
        }
        Some(seq)
    }

    /// Fail every pending command with `ChannelClosed` and refuse new ones.
    pub fn fail_all(&self) {
        let drained: Vec<Pending> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain().map(|(_, p)| p).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending commands");
        }
        for pending in drained {
            if let Some(tx) = pending.reply {
                let _ = tx.send(Err(SessionError::ChannelClosed));
            }
        }
    }

    /// Close the write half (EOF to tmux). Pending commands stay pending.
    pub async fn close_writer(&self) {
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
    }
}

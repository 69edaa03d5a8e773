//! Card metadata mirrored into the tmux session environment, so a session
//! can be identified and restored without the board file.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::card::{CardId, CardMetadata};
use crate::tmux::Multiplexer;

pub const ENV_PREFIX: &str = "TERMQ_";

pub const KEY_CARD_ID: &str = "TERMQ_CARD_ID";
pub const KEY_TITLE: &str = "TERMQ_TITLE";
pub const KEY_DESCRIPTION: &str = "TERMQ_DESCRIPTION";
pub const KEY_TAGS: &str = "TERMQ_TAGS";
pub const KEY_BADGES: &str = "TERMQ_BADGES";
pub const KEY_LLM_PROMPT: &str = "TERMQ_LLM_PROMPT";
pub const KEY_LLM_NEXT_ACTION: &str = "TERMQ_LLM_NEXT_ACTION";
pub const KEY_COLUMN: &str = "TERMQ_COLUMN";
pub const KEY_FAVOURITE: &str = "TERMQ_FAVOURITE";

const SESSION_POLL: Duration = Duration::from_millis(25);

/// Metadata recovered from a session environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncedMetadata {
    pub card: Option<CardId>,
    pub metadata: CardMetadata,
}

/// Escape backslashes and line breaks; `show-environment` prints one variable per line.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// The environment pairs written for a card, in a fixed order.
pub fn to_env(card: &CardId, meta: &CardMetadata) -> Vec<(&'static str, String)> {
    let tags = serde_json::to_string(&meta.tags).unwrap_or_else(|_| "[]".to_string());
    let badges = serde_json::to_string(&meta.badges).unwrap_or_else(|_| "[]".to_string());
    vec![
        (KEY_CARD_ID, card.to_string()),
        (KEY_TITLE, escape_value(&meta.title)),
        (KEY_DESCRIPTION, escape_value(&meta.description)),
        (KEY_TAGS, tags),
        (KEY_BADGES, badges),
        (KEY_LLM_PROMPT, escape_value(&meta.llm_prompt)),
        (KEY_LLM_NEXT_ACTION, escape_value(&meta.llm_next_action)),
        (KEY_COLUMN, escape_value(&meta.column)),
        (KEY_FAVOURITE, if meta.favourite { "1" } else { "0" }.to_string()),
    ]
}

fn json_list<T: serde::de::DeserializeOwned>(key: &str, raw: Option<&String>) -> Vec<T> {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return Vec::new();
    };
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(key, error = %e, "ignoring unreadable session metadata");
        Vec::new()
    })
}

/// Rebuild metadata from a session environment. Missing keys read as empty.
pub fn from_env(env: &HashMap<String, String>) -> SyncedMetadata {
    let text = |key: &str| env.get(key).map(|v| unescape_value(v)).unwrap_or_default();
    let card = env.get(KEY_CARD_ID).and_then(|s| s.parse().ok());
    SyncedMetadata {
        card,
        metadata: CardMetadata {
            title: text(KEY_TITLE),
            description: text(KEY_DESCRIPTION),
            tags: json_list(KEY_TAGS, env.get(KEY_TAGS)),
            badges: json_list(KEY_BADGES, env.get(KEY_BADGES)),
            llm_prompt: text(KEY_LLM_PROMPT),
            llm_next_action: text(KEY_LLM_NEXT_ACTION),
            column: text(KEY_COLUMN),
            favourite: matches!(
                env.get(KEY_FAVOURITE).map(String::as_str),
                Some("1") | Some("true")
            ),
        },
    }
}

/// Outcome of a best-effort push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushReport {
    pub written: usize,
    pub failed: Vec<&'static str>,
}

/// Writes and reads the metadata keys through the multiplexer.
#[derive(Clone)]
pub struct MetadataSync {
    mux: Arc<dyn Multiplexer>,
}

impl MetadataSync {
    pub fn new(mux: Arc<dyn Multiplexer>) -> Self {
        Self { mux }
    }

    /// Write every key. A failing key is logged and skipped.
    pub async fn push(&self, session: &str, card: &CardId, meta: &CardMetadata) -> PushReport {
        let mut report = PushReport::default();
        for (key, value) in to_env(card, meta) {
            match self.mux.set_environment(session, key, &value).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    tracing::warn!(session, key, error = %e, "metadata sync failed");
                    report.failed.push(key);
                }
            }
        }
        tracing::debug!(session, written = report.written, "metadata pushed");
        report
    }

    /// Poll until tmux reports `session`. A freshly launched client creates
    /// its session asynchronously. Returns `false` on timeout.
    pub async fn wait_for_session(&self, session: &str, timeout: Duration) -> bool {
        let poll = async {
            loop {
                if matches!(self.mux.has_session(session).await, Ok(true)) {
                    return;
                }
                tokio::time::sleep(SESSION_POLL).await;
            }
        };
        let ready = tokio::time::timeout(timeout, poll).await.is_ok();
        if !ready {
            tracing::debug!(session, "session did not appear");
        }
        ready
    }

    pub async fn read(&self, session: &str) -> Result<SyncedMetadata> {
        let env = self.mux.show_environment(session).await?;
        Ok(from_env(&env))
    }
}

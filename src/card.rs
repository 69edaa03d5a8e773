use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Prefix shared by every managed tmux session name.
pub const SESSION_PREFIX: &str = "termq";

/// Number of hex characters of the card id carried in the session name.
pub const SESSION_SUFFIX_LEN: usize = 8;

/// Stable identifier of a terminal card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CardId(Uuid);

impl CardId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight lowercase hex characters of the id.
    pub fn short(&self) -> String {
        let simple = self.0.simple().to_string();
        simple[..SESSION_SUFFIX_LEN].to_string()
    }

    /// The external tmux session name for this card.
    pub fn session_name(&self) -> String {
        session_name(self)
    }
}

impl Default for CardId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CardId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s.trim())
            .map_err(|e| anyhow::anyhow!("Invalid card id '{s}': {e}"))?;
        Ok(Self(uuid))
    }
}

impl From<Uuid> for CardId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Build the tmux session name: `termq-<first 8 hex chars of the card id>`
pub fn session_name(card: &CardId) -> String {
    format!("{SESSION_PREFIX}-{}", card.short())
}

/// Extract the 8-hex suffix from a managed session name.
/// Returns `None` for names outside the naming convention.
pub fn parse_session_name(name: &str) -> Option<String> {
    let suffix = name.strip_prefix(SESSION_PREFIX)?.strip_prefix('-')?;
    if suffix.len() != SESSION_SUFFIX_LEN
        || !suffix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return None;
    }
    Some(suffix.to_string())
}

/// Which mechanism backs a card's shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Plain shell subprocess on a PTY.
    #[default]
    Direct,
    /// tmux client attached to the card's session on a PTY.
    Attach,
    /// tmux control-mode connection with a parsed window/pane model.
    Control,
}

impl BackendKind {
    /// Whether this backend runs through tmux.
    pub fn uses_multiplexer(&self) -> bool {
        matches!(self, BackendKind::Attach | BackendKind::Control)
    }

    pub fn all() -> &'static [BackendKind] {
        &[BackendKind::Direct, BackendKind::Attach, BackendKind::Control]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Direct => write!(f, "direct"),
            BackendKind::Attach => write!(f, "attach"),
            BackendKind::Control => write!(f, "control"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(BackendKind::Direct),
            "attach" | "tmux" => Ok(BackendKind::Attach),
            "control" | "tmux-control" => Ok(BackendKind::Control),
            _ => Err(anyhow::anyhow!(
                "Unknown backend: {s}. Use 'direct', 'attach', or 'control'."
            )),
        }
    }
}

/// Descriptive card fields mirrored into the session environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<(String, String)>,
    pub badges: Vec<String>,
    pub llm_prompt: String,
    pub llm_next_action: String,
    pub column: String,
    pub favourite: bool,
}

/// Everything the board supplies to open a card's session.
#[derive(Debug, Clone, PartialEq)]
pub struct CardSpec {
    pub id: CardId,
    pub backend: BackendKind,
    pub working_directory: PathBuf,
    pub shell: String,
    pub env: HashMap<String, String>,
    pub metadata: CardMetadata,
}

impl CardSpec {
    /// A spec with the user's login shell and home directory.
    pub fn new(id: CardId, backend: BackendKind) -> Self {
        Self {
            id,
            backend,
            working_directory: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            shell: default_shell(),
            env: HashMap::new(),
            metadata: CardMetadata::default(),
        }
    }

    pub fn session_name(&self) -> String {
        self.id.session_name()
    }
}

/// `$SHELL`, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

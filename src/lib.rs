pub mod card;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod process;
pub mod recovery;
pub mod registry;
pub mod tmux;

#[cfg(test)]
pub(crate) mod testing;

pub use card::{BackendKind, CardId, CardMetadata, CardSpec};
pub use error::{SessionError, SessionResult};
pub use registry::{SessionRef, SessionRegistry};

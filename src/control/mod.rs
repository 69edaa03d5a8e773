//! tmux control mode (`tmux -C`): wire protocol, layout parsing, the live
//! window/pane model and command correlation.

pub mod channel;
pub mod commands;
pub mod layout;
pub mod parser;
pub mod protocol;
pub mod session;
pub mod snapshot;

pub use channel::CommandChannel;
pub use parser::{ControlEvent, ControlParser, PaneOutput};
pub use protocol::{PaneId, WindowId};
pub use session::{ControlOptions, ControlSession, LinkState};
pub use snapshot::{Pane, Snapshot, Window};

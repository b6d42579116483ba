//! Multi-agent collaboration on a single task node.

pub mod channel;
pub mod executor;
pub mod state;
pub mod stats;
pub mod workspace;

pub use channel::{AgentInbox, ChannelMessage, MessageSender, RoundChannel};
pub use executor::CollaborativeExecutor;
pub use state::{AbandonReason, AgentOutcome, CollaborationReport, CollaborationState};
pub use stats::{merge_order, AgentPrStats};
pub use workspace::{CherryPick, GitWorkspace, Workspace};

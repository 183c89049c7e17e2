pub mod agent;
pub mod cli;
pub mod config;
pub mod discussion;
pub mod error;
pub mod invoker;
pub mod message;
pub mod reply;
pub mod runtime;

pub use agent::{AgentBackend, AgentProfile, CliBackend};
pub use config::ParleyConfig;
pub use discussion::{DiscussionLog, DiscussionStatus, WatchHandle};
pub use error::{ParleyError, Result, SkipReason};
pub use invoker::{CliInvoker, InvokeError, InvokeRequest};
pub use message::{Body, Message, Opinion, StatusKind};
pub use reply::{ParsedReply, ReplyError};
pub use runtime::AgentRuntime;

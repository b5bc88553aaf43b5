//! Agentvisor - actor runtime for long-lived agents
//!
//! Every agent is an actor with its own inbox. The [`Supervisor`] routes
//! work to agents, moves them through `active → sleeping → dead`, and
//! bridges the [`signals`] bus (including persisted delayed signals) to
//! agent inboxes. Before each inference turn an agent checks its context
//! budget and compacts the conversation when it would overflow.

pub mod agent;
pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod providers;
pub mod session;
pub mod signals;
pub mod storage;
pub mod supervisor;
pub mod tools;
pub mod utils;

pub use agent::{AgentDescriptor, InboxItem, InboxResult, Lifecycle};
pub use config::Config;
pub use error::{Result, VisorError};
pub use providers::{InferenceRouter, TokenSnapshot, Usage};
pub use session::{Message, Role, ToolCall};
pub use signals::{DelayedSignals, Signal, SignalSource, Signals};
pub use supervisor::{AgentTarget, Supervisor, SupervisorBuilder};

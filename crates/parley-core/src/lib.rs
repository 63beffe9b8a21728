//! Conversation-bound AI assistants: per-session agents, a cancellable
//! streaming response driver, a single-flight registry with an idle reaper,
//! and the transport/provider seams the service plugs into.

pub mod agent;
pub mod error;
pub mod history;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod tools;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use agent::{Agent, AgentContext, AuthenticatedUser};
pub use error::StartError;
pub use registry::{AgentRegistry, AgentStatus, KeyStatus, SessionKey, StartOutcome};

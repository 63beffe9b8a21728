//! Chat transport abstraction.
//!
//! The core never talks to a concrete chat backend directly. Everything a
//! conversation agent needs from its channel — event delivery, message
//! creation, overwrite-style updates, status indicators — goes through
//! [`ChatTransport`], and bot identity management goes through
//! [`TransportFactory`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Status indicator shown next to an in-progress response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Thinking,
    Generating,
    ExternalSources,
    Error,
    Clear,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Thinking => "thinking",
            StatusKind::Generating => "generating",
            StatusKind::ExternalSources => "external_sources",
            StatusKind::Error => "error",
            StatusKind::Clear => "clear",
        }
    }
}

/// Handle to a message previously created through [`ChatTransport::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub conversation_id: String,
}

/// Events delivered to transport subscribers.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A new message appeared in a conversation. `ai_generated` marks
    /// bot-authored messages so agents can ignore their own output.
    MessageNew {
        conversation_id: String,
        sender_id: String,
        text: String,
        ai_generated: bool,
    },
    /// A user asked to stop the response targeting `message_id`.
    StopGeneration { message_id: String },
}

/// Identity of a bot participant in a conversation.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: String,
    pub name: String,
    pub conversation_id: String,
}

/// One agent's connection to its chat channel.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Establish the channel session for this bot identity.
    async fn connect(&self) -> Result<()>;

    /// Subscribe to channel events. Unsubscription is dropping the receiver.
    fn subscribe(&self) -> broadcast::Receiver<ChatEvent>;

    /// Create a new bot-authored message and return a handle to it.
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<MessageRef>;

    /// Overwrite a message's text with `full_text` (not append).
    async fn update_message(&self, message: &MessageRef, full_text: &str) -> Result<()>;

    /// Publish a status indicator for the given message.
    async fn send_status(&self, kind: StatusKind, message: &MessageRef) -> Result<()>;

    /// Tear down the channel session.
    async fn disconnect(&self) -> Result<()>;
}

/// Creates per-agent transports and manages the external bot identities
/// behind them. The registry deletes an identity whenever it disposes the
/// agent that owns it, including the loser of a creation race.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, identity: &BotIdentity) -> Result<Arc<dyn ChatTransport>>;

    /// Remove the external identity for a bot. Must tolerate unknown ids.
    async fn delete_identity(&self, bot_id: &str) -> Result<()>;
}

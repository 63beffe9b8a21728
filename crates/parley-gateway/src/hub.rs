//! In-memory chat hub.
//!
//! Holds the message store and the WebSocket fanout for every conversation,
//! and exposes the hub to agents through [`HubTransport`]. The hub is the
//! single source of truth for message text; agents overwrite their message
//! by id and clients only ever see full snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use parley_core::transport::{
    BotIdentity, ChatEvent, ChatTransport, MessageRef, StatusKind, TransportFactory,
};

type SocketSender = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub sender_id: String,
    pub text: String,
    pub ai_generated: bool,
    pub created_at: String,
}

/// Frames pushed to WebSocket clients.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsFrame<'a> {
    History { messages: &'a [StoredMessage] },
    Message { message: &'a StoredMessage },
    MessageUpdated { message: &'a StoredMessage },
    Status { kind: StatusKind, message_id: &'a str },
}

#[derive(Default)]
struct Conversation {
    messages: Vec<StoredMessage>,
    sockets: HashMap<u64, SocketSender>,
}

pub struct ChatHub {
    conversations: DashMap<String, Conversation>,
    /// bot id -> conversation it is serving.
    bots: DashMap<String, String>,
    events: broadcast::Sender<ChatEvent>,
    next_conn: AtomicU64,
}

impl ChatHub {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            conversations: DashMap::new(),
            bots: DashMap::new(),
            events,
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn bot_count(&self) -> usize {
        self.bots.len()
    }

    /// Store a human message, push it to the conversation's sockets, and
    /// publish it so the conversation's agent can respond.
    pub fn post_human_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> StoredMessage {
        let message = self.store_message(conversation_id, sender_id, text, false);
        let _ = self.events.send(ChatEvent::MessageNew {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            ai_generated: false,
        });
        message
    }

    /// Ask whichever driver owns `message_id` to stop generating.
    pub fn request_stop(&self, message_id: &str) {
        debug!("stop requested for message {message_id}");
        let _ = self.events.send(ChatEvent::StopGeneration {
            message_id: message_id.to_string(),
        });
    }

    fn post_bot_message(&self, conversation_id: &str, bot_id: &str, text: &str) -> MessageRef {
        let message = self.store_message(conversation_id, bot_id, text, true);
        let _ = self.events.send(ChatEvent::MessageNew {
            conversation_id: conversation_id.to_string(),
            sender_id: bot_id.to_string(),
            text: text.to_string(),
            ai_generated: true,
        });
        MessageRef {
            id: message.id,
            conversation_id: conversation_id.to_string(),
        }
    }

    fn store_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
        ai_generated: bool,
    ) -> StoredMessage {
        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            ai_generated,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let mut conversation = self.conversations.entry(conversation_id.to_string()).or_default();
        conversation.messages.push(message.clone());
        Self::fanout(&conversation, &WsFrame::Message { message: &message });
        message
    }

    fn update_message(&self, message: &MessageRef, full_text: &str) -> Result<()> {
        let Some(mut conversation) = self.conversations.get_mut(&message.conversation_id) else {
            bail!("unknown conversation {}", message.conversation_id);
        };
        let Some(stored) = conversation
            .messages
            .iter_mut()
            .find(|m| m.id == message.id)
        else {
            bail!("unknown message {} in {}", message.id, message.conversation_id);
        };
        stored.text = full_text.to_string();
        let snapshot = stored.clone();
        Self::fanout(
            &conversation,
            &WsFrame::MessageUpdated { message: &snapshot },
        );
        Ok(())
    }

    fn send_status(&self, kind: StatusKind, message: &MessageRef) {
        if let Some(conversation) = self.conversations.get(&message.conversation_id) {
            Self::fanout(
                &conversation,
                &WsFrame::Status {
                    kind,
                    message_id: &message.id,
                },
            );
        }
    }

    fn fanout(conversation: &Conversation, frame: &WsFrame<'_>) {
        let json = match serde_json::to_string(frame) {
            Ok(j) => j,
            Err(e) => {
                warn!("failed to encode ws frame: {e}");
                return;
            }
        };
        for (conn_id, tx) in &conversation.sockets {
            if tx.send(json.clone()).is_err() {
                warn!("ws send failed for conn={conn_id}, will clean up on disconnect");
            }
        }
    }

    /// Register a client socket and replay the conversation so far.
    pub fn attach_socket(&self, conversation_id: &str) -> (u64, mpsc::UnboundedReceiver<String>) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut conversation = self.conversations.entry(conversation_id.to_string()).or_default();
        if !conversation.messages.is_empty() {
            if let Ok(json) = serde_json::to_string(&WsFrame::History {
                messages: &conversation.messages,
            }) {
                let _ = tx.send(json);
            }
        }
        conversation.sockets.insert(conn_id, tx);
        (conn_id, rx)
    }

    pub fn detach_socket(&self, conversation_id: &str, conn_id: u64) {
        if let Some(mut conversation) = self.conversations.get_mut(conversation_id) {
            conversation.sockets.remove(&conn_id);
        }
    }

    fn register_bot(&self, bot_id: &str, conversation_id: &str) {
        info!("bot {bot_id} joined {conversation_id}");
        self.bots
            .insert(bot_id.to_string(), conversation_id.to_string());
    }

    pub fn remove_bot(&self, bot_id: &str) {
        if self.bots.remove(bot_id).is_some() {
            info!("bot {bot_id} removed");
        }
    }
}

/// The agent-facing side of the hub.
pub struct HubTransport {
    hub: Arc<ChatHub>,
    bot: BotIdentity,
}

#[async_trait]
impl ChatTransport for HubTransport {
    async fn connect(&self) -> Result<()> {
        self.hub.register_bot(&self.bot.id, &self.bot.conversation_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.hub.subscribe()
    }

    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<MessageRef> {
        Ok(self.hub.post_bot_message(conversation_id, &self.bot.id, text))
    }

    async fn update_message(&self, message: &MessageRef, full_text: &str) -> Result<()> {
        self.hub.update_message(message, full_text)
    }

    async fn send_status(&self, kind: StatusKind, message: &MessageRef) -> Result<()> {
        self.hub.send_status(kind, message);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.hub.remove_bot(&self.bot.id);
        Ok(())
    }
}

/// Hands out [`HubTransport`]s to the agent registry.
pub struct HubFactory {
    hub: Arc<ChatHub>,
}

impl HubFactory {
    pub fn new(hub: Arc<ChatHub>) -> Arc<Self> {
        Arc::new(Self { hub })
    }
}

#[async_trait]
impl TransportFactory for HubFactory {
    async fn create(&self, identity: &BotIdentity) -> Result<Arc<dyn ChatTransport>> {
        Ok(Arc::new(HubTransport {
            hub: Arc::clone(&self.hub),
            bot: identity.clone(),
        }))
    }

    async fn delete_identity(&self, bot_id: &str) -> Result<()> {
        self.hub.remove_bot(bot_id);
        Ok(())
    }
}

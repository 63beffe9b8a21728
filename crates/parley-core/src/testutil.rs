//! In-memory doubles for the transport and provider seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::history::ChatMessage;
use crate::provider::{GenerationProvider, GenerationTurn, StreamChunk, ToolOutcome};
use crate::transport::{
    BotIdentity, ChatEvent, ChatTransport, MessageRef, StatusKind, TransportFactory,
};

/// Transport double that records every outbound call and lets tests inject
/// inbound events through the shared broadcast channel.
pub struct RecordingTransport {
    events: broadcast::Sender<ChatEvent>,
    next_id: AtomicUsize,
    /// (message id, full text) for every update_message call, in order.
    pub updates: Mutex<Vec<(String, String)>>,
    /// (status, message id) for every send_status call, in order.
    pub statuses: Mutex<Vec<(StatusKind, String)>>,
    /// (conversation id, initial text) for every send_message call.
    pub sent: Mutex<Vec<(String, String)>>,
    pub connected: AtomicBool,
    pub disconnects: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            next_id: AtomicUsize::new(1),
            updates: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_human(&self, conversation_id: &str, text: &str) {
        self.emit(ChatEvent::MessageNew {
            conversation_id: conversation_id.to_string(),
            sender_id: "human".to_string(),
            text: text.to_string(),
            ai_generated: false,
        });
    }

    pub fn emit_stop(&self, message_id: &str) {
        self.emit(ChatEvent::StopGeneration {
            message_id: message_id.to_string(),
        });
    }

    pub fn updates_for(&self, message_id: &str) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == message_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn statuses_for(&self, message_id: &str) -> Vec<StatusKind> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, id)| id == message_id)
            .map(|(kind, _)| *kind)
            .collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<MessageRef> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("m{n}");
        self.sent
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), text.to_string()));
        Ok(MessageRef {
            id,
            conversation_id: conversation_id.to_string(),
        })
    }

    async fn update_message(&self, message: &MessageRef, full_text: &str) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((message.id.clone(), full_text.to_string()));
        Ok(())
    }

    async fn send_status(&self, kind: StatusKind, message: &MessageRef) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((kind, message.id.clone()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One scripted model turn: a queue of chunk segments, advanced by
/// `submit_tool_results`.
pub struct ScriptedTurn {
    segments: VecDeque<VecDeque<Result<StreamChunk>>>,
    current: VecDeque<Result<StreamChunk>>,
    chunk_delay: Duration,
    submitted: Arc<Mutex<Vec<Vec<ToolOutcome>>>>,
    aborted: Arc<AtomicBool>,
}

#[async_trait]
impl GenerationTurn for ScriptedTurn {
    async fn next_chunk(&mut self) -> Option<Result<StreamChunk>> {
        // The pop happens in the same poll that observes the elapsed sleep,
        // so an abandoned call never swallows a chunk.
        tokio::time::sleep(self.chunk_delay).await;
        self.current.pop_front()
    }

    async fn submit_tool_results(&mut self, outcomes: Vec<ToolOutcome>) -> Result<()> {
        self.submitted.lock().unwrap().push(outcomes);
        match self.segments.pop_front() {
            Some(next) => {
                self.current = next;
                Ok(())
            }
            None => bail!("no scripted segment left"),
        }
    }

    fn abort(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Script for one `start_turn` call.
pub struct TurnScript {
    pub segments: Vec<Vec<Result<StreamChunk>>>,
    pub chunk_delay: Duration,
}

impl TurnScript {
    pub fn text_only(chunks: &[&str]) -> Self {
        Self {
            segments: vec![chunks.iter().map(|t| Ok(StreamChunk::text(*t))).collect()],
            chunk_delay: Duration::from_millis(1),
        }
    }
}

/// Provider double that replays [`TurnScript`]s in order and records what
/// each turn was started with.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<TurnScript>>,
    pub credentials_ok: AtomicBool,
    /// (system prompt, prior history, live user message) per start_turn.
    pub starts: Mutex<Vec<(String, Vec<ChatMessage>, String)>>,
    pub submitted: Arc<Mutex<Vec<Vec<ToolOutcome>>>>,
    pub aborted: Arc<AtomicBool>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<TurnScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            credentials_ok: AtomicBool::new(true),
            starts: Mutex::new(Vec::new()),
            submitted: Arc::new(Mutex::new(Vec::new())),
            aborted: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn check_credentials(&self) -> Result<()> {
        if self.credentials_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            bail!("no API key configured")
        }
    }

    async fn start_turn(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_message: &str,
        _tool_defs: Vec<serde_json::Value>,
    ) -> Result<Box<dyn GenerationTurn>> {
        self.starts.lock().unwrap().push((
            system_prompt.to_string(),
            history.to_vec(),
            user_message.to_string(),
        ));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted turn left"))?;
        let mut segments: VecDeque<VecDeque<Result<StreamChunk>>> =
            script.segments.into_iter().map(Into::into).collect();
        let current = segments.pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedTurn {
            segments,
            current,
            chunk_delay: script.chunk_delay,
            submitted: Arc::clone(&self.submitted),
            aborted: Arc::clone(&self.aborted),
        }))
    }
}

/// Factory that hands out one shared [`RecordingTransport`] per create call
/// and counts identity deletions. `create_delay` widens the creation window
/// for race tests.
pub struct CountingFactory {
    pub transport: Arc<RecordingTransport>,
    pub created: AtomicUsize,
    pub deleted: Mutex<Vec<String>>,
    pub create_delay: Duration,
    pub fail_creation: AtomicBool,
}

impl CountingFactory {
    pub fn new(transport: Arc<RecordingTransport>) -> Arc<Self> {
        Self::slow(transport, Duration::ZERO)
    }

    pub fn slow(transport: Arc<RecordingTransport>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            created: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
            create_delay: delay,
            fail_creation: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl TransportFactory for CountingFactory {
    async fn create(&self, _identity: &BotIdentity) -> Result<Arc<dyn ChatTransport>> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.fail_creation.load(Ordering::SeqCst) {
            bail!("transport backend unavailable");
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.transport) as Arc<dyn ChatTransport>)
    }

    async fn delete_identity(&self, bot_id: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(bot_id.to_string());
        Ok(())
    }
}

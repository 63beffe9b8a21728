//! A conversation-bound assistant.
//!
//! Each agent owns one chat connection, one transcript, and the set of
//! in-flight response drivers for its conversation. The registry keeps at
//! most one agent per session key.

pub mod driver;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_config::Config;

use crate::error::StartError;
use crate::history::{new_transcript, ChatMessage, Transcript};
use crate::prompt::build_system_prompt;
use crate::provider::GenerationProvider;
use crate::tools::ToolRegistry;
use crate::transport::{ChatEvent, ChatTransport, StatusKind};

use driver::ResponseDriver;

/// Identity of the human the agent is serving, carried into the prompt.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub uid: String,
    pub email: Option<String>,
}

/// Everything needed to bring an agent up for one conversation.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub conversation_id: String,
    pub agreement_summary: Option<String>,
    pub user: Option<AuthenticatedUser>,
}

pub struct Agent {
    transport: Arc<dyn ChatTransport>,
    provider: Arc<dyn GenerationProvider>,
    tools: Arc<ToolRegistry>,
    conversation_id: String,
    system_prompt: OnceLock<Arc<str>>,
    transcript: Transcript,
    last_interaction: tokio::sync::Mutex<Instant>,
    drivers: Arc<DashMap<String, Arc<ResponseDriver>>>,
    listen_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    flush_interval: Duration,
    disposed: AtomicBool,
}

impl Agent {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        provider: Arc<dyn GenerationProvider>,
        tools: Arc<ToolRegistry>,
        conversation_id: String,
        config: &Config,
    ) -> Self {
        Self {
            transport,
            provider,
            tools,
            conversation_id,
            system_prompt: OnceLock::new(),
            transcript: new_transcript(),
            last_interaction: tokio::sync::Mutex::new(Instant::now()),
            drivers: Arc::new(DashMap::new()),
            listen_task: tokio::sync::Mutex::new(None),
            flush_interval: Duration::from_millis(config.agents.flush_interval_ms),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Instant of the most recent human message, for the idle reaper.
    pub async fn last_interaction(&self) -> Instant {
        *self.last_interaction.lock().await
    }

    pub fn active_driver_count(&self) -> usize {
        self.drivers.len()
    }

    pub fn transcript(&self) -> Transcript {
        Arc::clone(&self.transcript)
    }

    /// Verify credentials, join the conversation, and start listening.
    pub async fn init(self: &Arc<Self>, ctx: &AgentContext) -> Result<(), StartError> {
        self.provider
            .check_credentials()
            .map_err(StartError::MissingCredential)?;

        let prompt = build_system_prompt(ctx.agreement_summary.as_deref(), ctx.user.as_ref());
        let _ = self.system_prompt.set(Arc::from(prompt));

        self.transport
            .connect()
            .await
            .map_err(StartError::CreationFailed)?;

        let mut events = self.transport.subscribe();
        let agent = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChatEvent::MessageNew {
                        conversation_id,
                        sender_id,
                        text,
                        ai_generated,
                    }) => {
                        if conversation_id != agent.conversation_id
                            || ai_generated
                            || text.trim().is_empty()
                        {
                            continue;
                        }
                        debug!(
                            "inbound message from {sender_id} in {}",
                            agent.conversation_id
                        );
                        if let Err(e) = agent.handle_inbound(&text).await {
                            warn!(
                                "failed to start response in {}: {e:#}",
                                agent.conversation_id
                            );
                        }
                    }
                    Ok(ChatEvent::StopGeneration { .. }) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("agent event stream lagged by {n}");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.listen_task.lock().await = Some(task);
        Ok(())
    }

    /// Record the message, open a placeholder reply, and spawn a driver.
    async fn handle_inbound(self: &Arc<Self>, text: &str) -> anyhow::Result<()> {
        *self.last_interaction.lock().await = Instant::now();

        let snapshot = {
            let mut transcript = self.transcript.lock().await;
            transcript.push(ChatMessage::user(text));
            transcript.clone()
        };

        let message = self
            .transport
            .send_message(&self.conversation_id, "")
            .await?;
        self.transport
            .send_status(StatusKind::Thinking, &message)
            .await?;

        let prompt = self
            .system_prompt
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::from(build_system_prompt(None, None)));

        let driver = Arc::new(ResponseDriver::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.tools),
            Arc::clone(&self.transport),
            Arc::clone(&self.transcript),
            snapshot,
            prompt,
            message.clone(),
            self.flush_interval,
            Arc::clone(&self.drivers),
        ));
        self.drivers.insert(message.id.clone(), Arc::clone(&driver));
        let events = self.transport.subscribe();
        tokio::spawn(driver.run(events));
        Ok(())
    }

    /// Tear the agent down: stop listening, cancel every in-flight driver,
    /// and leave the conversation. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("disposing agent for {}", self.conversation_id);

        if let Some(task) = self.listen_task.lock().await.take() {
            task.abort();
        }

        // Collect first; cancel() removes entries from the same map.
        let drivers: Vec<Arc<ResponseDriver>> =
            self.drivers.iter().map(|e| Arc::clone(e.value())).collect();
        for driver in drivers {
            driver.cancel().await;
        }
        self.drivers.clear();

        if let Err(e) = self.transport.disconnect().await {
            warn!("disconnect failed for {}: {e:#}", self.conversation_id);
        }
    }
}

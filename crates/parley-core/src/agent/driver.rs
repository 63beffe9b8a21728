//! Streaming response driver.
//!
//! One driver runs one model response to completion: it consumes the chunk
//! stream, flushes accumulated text to the outbound message on a throttle,
//! executes tool calls between stream segments, and ends in exactly one of
//! done / cancelled / errored. Dispose is idempotent; every path funnels
//! through the `is_done` flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::history::{ChatMessage, Transcript};
use crate::provider::{GenerationProvider, ToolOutcome};
use crate::tools::ToolRegistry;
use crate::transport::{ChatEvent, ChatTransport, MessageRef, StatusKind};

pub struct ResponseDriver {
    provider: Arc<dyn GenerationProvider>,
    tools: Arc<ToolRegistry>,
    transport: Arc<dyn ChatTransport>,
    transcript: Transcript,
    /// Transcript state at spawn time; the last entry is the live user message.
    snapshot: Vec<ChatMessage>,
    system_prompt: Arc<str>,
    message: MessageRef,
    flush_interval: Duration,
    is_done: AtomicBool,
    /// Owner's driver set; the driver removes itself on dispose.
    owner: Arc<DashMap<String, Arc<ResponseDriver>>>,
}

impl ResponseDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        tools: Arc<ToolRegistry>,
        transport: Arc<dyn ChatTransport>,
        transcript: Transcript,
        snapshot: Vec<ChatMessage>,
        system_prompt: Arc<str>,
        message: MessageRef,
        flush_interval: Duration,
        owner: Arc<DashMap<String, Arc<ResponseDriver>>>,
    ) -> Self {
        Self {
            provider,
            tools,
            transport,
            transcript,
            snapshot,
            system_prompt,
            message,
            flush_interval,
            is_done: AtomicBool::new(false),
            owner,
        }
    }

    pub fn is_done(&self) -> bool {
        self.is_done.load(Ordering::SeqCst)
    }

    /// Run the turn to a terminal state. Spawned fire-and-forget by the agent,
    /// which subscribes `events` before spawning so no stop signal is missed.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<ChatEvent>) {
        if let Err(e) = self.generate(&mut events).await {
            self.fail(&e).await;
        }
    }

    /// Cancellation path: quiet cleanup, no error text, no transcript append.
    /// Safe to call any number of times, including after natural completion.
    pub async fn cancel(&self) {
        if self.is_done.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stop generating for message {}", self.message.id);
        if let Err(e) = self
            .transport
            .send_status(StatusKind::Clear, &self.message)
            .await
        {
            warn!("failed to clear status for {}: {e}", self.message.id);
        }
        self.owner.remove(&self.message.id);
    }

    /// The generation loop. Returns Ok on completion *and* on cancellation;
    /// Err only for failures that should surface as an error message.
    async fn generate(&self, events: &mut broadcast::Receiver<ChatEvent>) -> Result<()> {
        let (live, earlier) = self
            .snapshot
            .split_last()
            .ok_or_else(|| anyhow::anyhow!("driver spawned with empty transcript snapshot"))?;

        let mut turn = self
            .provider
            .start_turn(
                &self.system_prompt,
                earlier,
                &live.content,
                self.tools.definitions(),
            )
            .await?;

        let mut accumulated = String::new();
        let mut last_flush: Option<Instant> = None;
        let mut events_open = true;

        loop {
            let mut tool_calls = Vec::new();

            // Consume one chunk sequence, watching for a stop signal.
            loop {
                if self.is_done() {
                    turn.abort();
                    return Ok(());
                }

                let next = tokio::select! {
                    biased;
                    event = events.recv(), if events_open => {
                        match event {
                            Ok(ChatEvent::StopGeneration { ref message_id })
                                if *message_id == self.message.id =>
                            {
                                turn.abort();
                                self.cancel().await;
                                return Ok(());
                            }
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("driver event stream lagged by {n}");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                events_open = false;
                                continue;
                            }
                        }
                    }
                    chunk = turn.next_chunk() => chunk,
                };

                let Some(chunk) = next else { break };
                let chunk = chunk?;
                if self.is_done() {
                    turn.abort();
                    return Ok(());
                }

                if let Some(text) = chunk.text {
                    if !text.is_empty() {
                        accumulated.push_str(&text);
                        let due = last_flush
                            .map_or(true, |at| at.elapsed() >= self.flush_interval);
                        if due {
                            self.transport
                                .update_message(&self.message, &accumulated)
                                .await?;
                            last_flush = Some(Instant::now());
                        }
                    }
                }
                tool_calls.extend(chunk.tool_calls);
            }

            if tool_calls.is_empty() {
                break;
            }
            if self.is_done() {
                turn.abort();
                return Ok(());
            }

            self.transport
                .send_status(StatusKind::ExternalSources, &self.message)
                .await?;

            let mut outcomes = Vec::with_capacity(tool_calls.len());
            for call in tool_calls {
                if self.is_done() {
                    turn.abort();
                    return Ok(());
                }
                info!("executing tool {} for message {}", call.name, self.message.id);
                let result = match self.tools.execute(&call.name, call.arguments.clone()).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("tool {} failed: {e}", call.name);
                        serde_json::json!({
                            "error": format!("tool '{}' failed: {e}", call.name),
                        })
                        .to_string()
                    }
                };
                outcomes.push(ToolOutcome {
                    name: call.name,
                    result,
                });
            }

            self.transport
                .send_status(StatusKind::Generating, &self.message)
                .await?;
            turn.submit_tool_results(outcomes).await?;
        }

        if self.is_done() {
            return Ok(());
        }

        // Final flush is unconditional, regardless of throttle state.
        self.transport
            .update_message(&self.message, &accumulated)
            .await?;
        self.transcript
            .lock()
            .await
            .push(ChatMessage::model(accumulated));
        self.transport
            .send_status(StatusKind::Clear, &self.message)
            .await?;
        self.finish();
        Ok(())
    }

    /// Error path: visible error text, error status, quiet dispose.
    async fn fail(&self, err: &anyhow::Error) {
        if self.is_done.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(
            "response generation failed for message {}: {err:#}",
            self.message.id
        );
        if let Err(e) = self
            .transport
            .send_status(StatusKind::Error, &self.message)
            .await
        {
            warn!("failed to send error status for {}: {e}", self.message.id);
        }
        let text = format!("Something went wrong while generating this response: {err}");
        if let Err(e) = self.transport.update_message(&self.message, &text).await {
            warn!("failed to write error text for {}: {e}", self.message.id);
        }
        // The error text stays; the spinner does not.
        if let Err(e) = self
            .transport
            .send_status(StatusKind::Clear, &self.message)
            .await
        {
            warn!("failed to clear status for {}: {e}", self.message.id);
        }
        self.owner.remove(&self.message.id);
    }

    fn finish(&self) {
        if self.is_done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.owner.remove(&self.message.id);
    }
}

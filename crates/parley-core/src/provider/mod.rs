//! Generation provider abstraction.
//!
//! A turn is a lazy, finite, non-restartable sequence of [`StreamChunk`]s.
//! Submitting tool results re-arms the same turn with a fresh chunk
//! sequence, so one [`GenerationTurn`] can span several tool round trips.

pub mod gemini;

use anyhow::Result;
use async_trait::async_trait;

use crate::history::ChatMessage;

pub use gemini::GeminiProvider;

/// A tool invocation requested by the model mid-stream.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One increment of a streaming response.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            text: None,
            tool_calls: vec![ToolCallRequest {
                name: name.into(),
                arguments,
            }],
        }
    }
}

/// Result of executing one requested tool call. `result` is always a JSON
/// string; tool failures arrive as `{"error": ...}` payloads, never as Err.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub name: String,
    pub result: String,
}

/// One in-flight model response, possibly spanning tool round trips.
#[async_trait]
pub trait GenerationTurn: Send {
    /// Next chunk of the current sequence. `None` means the sequence is
    /// exhausted; if tool calls were collected the caller resumes via
    /// [`GenerationTurn::submit_tool_results`]. Must be cancellation-safe:
    /// an abandoned call must not lose a chunk.
    async fn next_chunk(&mut self) -> Option<Result<StreamChunk>>;

    /// Feed tool results back and start the next chunk sequence.
    async fn submit_tool_results(&mut self, results: Vec<ToolOutcome>) -> Result<()>;

    /// Best-effort cancellation of the in-flight request.
    fn abort(&mut self);
}

/// Starts generation turns against an external model.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Verify required credentials are present. Called at agent init;
    /// failure is fatal to agent construction.
    fn check_credentials(&self) -> Result<()>;

    /// Begin a turn. `history` is every transcript entry except the newest
    /// user message, which is passed separately as the live turn input.
    async fn start_turn(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_message: &str,
        tool_defs: Vec<serde_json::Value>,
    ) -> Result<Box<dyn GenerationTurn>>;
}

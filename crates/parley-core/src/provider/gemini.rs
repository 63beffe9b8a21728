//! Gemini streaming client.
//!
//! Talks to the `streamGenerateContent` REST endpoint with `alt=sse` and
//! parses the `data:` lines into [`StreamChunk`]s. The driver runs its own
//! tool dispatch loop, so this client only carries the wire conversation:
//! tool results go back as `functionResponse` parts and the turn is
//! re-dispatched with the accumulated `contents`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use parley_config::GeminiConfig;

use crate::history::{ChatMessage, Role};
use crate::provider::{GenerationProvider, GenerationTurn, StreamChunk, ToolCallRequest, ToolOutcome};

const STREAM_BUFFER: usize = 32;

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(config: &GeminiConfig, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent",
            self.api_base, self.model
        )
    }
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    fn check_credentials(&self) -> Result<()> {
        if self.api_key.is_empty() {
            bail!("Gemini API key is required. Set providers.gemini.apiKey in config.json or the GEMINI_API_KEY env var.");
        }
        Ok(())
    }

    async fn start_turn(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_message: &str,
        tool_defs: Vec<serde_json::Value>,
    ) -> Result<Box<dyn GenerationTurn>> {
        self.check_credentials()?;

        let mut contents: Vec<serde_json::Value> = history
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Model => "model",
                };
                serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();
        contents.push(serde_json::json!({
            "role": "user",
            "parts": [{ "text": user_message }]
        }));

        let mut request_base = serde_json::json!({
            "systemInstruction": { "parts": [{ "text": system_prompt }] },
        });
        if !tool_defs.is_empty() {
            request_base["tools"] = serde_json::json!([{ "functionDeclarations": tool_defs }]);
        }

        let mut turn = GeminiTurn {
            client: self.client.clone(),
            url: self.stream_url(),
            api_key: self.api_key.clone(),
            request_base,
            contents,
            segment_parts: Vec::new(),
            rx: None,
            reader: None,
        };
        turn.dispatch().await?;
        Ok(Box::new(turn))
    }
}

struct GeminiTurn {
    client: reqwest::Client,
    url: String,
    api_key: String,
    /// systemInstruction + tools; contents are filled in per dispatch.
    request_base: serde_json::Value,
    contents: Vec<serde_json::Value>,
    /// Model parts seen in the current chunk sequence, replayed into
    /// `contents` when the turn resumes with tool results.
    segment_parts: Vec<serde_json::Value>,
    rx: Option<mpsc::Receiver<Result<StreamChunk>>>,
    reader: Option<JoinHandle<()>>,
}

impl GeminiTurn {
    async fn dispatch(&mut self) -> Result<()> {
        let mut body = self.request_base.clone();
        body["contents"] = serde_json::Value::Array(self.contents.clone());

        let response = self
            .client
            .post(&self.url)
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("Gemini request failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            bail!("Gemini request failed ({status}): {detail}");
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.reader = Some(tokio::spawn(read_sse(response, tx)));
        self.rx = Some(rx);
        Ok(())
    }

    fn record_chunk(&mut self, chunk: &StreamChunk) {
        if let Some(ref text) = chunk.text {
            self.segment_parts.push(serde_json::json!({ "text": text }));
        }
        for call in &chunk.tool_calls {
            self.segment_parts.push(serde_json::json!({
                "functionCall": { "name": call.name, "args": call.arguments }
            }));
        }
    }
}

#[async_trait]
impl GenerationTurn for GeminiTurn {
    async fn next_chunk(&mut self) -> Option<Result<StreamChunk>> {
        let rx = self.rx.as_mut()?;
        let item = rx.recv().await;
        match item {
            Some(Ok(chunk)) => {
                self.record_chunk(&chunk);
                Some(Ok(chunk))
            }
            Some(Err(e)) => Some(Err(e)),
            None => {
                self.rx = None;
                None
            }
        }
    }

    async fn submit_tool_results(&mut self, results: Vec<ToolOutcome>) -> Result<()> {
        let model_parts = std::mem::take(&mut self.segment_parts);
        self.contents
            .push(serde_json::json!({ "role": "model", "parts": model_parts }));

        let response_parts: Vec<serde_json::Value> = results
            .iter()
            .map(|outcome| {
                // Prefer structured results; fall back to the raw string.
                let result: serde_json::Value = serde_json::from_str(&outcome.result)
                    .unwrap_or_else(|_| serde_json::Value::String(outcome.result.clone()));
                serde_json::json!({
                    "functionResponse": {
                        "name": outcome.name,
                        "response": { "result": result }
                    }
                })
            })
            .collect();
        self.contents
            .push(serde_json::json!({ "role": "user", "parts": response_parts }));

        self.dispatch().await
    }

    fn abort(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        self.rx = None;
    }
}

impl Drop for GeminiTurn {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
    }
}

/// Read the SSE body line by line and forward parsed chunks.
async fn read_sse(response: reqwest::Response, tx: mpsc::Sender<Result<StreamChunk>>) {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(item) = stream.next().await {
        let bytes = match item {
            Ok(b) => b,
            Err(e) => {
                let _ = tx.send(Err(anyhow!("stream read error: {e}"))).await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            let line = line.trim();
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload.is_empty() || payload == "[DONE]" {
                continue;
            }

            match serde_json::from_str::<serde_json::Value>(payload) {
                Ok(value) => {
                    let chunk = parse_chunk(&value);
                    if chunk.text.is_none() && chunk.tool_calls.is_empty() {
                        debug!("skipping contentless stream payload");
                        continue;
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(anyhow!("malformed stream payload: {e}")))
                        .await;
                    return;
                }
            }
        }
    }
}

/// Extract text and function calls from one streamed candidate payload.
fn parse_chunk(value: &serde_json::Value) -> StreamChunk {
    let mut chunk = StreamChunk::default();

    let parts = value
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array());
    let Some(parts) = parts else {
        return chunk;
    };

    for part in parts {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            if !text.is_empty() {
                chunk
                    .text
                    .get_or_insert_with(String::new)
                    .push_str(text);
            }
        }
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            let arguments = call
                .get("args")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            chunk.tool_calls.push(ToolCallRequest { name, arguments });
        }
    }

    chunk
}

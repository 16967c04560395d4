//! Decoded form of the Assistants streaming protocol.
//!
//! The run stream arrives as server-sent events (`event:` name line plus a
//! `data:` JSON line). Everything is decoded here, once, into the closed
//! [`AssistantEvent`] enum; the rest of the crate never sees raw payloads.

use serde::Deserialize;
use tracing::warn;

/// One decoded event from a streaming run. Kinds the aggregator does not
/// fold are collapsed into `Ignored` at the boundary.
#[derive(Debug)]
pub enum AssistantEvent {
    StepCreated(RunStep),
    StepDelta(RunStepDelta),
    StepCompleted(RunStep),
    MessageCreated,
    MessageDelta(MessageDelta),
    /// The run ended abnormally (`event: error` or `thread.run.failed`).
    RunFailed { message: String },
    /// Terminal `data: [DONE]` marker.
    Done,
    Ignored,
}

// ── Run step payloads ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub step_details: StepDetails,
}

impl RunStep {
    pub fn is_tool_calls(&self) -> bool {
        matches!(self.step_details, StepDetails::ToolCalls { .. })
    }

    /// The first code-interpreter invocation of this step, if any. The run is
    /// started with a forced code-interpreter tool choice, so there is never
    /// more than one.
    pub fn code_interpreter(&self) -> Option<&CodeInterpreterCall> {
        match &self.step_details {
            StepDetails::ToolCalls { tool_calls } => {
                tool_calls.iter().find_map(|call| match call {
                    ToolCall::CodeInterpreter { code_interpreter } => Some(code_interpreter),
                    ToolCall::Unsupported => None,
                })
            }
            StepDetails::MessageCreation {} => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDetails {
    MessageCreation {},
    ToolCalls {
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCall {
    CodeInterpreter {
        #[serde(default)]
        code_interpreter: CodeInterpreterCall,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Default, Deserialize)]
pub struct CodeInterpreterCall {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub outputs: Vec<CodeInterpreterOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeInterpreterOutput {
    Logs { logs: String },
    Image { image: ImageFileRef },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub struct ImageFileRef {
    pub file_id: String,
}

// ── Step delta payloads ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunStepDelta {
    pub id: String,
    pub delta: StepDeltaBody,
}

impl RunStepDelta {
    /// The code fragment carried by this delta, if it targets the
    /// code-interpreter input.
    pub fn code_input(&self) -> Option<&str> {
        match self.delta.step_details.as_ref()? {
            StepDeltaDetails::ToolCalls { tool_calls } => tool_calls
                .first()?
                .code_interpreter
                .as_ref()?
                .input
                .as_deref(),
            StepDeltaDetails::Unsupported => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StepDeltaBody {
    #[serde(default)]
    pub step_details: Option<StepDeltaDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDeltaDetails {
    ToolCalls {
        #[serde(default)]
        tool_calls: Vec<ToolCallDelta>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub code_interpreter: Option<CodeInterpreterDelta>,
}

#[derive(Debug, Deserialize)]
pub struct CodeInterpreterDelta {
    #[serde(default)]
    pub input: Option<String>,
}

// ── Message delta payloads ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MessageDelta {
    pub delta: MessageDeltaBody,
}

impl MessageDelta {
    /// The text fragment carried by this delta, when the first content block
    /// is text.
    pub fn text_value(&self) -> Option<&str> {
        match self.delta.content.first()? {
            MessageContentDelta::Text { text } => text.value.as_deref(),
            MessageContentDelta::Unsupported => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub content: Vec<MessageContentDelta>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContentDelta {
    Text {
        #[serde(default)]
        text: TextValue,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Default, Deserialize)]
pub struct TextValue {
    #[serde(default)]
    pub value: Option<String>,
}

// ── Failure payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RunObject {
    #[serde(default)]
    last_error: Option<RunLastError>,
}

#[derive(Debug, Deserialize)]
struct RunLastError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEventBody {
    #[serde(default)]
    error: Option<ErrorDetail>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

// ── Decoding ─────────────────────────────────────────────────────────────────

const DONE_MARKER: &str = "[DONE]";

/// Map one named SSE payload onto an [`AssistantEvent`]. Unknown names and
/// undecodable payloads degrade to `Ignored` so one odd event cannot take
/// down the whole stream.
pub fn decode_event(name: &str, data: &str) -> AssistantEvent {
    if data.trim() == DONE_MARKER {
        return AssistantEvent::Done;
    }

    match name {
        "thread.run.step.created" => parse(name, data)
            .map(AssistantEvent::StepCreated)
            .unwrap_or(AssistantEvent::Ignored),
        "thread.run.step.delta" => parse(name, data)
            .map(AssistantEvent::StepDelta)
            .unwrap_or(AssistantEvent::Ignored),
        "thread.run.step.completed" => parse(name, data)
            .map(AssistantEvent::StepCompleted)
            .unwrap_or(AssistantEvent::Ignored),
        "thread.message.created" => AssistantEvent::MessageCreated,
        "thread.message.delta" => parse(name, data)
            .map(AssistantEvent::MessageDelta)
            .unwrap_or(AssistantEvent::Ignored),
        "thread.run.failed" => {
            let message = parse::<RunObject>(name, data)
                .and_then(|run| run.last_error)
                .and_then(|err| err.message)
                .unwrap_or_else(|| "run failed".to_string());
            AssistantEvent::RunFailed { message }
        }
        "error" => {
            let message = parse::<ErrorEventBody>(name, data)
                .and_then(|body| body.error.and_then(|e| e.message).or(body.message))
                .unwrap_or_else(|| "stream error".to_string());
            AssistantEvent::RunFailed { message }
        }
        "done" => AssistantEvent::Done,
        _ => AssistantEvent::Ignored,
    }
}

fn parse<T: serde::de::DeserializeOwned>(name: &str, data: &str) -> Option<T> {
    match serde_json::from_str(data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to decode '{name}' payload: {e}");
            None
        }
    }
}

/// Incremental SSE decoder. Chunks arrive at arbitrary byte boundaries;
/// complete lines are consumed, the trailing partial line stays buffered as
/// raw bytes. Text is decoded per completed line, so a multi-byte character
/// split across two chunks stays intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event_name: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk; returns every event completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<AssistantEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut last_newline_pos = 0;

        for idx in 0..self.buffer.len() {
            if self.buffer[idx] != b'\n' {
                continue;
            }
            let raw = String::from_utf8_lossy(&self.buffer[last_newline_pos..idx]);
            let line = raw.trim_end_matches('\r');
            last_newline_pos = idx + 1;

            if line.is_empty() {
                // Blank line terminates one SSE event.
                self.event_name = None;
            } else if let Some(name) = line.strip_prefix("event:") {
                self.event_name = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                let name = self.event_name.clone().unwrap_or_default();
                events.push(decode_event(&name, data));
            }
            // `id:`, `retry:` and `:` comment lines carry nothing we use.
        }

        self.buffer.drain(..last_newline_pos);
        events
    }
}

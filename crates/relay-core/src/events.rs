//! Canonical run events and the sink that fans them out.
//!
//! Every run produces exactly one `run-start` and one `run-complete`, with
//! `run-complete` last. The same ordered sequence reaches the streaming
//! transport (when attached) and the in-memory log that becomes
//! `events.jsonl` inside the sandbox. Wire field names are camelCase.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Stdout/stderr captured in `command-finished` events are clipped to this
/// many bytes each.
pub const COMMAND_OUTPUT_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "runId")]
    pub run_id: Uuid,
    #[serde(flatten)]
    pub payload: RunEventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RunEventPayload {
    #[serde(rename = "run-start")]
    RunStart,
    #[serde(rename = "token")]
    Token { delta: String, sequence: u64 },
    #[serde(rename = "diff")]
    Diff {
        #[serde(skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
        #[serde(rename = "diffSummary", skip_serializing_if = "Option::is_none")]
        diff_summary: Option<DiffSummary>,
    },
    #[serde(rename = "command-started")]
    CommandStarted { command: String, cwd: String },
    #[serde(rename = "command-finished")]
    CommandFinished {
        command: String,
        cwd: String,
        #[serde(rename = "exitCode")]
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
    #[serde(rename = "run-complete")]
    RunComplete {
        status: TerminalStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunEventPayload {
    /// SSE event name for this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            RunEventPayload::RunStart => "run-start",
            RunEventPayload::Token { .. } => "token",
            RunEventPayload::Diff { .. } => "diff",
            RunEventPayload::CommandStarted { .. } => "command-started",
            RunEventPayload::CommandFinished { .. } => "command-finished",
            RunEventPayload::RunComplete { .. } => "run-complete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    Failed,
    Timeout,
}

impl RunEvent {
    fn now(run_id: Uuid, payload: RunEventPayload) -> Self {
        Self {
            ts: Utc::now(),
            run_id,
            payload,
        }
    }

    pub fn run_start(run_id: Uuid) -> Self {
        Self::now(run_id, RunEventPayload::RunStart)
    }

    pub fn token(run_id: Uuid, delta: impl Into<String>, sequence: u64) -> Self {
        Self::now(
            run_id,
            RunEventPayload::Token {
                delta: delta.into(),
                sequence,
            },
        )
    }

    pub fn diff(run_id: Uuid, diff: impl Into<String>) -> Self {
        Self::now(
            run_id,
            RunEventPayload::Diff {
                diff: Some(diff.into()),
                diff_summary: None,
            },
        )
    }

    pub fn run_complete(run_id: Uuid, status: TerminalStatus, error: Option<String>) -> Self {
        Self::now(run_id, RunEventPayload::RunComplete { status, error })
    }
}

/// Splits text into alternating maximal runs of whitespace and
/// non-whitespace characters. Concatenating the pieces reproduces the input
/// exactly, which is what keeps synthesized token streams lossless.
pub fn split_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_is_ws = None;
    for ch in text.chars() {
        let is_ws = ch.is_whitespace();
        if current_is_ws.is_some() && current_is_ws != Some(is_ws) {
            tokens.push(std::mem::take(&mut current));
        }
        current.push(ch);
        current_is_ws = Some(is_ws);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Clips command output to [`COMMAND_OUTPUT_LIMIT`] bytes on a char
/// boundary.
pub fn clip_command_output(output: &str) -> String {
    if output.len() <= COMMAND_OUTPUT_LIMIT {
        return output.to_string();
    }
    let mut end = COMMAND_OUTPUT_LIMIT;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output[..end].to_string()
}

/// Fans canonical events out to an optional streaming transport and an
/// ordered in-memory log. The log survives transport disconnects so the
/// event file written into the sandbox is always complete.
pub struct EventSink {
    transport: Option<mpsc::Sender<RunEvent>>,
    transport_open: bool,
    log: Vec<RunEvent>,
}

impl EventSink {
    /// Sink for the unary path: events are only logged.
    pub fn buffered() -> Self {
        Self {
            transport: None,
            transport_open: false,
            log: Vec::new(),
        }
    }

    /// Sink for the streaming path.
    pub fn with_transport(transport: mpsc::Sender<RunEvent>) -> Self {
        Self {
            transport: Some(transport),
            transport_open: true,
            log: Vec::new(),
        }
    }

    pub async fn emit(&mut self, event: RunEvent) {
        self.log.push(event.clone());
        if self.transport_open {
            if let Some(transport) = &self.transport {
                if transport.send(event).await.is_err() {
                    // Client went away; keep logging for the evidence trail.
                    self.transport_open = false;
                }
            }
        }
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.log
    }

    /// True once a `run-complete` has been emitted.
    pub fn has_terminal_event(&self) -> bool {
        self.log
            .iter()
            .any(|event| matches!(event.payload, RunEventPayload::RunComplete { .. }))
    }

    /// Newline-delimited JSON in emission order; the `events.jsonl` payload.
    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for event in &self.log {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_covers_entire_text() {
        let text = "create  hello.txt\nwith content";
        let tokens = split_tokens(text);
        assert_eq!(tokens.concat(), text);
        // Alternating runs: no token mixes whitespace and non-whitespace.
        for token in &tokens {
            let ws: Vec<bool> = token.chars().map(|c| c.is_whitespace()).collect();
            assert!(ws.iter().all(|&w| w == ws[0]));
        }
    }

    #[test]
    fn split_handles_empty_and_whitespace_only() {
        assert!(split_tokens("").is_empty());
        assert_eq!(split_tokens("   "), vec!["   ".to_string()]);
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let long = "é".repeat(COMMAND_OUTPUT_LIMIT);
        let clipped = clip_command_output(&long);
        assert!(clipped.len() <= COMMAND_OUTPUT_LIMIT);
        assert!(long.starts_with(&clipped));
    }

    #[test]
    fn event_serialization_is_camel_case() {
        let run_id = Uuid::new_v4();
        let event = RunEvent::run_start(run_id);
        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(value["type"], "run-start");
        assert_eq!(value["runId"], run_id.to_string());
        assert!(value["ts"].is_string());

        let token = RunEvent::token(run_id, "hello", 3);
        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&token).unwrap()).unwrap();
        assert_eq!(value["delta"], "hello");
        assert_eq!(value["sequence"], 3);
    }

    #[tokio::test]
    async fn sink_keeps_logging_after_transport_closes() {
        let (tx, mut rx) = mpsc::channel(1);
        let run_id = Uuid::new_v4();
        let mut sink = EventSink::with_transport(tx);

        sink.emit(RunEvent::run_start(run_id)).await;
        assert!(rx.recv().await.is_some());
        drop(rx);

        sink.emit(RunEvent::token(run_id, "a", 0)).await;
        sink.emit(RunEvent::run_complete(run_id, TerminalStatus::Succeeded, None))
            .await;

        assert_eq!(sink.events().len(), 3);
        assert!(sink.has_terminal_event());
        let jsonl = sink.to_jsonl().unwrap();
        assert_eq!(jsonl.lines().count(), 3);
        let first: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "run-start");
    }
}

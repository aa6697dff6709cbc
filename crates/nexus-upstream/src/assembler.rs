//! Consumes the upstream SSE stream, tees it to the client, and reconstructs
//! a logical response (spec §4.6, component C6).

use bytes::Bytes;
use futures_util::StreamExt;
use nexus_core::model::{ChatResponse, ContentBlock, Usage};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

/// One raw SSE event, handed to C7 with a monotonic index (spec §4.7).
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_index: u64,
    pub raw_event_text: String,
    pub token_delta: Option<u64>,
}

/// Outcome of consuming a whole stream.
pub struct AssembledResponse {
    pub response: ChatResponse,
    /// Set when an `error` event was observed; the tee still carried it to
    /// the client verbatim.
    pub failed: Option<String>,
    /// Set when the client disconnected mid-stream.
    pub client_disconnected: bool,
}

#[derive(Default)]
struct BlockAccum {
    block_type: String,
    text: String,
    tool_id: String,
    tool_name: String,
    tool_input_json: String,
}

/// Reads `resp`'s SSE body, forwarding each chunk to `client_tx` as it
/// arrives (at most one buffering hop) and each raw event to `chunk_tx` for
/// durable storage, while reconstructing the logical `ChatResponse`.
///
/// Returns `None` if the client disconnected before the stream finished;
/// callers should still flush whatever chunks were already sent to `chunk_tx`.
pub async fn assemble(
    mut resp: reqwest::Response,
    client_tx: mpsc::Sender<Bytes>,
    chunk_tx: mpsc::Sender<ChunkRecord>,
) -> AssembledResponse {
    let mut blocks: Vec<BlockAccum> = Vec::new();
    let mut usage = Usage::default();
    let mut stop_reason: Option<String> = None;
    let mut failed: Option<String> = None;
    let mut client_disconnected = false;

    let mut current_event = String::new();
    let mut line_buf = String::new();
    let mut chunk_index: u64 = 0;

    loop {
        let next = resp.chunk().await;
        let chunk = match next {
            Ok(Some(c)) => c,
            Ok(None) => break,
            Err(e) => {
                failed = Some(e.to_string());
                break;
            }
        };

        if client_tx.send(chunk.clone()).await.is_err() {
            client_disconnected = true;
            break;
        }

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(event_type) = line.strip_prefix("event: ") {
                current_event = event_type.to_string();
                continue;
            }

            if let Some(data) = line.strip_prefix("data: ") {
                let raw_event_text = format!("event: {current_event}\ndata: {data}");
                let token_delta = apply_event(
                    &current_event,
                    data,
                    &mut blocks,
                    &mut usage,
                    &mut stop_reason,
                    &mut failed,
                );

                if chunk_tx
                    .send(ChunkRecord {
                        chunk_index,
                        raw_event_text,
                        token_delta,
                    })
                    .await
                    .is_err()
                {
                    // storage side dropped — keep streaming to the client regardless.
                }
                chunk_index += 1;
            }
        }

        line_buf = remainder;
    }

    let content: Vec<ContentBlock> = blocks
        .into_iter()
        .filter_map(|b| match b.block_type.as_str() {
            "text" => Some(ContentBlock::Text {
                text: b.text,
                cache_control: None,
            }),
            "tool_use" => {
                let input = serde_json::from_str(&b.tool_input_json)
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                Some(ContentBlock::ToolUse {
                    id: b.tool_id,
                    name: b.tool_name,
                    input,
                })
            }
            _ => None,
        })
        .collect();

    AssembledResponse {
        response: ChatResponse {
            content,
            stop_reason,
            usage,
            extra: Default::default(),
        },
        failed,
        client_disconnected,
    }
}

fn apply_event(
    event_type: &str,
    data: &str,
    blocks: &mut Vec<BlockAccum>,
    usage: &mut Usage,
    stop_reason: &mut Option<String>,
    failed: &mut Option<String>,
) -> Option<u64> {
    match event_type {
        "message_start" => {
            if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                usage.input_tokens = msg.message.usage.input_tokens;
                usage.cache_creation_input_tokens = msg.message.usage.cache_creation_input_tokens;
                usage.cache_read_input_tokens = msg.message.usage.cache_read_input_tokens;
                return Some(msg.message.usage.input_tokens);
            }
            None
        }

        "content_block_start" => {
            if let Ok(block_start) = serde_json::from_str::<ContentBlockStart>(data) {
                let idx = block_start.index;
                while blocks.len() <= idx {
                    blocks.push(BlockAccum::default());
                }
                blocks[idx].block_type = block_start.content_block.block_type.clone();
                if block_start.content_block.block_type == "tool_use" {
                    blocks[idx].tool_id = block_start.content_block.id.unwrap_or_default();
                    blocks[idx].tool_name = block_start.content_block.name.unwrap_or_default();
                }
            }
            None
        }

        "content_block_delta" => {
            if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                let idx = delta.index;
                while blocks.len() <= idx {
                    blocks.push(BlockAccum::default());
                }
                match delta.delta.delta_type.as_str() {
                    "text_delta" => {
                        if let Some(text) = delta.delta.text {
                            blocks[idx].text.push_str(&text);
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.delta.partial_json {
                            blocks[idx].tool_input_json.push_str(&partial);
                        }
                    }
                    _ => {}
                }
            }
            None
        }

        "content_block_stop" => None,

        "message_delta" => {
            if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                usage.output_tokens = delta.usage.output_tokens;
                if let Some(reason) = delta.delta.stop_reason {
                    *stop_reason = Some(reason);
                }
                return Some(delta.usage.output_tokens);
            }
            None
        }

        "error" => {
            warn!(data, "upstream stream error event");
            *failed = Some(data.to_string());
            None
        }

        _ => None,
    }
}

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    usage: StartUsage,
}

#[derive(Deserialize, Default)]
struct StartUsage {
    input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: EndUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct EndUsage {
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_accumulates_into_block() {
        let mut blocks = vec![BlockAccum {
            block_type: "text".to_string(),
            ..Default::default()
        }];
        let mut usage = Usage::default();
        let mut stop_reason = None;
        let mut failed = None;

        apply_event(
            "content_block_delta",
            r#"{"index":0,"delta":{"type":"text_delta","text":"hello"}}"#,
            &mut blocks,
            &mut usage,
            &mut stop_reason,
            &mut failed,
        );
        apply_event(
            "content_block_delta",
            r#"{"index":0,"delta":{"type":"text_delta","text":" world"}}"#,
            &mut blocks,
            &mut usage,
            &mut stop_reason,
            &mut failed,
        );

        assert_eq!(blocks[0].text, "hello world");
    }

    #[test]
    fn message_delta_sets_stop_reason_and_output_tokens() {
        let mut blocks = Vec::new();
        let mut usage = Usage::default();
        let mut stop_reason = None;
        let mut failed = None;

        apply_event(
            "message_delta",
            r#"{"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#,
            &mut blocks,
            &mut usage,
            &mut stop_reason,
            &mut failed,
        );

        assert_eq!(stop_reason, Some("end_turn".to_string()));
        assert_eq!(usage.output_tokens, 42);
    }

    #[test]
    fn error_event_marks_failed_without_aborting() {
        let mut blocks = Vec::new();
        let mut usage = Usage::default();
        let mut stop_reason = None;
        let mut failed = None;

        apply_event(
            "error",
            r#"{"type":"overloaded_error","message":"overloaded"}"#,
            &mut blocks,
            &mut usage,
            &mut stop_reason,
            &mut failed,
        );

        assert!(failed.is_some());
    }
}

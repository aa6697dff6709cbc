//! Deterministic, content-normalising hashing of messages and system prompts
//! (spec §4.1, component C1).

use nexus_core::model::{Content, ContentBlock, Message, SystemPrompt};
use sha2::{Digest, Sha256};

pub const SYSTEM_REMINDER_TAG: &str = "<system-reminder>";

/// Record separator joining normalised block tokens before hashing.
const RECORD_SEPARATOR: char = '\u{1e}';

/// Drops a leading `text` block whose content begins with `<system-reminder>`,
/// matching the hasher's exclusion rule so callers (e.g. sub-task detection)
/// see the same "real" first block the hash is computed over.
pub fn strip_system_reminder(blocks: &[ContentBlock]) -> Vec<ContentBlock> {
    match blocks.first() {
        Some(ContentBlock::Text { text, .. }) if text.trim_start().starts_with(SYSTEM_REMINDER_TAG) => {
            blocks[1..].to_vec()
        }
        _ => blocks.to_vec(),
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(&sort_keys(value)).unwrap_or_default()
}

/// Recursively reorders object keys lexicographically so the JSON text is
/// stable regardless of insertion order.
fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, serde_json::Value> =
                std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), sort_keys(v));
            }
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

fn normalise_block(block: &ContentBlock) -> String {
    match block {
        ContentBlock::Text { text, .. } => format!("text:{}", text.trim()),
        ContentBlock::Image { source } => format!("image:{}", canonical_json(source)),
        ContentBlock::ToolUse { id, name, input } => {
            let payload = serde_json::json!({ "id": id, "name": name, "input": input });
            format!("tool_use:{}", canonical_json(&payload))
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => format!(
            "tool_result:{}:{}",
            tool_use_id,
            canonical_json(&sort_keys(content))
        ),
        ContentBlock::Unknown => "unknown:".to_string(),
    }
}

fn normalise_blocks(blocks: &[ContentBlock]) -> String {
    let blocks = strip_system_reminder(blocks);
    blocks
        .iter()
        .map(normalise_block)
        .collect::<Vec<_>>()
        .join(&RECORD_SEPARATOR.to_string())
}

fn hash_str(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hashes a single message's content per the normalisation rules in spec §4.1.
pub fn hash_message(message: &Message) -> String {
    let normalised = match &message.content {
        Content::Text(s) => s.trim_end().to_string(),
        Content::Blocks(blocks) => normalise_blocks(blocks),
    };
    hash_str(&normalised)
}

/// Hashes the system prompt as a synthetic single message; `None` when absent.
pub fn hash_system(system: &Option<SystemPrompt>) -> Option<String> {
    let prompt = system.as_ref()?;
    let normalised = match prompt {
        SystemPrompt::Text(s) => s.trim_end().to_string(),
        SystemPrompt::Blocks(blocks) => normalise_blocks(blocks),
    };
    Some(hash_str(&normalised))
}

/// The three hashes C9/C3 need per inbound request: current, parent (if any
/// prior message exists), and system.
pub struct RequestHashes {
    pub current_message_hash: String,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
}

pub fn hash_request(messages: &[Message], system: &Option<SystemPrompt>) -> RequestHashes {
    let current_message_hash = messages
        .last()
        .map(hash_message)
        .unwrap_or_else(|| hash_str(""));
    let parent_message_hash = if messages.len() > 1 {
        Some(hash_message(&messages[messages.len() - 2]))
    } else {
        None
    };
    RequestHashes {
        current_message_hash,
        parent_message_hash,
        system_hash: hash_system(system),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::model::Role;

    fn text_message(role: Role, s: &str) -> Message {
        Message {
            role,
            content: Content::Text(s.to_string()),
        }
    }

    #[test]
    fn idempotent_under_trailing_whitespace() {
        let a = text_message(Role::User, "hi");
        let b = text_message(Role::User, "hi   \n");
        assert_eq!(hash_message(&a), hash_message(&b));
    }

    #[test]
    fn invariant_under_json_key_reordering_in_tool_use() {
        let a = Message {
            role: Role::Assistant,
            content: Content::Blocks(vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "Task".into(),
                input: serde_json::json!({"prompt": "do X", "description": "desc"}),
            }]),
        };
        let b = Message {
            role: Role::Assistant,
            content: Content::Blocks(vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "Task".into(),
                input: serde_json::json!({"description": "desc", "prompt": "do X"}),
            }]),
        };
        assert_eq!(hash_message(&a), hash_message(&b));
    }

    #[test]
    fn invariant_under_leading_system_reminder() {
        let plain = Message {
            role: Role::User,
            content: Content::Blocks(vec![ContentBlock::Text {
                text: "hello".into(),
                cache_control: None,
            }]),
        };
        let reminded = Message {
            role: Role::User,
            content: Content::Blocks(vec![
                ContentBlock::Text {
                    text: "<system-reminder>some context</system-reminder>".into(),
                    cache_control: None,
                },
                ContentBlock::Text {
                    text: "hello".into(),
                    cache_control: None,
                },
            ]),
        };
        assert_eq!(hash_message(&plain), hash_message(&reminded));
    }

    #[test]
    fn parent_hash_is_none_for_single_message_request() {
        let messages = vec![text_message(Role::User, "hi")];
        let hashes = hash_request(&messages, &None);
        assert!(hashes.parent_message_hash.is_none());
    }

    #[test]
    fn parent_hash_is_second_to_last_message() {
        let messages = vec![
            text_message(Role::User, "hi"),
            text_message(Role::Assistant, "Hello!"),
            text_message(Role::User, "ho"),
        ];
        let hashes = hash_request(&messages, &None);
        assert_eq!(
            hashes.parent_message_hash,
            Some(hash_message(&messages[1]))
        );
        assert_eq!(hashes.current_message_hash, hash_message(&messages[2]));
    }

    #[test]
    fn system_hash_absent_when_no_system_prompt() {
        assert!(hash_system(&None).is_none());
    }
}

//! Deterministic hash-chain conversation linking (spec §4.3, component C3).

use crate::storage::LinkerStorage;
use crate::task_cache::{TaskInvocation, TaskInvocationCache};
use chrono::Utc;
use nexus_core::model::{Content, ContentBlock, Message, SystemPrompt};
use nexus_core::types::{BranchId, ConversationId, Domain, RequestId};
use nexus_hash::{hash_request, strip_system_reminder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::warn;

const SUMMARY_MARKER: &str =
    "This session is a continuation of a previous conversation that was summarized";

#[derive(Debug, Clone)]
pub struct LinkResult {
    pub conversation_id: ConversationId,
    pub branch_id: BranchId,
    pub parent_request_id: Option<RequestId>,
    pub current_message_hash: String,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub is_subtask: bool,
    pub parent_task_request_id: Option<RequestId>,
    /// Set when storage was unreachable and orphan placeholders were
    /// allocated instead (spec §4.3 failure semantics).
    pub degraded: bool,
}

pub struct ConversationLinker<S: LinkerStorage> {
    storage: S,
    task_cache: Arc<TaskInvocationCache>,
    task_cache_window: chrono::Duration,
    branch_locks: StdMutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl<S: LinkerStorage> ConversationLinker<S> {
    pub fn new(storage: S, task_cache: Arc<TaskInvocationCache>, task_cache_window_ms: i64) -> Self {
        Self {
            storage,
            task_cache,
            task_cache_window: chrono::Duration::milliseconds(task_cache_window_ms),
            branch_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn branch_lock(&self, domain: &Domain, parent_hash: &str) -> Arc<Mutex<()>> {
        let key = (domain.as_str().to_string(), parent_hash.to_string());
        let mut guard = self.branch_locks.lock().unwrap();
        guard.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn link(
        &self,
        domain: &Domain,
        messages: &[Message],
        system: &Option<SystemPrompt>,
    ) -> LinkResult {
        let hashes = hash_request(messages, system);

        let result = match &hashes.parent_message_hash {
            None => self.link_single_message(domain, messages, &hashes).await,
            Some(parent_hash) => {
                if is_compact_continuation(messages) {
                    self.link_compact_continuation(domain, messages, &hashes).await
                } else {
                    self.link_multi_message(domain, parent_hash, &hashes).await
                }
            }
        };

        match result {
            Ok(r) => r,
            Err(e) => {
                warn!(domain = %domain, error = %e, "conversation linking degraded to orphan");
                LinkResult {
                    conversation_id: ConversationId::new(),
                    branch_id: BranchId::main(),
                    parent_request_id: None,
                    current_message_hash: hashes.current_message_hash,
                    parent_message_hash: hashes.parent_message_hash,
                    system_hash: hashes.system_hash,
                    is_subtask: false,
                    parent_task_request_id: None,
                    degraded: true,
                }
            }
        }
    }

    async fn link_single_message(
        &self,
        domain: &Domain,
        messages: &[Message],
        hashes: &nexus_hash::RequestHashes,
    ) -> nexus_core::error::Result<LinkResult> {
        if let Some(task) = self.detect_subtask(domain, messages) {
            return Ok(LinkResult {
                conversation_id: ConversationId::new(),
                branch_id: BranchId::main(),
                parent_request_id: None,
                current_message_hash: hashes.current_message_hash.clone(),
                parent_message_hash: None,
                system_hash: hashes.system_hash.clone(),
                is_subtask: true,
                parent_task_request_id: Some(task.parent_request_id),
                degraded: false,
            });
        }

        Ok(LinkResult {
            conversation_id: ConversationId::new(),
            branch_id: BranchId::main(),
            parent_request_id: None,
            current_message_hash: hashes.current_message_hash.clone(),
            parent_message_hash: None,
            system_hash: hashes.system_hash.clone(),
            is_subtask: false,
            parent_task_request_id: None,
            degraded: false,
        })
    }

    /// Spec §4.3 step 5: exactly one match in the task cache within the
    /// window wins; zero or multiple matches fall through to a standalone
    /// conversation.
    fn detect_subtask(&self, domain: &Domain, messages: &[Message]) -> Option<TaskInvocation> {
        let message = messages.first()?;
        let blocks = match &message.content {
            Content::Text(s) => vec![ContentBlock::Text {
                text: s.clone(),
                cache_control: None,
            }],
            Content::Blocks(b) => b.clone(),
        };
        let stripped = strip_system_reminder(&blocks);
        let prompt = match stripped.first()? {
            ContentBlock::Text { text, .. } => text.trim().to_string(),
            _ => return None,
        };

        let matches = self
            .task_cache
            .recent_by_prompt(domain, &prompt, self.task_cache_window);
        if matches.len() == 1 {
            matches.into_iter().next()
        } else {
            None
        }
    }

    async fn link_multi_message(
        &self,
        domain: &Domain,
        parent_hash: &str,
        hashes: &nexus_hash::RequestHashes,
    ) -> nexus_core::error::Result<LinkResult> {
        let lock = self.branch_lock(domain, parent_hash);
        let _permit = lock.lock().await;

        let parent = self
            .storage
            .find_by_parent_hash(domain, parent_hash, hashes.system_hash.as_deref(), Utc::now())
            .await?;

        let Some(parent) = parent else {
            // No match: orphan, starts a fresh conversation.
            return Ok(LinkResult {
                conversation_id: ConversationId::new(),
                branch_id: BranchId::main(),
                parent_request_id: None,
                current_message_hash: hashes.current_message_hash.clone(),
                parent_message_hash: Some(parent_hash.to_string()),
                system_hash: hashes.system_hash.clone(),
                is_subtask: false,
                parent_task_request_id: None,
                degraded: false,
            });
        };

        let matching_child_exists = self
            .storage
            .child_with_hash_exists(&parent.request_id, &hashes.current_message_hash)
            .await?;
        if matching_child_exists {
            return Ok(LinkResult {
                conversation_id: parent.conversation_id,
                branch_id: parent.branch_id,
                parent_request_id: Some(parent.request_id),
                current_message_hash: hashes.current_message_hash.clone(),
                parent_message_hash: Some(parent_hash.to_string()),
                system_hash: hashes.system_hash.clone(),
                is_subtask: false,
                parent_task_request_id: None,
                degraded: false,
            });
        }

        let any_child = self.storage.any_child_exists(&parent.request_id).await?;
        let branch_id = if any_child {
            let n = self.storage.next_branch_suffix(&parent.conversation_id).await?;
            BranchId::fork(n)
        } else {
            parent.branch_id.clone()
        };

        Ok(LinkResult {
            conversation_id: parent.conversation_id,
            branch_id,
            parent_request_id: Some(parent.request_id),
            current_message_hash: hashes.current_message_hash.clone(),
            parent_message_hash: Some(parent_hash.to_string()),
            system_hash: hashes.system_hash.clone(),
            is_subtask: false,
            parent_task_request_id: None,
            degraded: false,
        })
    }

    async fn link_compact_continuation(
        &self,
        domain: &Domain,
        messages: &[Message],
        hashes: &nexus_hash::RequestHashes,
    ) -> nexus_core::error::Result<LinkResult> {
        let summary_text = extract_summary_text(messages).unwrap_or_default();

        let found = self
            .storage
            .find_summary_continuation(domain, &summary_text)
            .await?;

        let Some(found) = found else {
            return Ok(LinkResult {
                conversation_id: ConversationId::new(),
                branch_id: BranchId::main(),
                parent_request_id: None,
                current_message_hash: hashes.current_message_hash.clone(),
                parent_message_hash: hashes.parent_message_hash.clone(),
                system_hash: hashes.system_hash.clone(),
                is_subtask: false,
                parent_task_request_id: None,
                degraded: false,
            });
        };

        let n = self.storage.next_compact_suffix(&found.conversation_id).await?;
        Ok(LinkResult {
            conversation_id: found.conversation_id,
            branch_id: BranchId::compact(n),
            parent_request_id: Some(found.request_id),
            current_message_hash: hashes.current_message_hash.clone(),
            parent_message_hash: hashes.parent_message_hash.clone(),
            system_hash: hashes.system_hash.clone(),
            is_subtask: false,
            parent_task_request_id: None,
            degraded: false,
        })
    }
}

fn is_compact_continuation(messages: &[Message]) -> bool {
    extract_summary_text(messages).is_some()
}

/// Returns the summary text embedded *after* the marker, not the marker
/// itself — that's the substring a prior response body is expected to
/// contain (spec §4.3 step 4).
fn extract_summary_text(messages: &[Message]) -> Option<String> {
    let first = messages.first()?;
    if !matches!(first.role, nexus_core::model::Role::User) {
        return None;
    }
    let text = match &first.content {
        Content::Text(s) => s.clone(),
        Content::Blocks(blocks) => match blocks.first()? {
            ContentBlock::Text { text, .. } => text.clone(),
            _ => return None,
        },
    };
    let trimmed = text.trim_start();
    let after_marker = trimmed.strip_prefix(SUMMARY_MARKER)?;
    let summary = after_marker.trim_start_matches(['…', '.', ':', '\n', '\r', ' ', '\t']).trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use nexus_core::error::Result;
    use nexus_core::model::Role;
    use std::sync::Mutex as StdSyncMutex;

    #[derive(Default)]
    struct MockStorage {
        parent: StdSyncMutex<Option<crate::storage::ParentCandidate>>,
        matching_child: StdSyncMutex<bool>,
        any_child: StdSyncMutex<bool>,
        branch_suffix: StdSyncMutex<u32>,
    }

    #[async_trait]
    impl LinkerStorage for MockStorage {
        async fn find_by_parent_hash(
            &self,
            _domain: &Domain,
            _parent_hash: &str,
            _system_hash: Option<&str>,
            _before: DateTime<Utc>,
        ) -> Result<Option<crate::storage::ParentCandidate>> {
            Ok(self.parent.lock().unwrap().clone())
        }

        async fn child_with_hash_exists(&self, _parent: &RequestId, _hash: &str) -> Result<bool> {
            Ok(*self.matching_child.lock().unwrap())
        }

        async fn any_child_exists(&self, _parent: &RequestId) -> Result<bool> {
            Ok(*self.any_child.lock().unwrap())
        }

        async fn next_branch_suffix(&self, _conversation_id: &ConversationId) -> Result<u32> {
            Ok(*self.branch_suffix.lock().unwrap())
        }

        async fn next_compact_suffix(&self, _conversation_id: &ConversationId) -> Result<u32> {
            Ok(1)
        }

        async fn find_summary_continuation(
            &self,
            _domain: &Domain,
            _summary_text: &str,
        ) -> Result<Option<crate::storage::ParentCandidate>> {
            Ok(self.parent.lock().unwrap().clone())
        }
    }

    fn text_message(role: Role, s: &str) -> Message {
        Message {
            role,
            content: Content::Text(s.to_string()),
        }
    }

    fn linker(storage: MockStorage) -> ConversationLinker<MockStorage> {
        ConversationLinker::new(storage, Arc::new(TaskInvocationCache::new(300_000)), 30_000)
    }

    #[tokio::test]
    async fn first_message_conversation_starts_fresh() {
        let linker = linker(MockStorage::default());
        let domain = Domain::from("acme.example.com");
        let result = linker.link(&domain, &[text_message(Role::User, "hi")], &None).await;

        assert!(result.parent_request_id.is_none());
        assert!(result.branch_id.is_main());
        assert!(!result.is_subtask);
    }

    #[tokio::test]
    async fn linear_continuation_inherits_parent_conversation() {
        let storage = MockStorage::default();
        let parent_id = RequestId::new();
        let conversation_id = ConversationId::new();
        *storage.parent.lock().unwrap() = Some(crate::storage::ParentCandidate {
            request_id: parent_id.clone(),
            conversation_id: conversation_id.clone(),
            branch_id: BranchId::main(),
        });

        let linker = linker(storage);
        let domain = Domain::from("acme.example.com");
        let messages = vec![
            text_message(Role::User, "hi"),
            text_message(Role::Assistant, "Hello!"),
            text_message(Role::User, "ho"),
        ];
        let result = linker.link(&domain, &messages, &None).await;

        assert_eq!(result.conversation_id, conversation_id);
        assert!(result.branch_id.is_main());
        assert_eq!(result.parent_request_id, Some(parent_id));
    }

    #[tokio::test]
    async fn branch_fork_when_another_child_already_exists() {
        let storage = MockStorage::default();
        let parent_id = RequestId::new();
        let conversation_id = ConversationId::new();
        *storage.parent.lock().unwrap() = Some(crate::storage::ParentCandidate {
            request_id: parent_id.clone(),
            conversation_id: conversation_id.clone(),
            branch_id: BranchId::main(),
        });
        *storage.any_child.lock().unwrap() = true;
        *storage.branch_suffix.lock().unwrap() = 1;

        let linker = linker(storage);
        let domain = Domain::from("acme.example.com");
        let messages = vec![
            text_message(Role::User, "hi"),
            text_message(Role::Assistant, "Hello!"),
            text_message(Role::User, "different continuation"),
        ];
        let result = linker.link(&domain, &messages, &None).await;

        assert_eq!(result.conversation_id, conversation_id);
        assert_eq!(result.branch_id, BranchId::fork(1));
        assert_eq!(result.parent_request_id, Some(parent_id));
    }

    #[tokio::test]
    async fn subtask_spawn_links_laterally_with_fresh_conversation() {
        let task_cache = Arc::new(TaskInvocationCache::new(300_000));
        let domain = Domain::from("acme.example.com");
        let parent_request_id = RequestId::new();
        task_cache.add(
            &domain,
            TaskInvocation {
                parent_request_id: parent_request_id.clone(),
                tool_use_id: "tu_1".to_string(),
                prompt: "Count lines of code in repo X".to_string(),
                timestamp: Utc::now(),
            },
        );

        let linker = ConversationLinker::new(MockStorage::default(), task_cache, 30_000);
        let messages = vec![text_message(Role::User, "Count lines of code in repo X")];
        let result = linker.link(&domain, &messages, &None).await;

        assert!(result.is_subtask);
        assert_eq!(result.parent_task_request_id, Some(parent_request_id));
        assert!(result.parent_request_id.is_none());
    }
}

//! Short-lived in-memory index of recent "spawn sub-task" tool calls
//! (spec §4.4, component C4).

use chrono::{DateTime, Utc};
use nexus_core::types::{Domain, RequestId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub parent_request_id: RequestId,
    pub tool_use_id: String,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
}

/// `domain -> ordered list of TaskInvocation`. Defined here (rather than in
/// `nexus-storage`) so `ConversationLinker` can consult it without a
/// dependency on the storage crate.
pub struct TaskInvocationCache {
    by_domain: Mutex<HashMap<String, Vec<TaskInvocation>>>,
    max_age: chrono::Duration,
}

impl TaskInvocationCache {
    pub fn new(max_age_ms: i64) -> Self {
        Self {
            by_domain: Mutex::new(HashMap::new()),
            max_age: chrono::Duration::milliseconds(max_age_ms),
        }
    }

    pub fn add(&self, domain: &Domain, invocation: TaskInvocation) {
        let mut guard = self.by_domain.lock().unwrap();
        guard
            .entry(domain.as_str().to_string())
            .or_default()
            .push(invocation);
    }

    /// Linear scan filtered by `now - timestamp < window` and exact prompt
    /// equality, matching spec §4.3 step 5's "exactly one match" rule.
    pub fn recent_by_prompt(
        &self,
        domain: &Domain,
        prompt: &str,
        window: chrono::Duration,
    ) -> Vec<TaskInvocation> {
        let guard = self.by_domain.lock().unwrap();
        let now = Utc::now();
        guard
            .get(domain.as_str())
            .map(|list| {
                list.iter()
                    .filter(|inv| now - inv.timestamp < window && inv.prompt == prompt)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Evicts entries older than `max_age`. Bounds memory to
    /// O(max_age * arrival_rate).
    pub fn sweep(&self) {
        let mut guard = self.by_domain.lock().unwrap();
        let now = Utc::now();
        let max_age = self.max_age;
        let mut evicted = 0usize;
        for list in guard.values_mut() {
            let before = list.len();
            list.retain(|inv| now - inv.timestamp < max_age);
            evicted += before - list.len();
        }
        guard.retain(|_, list| !list.is_empty());
        if evicted > 0 {
            info!(evicted, "swept task invocation cache");
        }
    }

    /// Runs the once-a-minute sweep timer until `shutdown` fires, mirroring
    /// the scheduler engine's select-loop shape.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(prompt: &str, age: chrono::Duration) -> TaskInvocation {
        TaskInvocation {
            parent_request_id: RequestId::new(),
            tool_use_id: "tu_1".to_string(),
            prompt: prompt.to_string(),
            timestamp: Utc::now() - age,
        }
    }

    #[test]
    fn recent_by_prompt_matches_within_window() {
        let cache = TaskInvocationCache::new(300_000);
        let domain = Domain::from("acme.example.com");
        cache.add(&domain, invocation("count lines", chrono::Duration::seconds(5)));

        let matches = cache.recent_by_prompt(&domain, "count lines", chrono::Duration::seconds(30));
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn recent_by_prompt_excludes_stale_entries() {
        let cache = TaskInvocationCache::new(300_000);
        let domain = Domain::from("acme.example.com");
        cache.add(&domain, invocation("count lines", chrono::Duration::hours(2)));

        let matches = cache.recent_by_prompt(&domain, "count lines", chrono::Duration::seconds(30));
        assert!(matches.is_empty());
    }

    #[test]
    fn sweep_evicts_entries_older_than_max_age() {
        let cache = TaskInvocationCache::new(1_000);
        let domain = Domain::from("acme.example.com");
        cache.add(&domain, invocation("old", chrono::Duration::seconds(5)));
        cache.sweep();

        let matches = cache.recent_by_prompt(&domain, "old", chrono::Duration::seconds(30));
        assert!(matches.is_empty());
    }
}

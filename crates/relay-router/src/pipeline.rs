//! In-pipeline registry
//!
//! The global dedup map and callback registry. Deduplication is cross-queue
//! and cross-pool: a pointer id can be in flight at most once across the
//! whole instance. Entries live from admission until ack/nack fires.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use relay_common::{MessageCallback, MessagePointer};

use crate::router_metrics;

/// Shared in-flight state: `id -> pointer` plus `id -> callback`.
///
/// The pointer map is authoritative; callbacks are looked up on completion
/// and a missing callback is a no-op so completions are idempotent across
/// races and restarts.
#[derive(Default)]
pub struct PipelineRegistry {
    in_pipeline: DashMap<String, MessagePointer>,
    callbacks: DashMap<String, Arc<dyn MessageCallback>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            in_pipeline: DashMap::new(),
            callbacks: DashMap::new(),
        }
    }

    /// Atomic put-if-absent admission. Returns false when the id is already
    /// in flight; the new arrival is left unacked so the broker redelivers
    /// it after the current owner completes.
    pub fn admit(&self, pointer: &MessagePointer, callback: Arc<dyn MessageCallback>) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.in_pipeline.entry(pointer.id.clone()) {
            Entry::Occupied(_) => {
                debug!(message_id = %pointer.id, "Duplicate pointer refused");
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(pointer.clone());
                self.callbacks.insert(pointer.id.clone(), callback);
                router_metrics::set_in_pipeline_count(self.in_pipeline.len());
                true
            }
        }
    }

    /// Roll back an admission without invoking the callback (pool refused
    /// the submit). The broker's visibility mechanism redelivers.
    pub fn forget(&self, message_id: &str) {
        self.in_pipeline.remove(message_id);
        self.callbacks.remove(message_id);
        router_metrics::set_in_pipeline_count(self.in_pipeline.len());
    }

    /// Peek at the callback registered for an in-flight pointer.
    pub fn callback(&self, message_id: &str) -> Option<Arc<dyn MessageCallback>> {
        self.callbacks.get(message_id).map(|entry| entry.clone())
    }

    /// Complete a pointer positively: remove it, then invoke `ack`.
    pub async fn ack(&self, pointer: &MessagePointer) {
        if let Some(callback) = self.take(&pointer.id) {
            callback.ack(pointer).await;
        }
    }

    /// Complete a pointer negatively: remove it, then invoke `nack`.
    pub async fn nack(&self, pointer: &MessagePointer) {
        if let Some(callback) = self.take(&pointer.id) {
            callback.nack(pointer).await;
        }
    }

    /// Remove the entry and hand back the callback. Removal happens before
    /// the broker round-trip so the pointer never appears stuck even if the
    /// broker call hangs.
    fn take(&self, message_id: &str) -> Option<Arc<dyn MessageCallback>> {
        self.in_pipeline.remove(message_id);
        let callback = self.callbacks.remove(message_id).map(|(_, cb)| cb);
        router_metrics::set_in_pipeline_count(self.in_pipeline.len());
        callback
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.in_pipeline.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.in_pipeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_pipeline.is_empty()
    }

    /// Drop all in-flight state. Used on shutdown after the drain window;
    /// unfinished messages redeliver from the broker.
    pub fn clear(&self) {
        self.in_pipeline.clear();
        self.callbacks.clear();
        router_metrics::set_in_pipeline_count(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_common::MediationType;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingCallback {
        acks: AtomicU32,
        nacks: AtomicU32,
    }

    impl CountingCallback {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                acks: AtomicU32::new(0),
                nacks: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageCallback for CountingCallback {
        async fn ack(&self, _pointer: &MessagePointer) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }

        async fn nack(&self, _pointer: &MessagePointer) {
            self.nacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pointer(id: &str) -> MessagePointer {
        MessagePointer {
            id: id.to_string(),
            pool_code: "P".to_string(),
            auth_token: None,
            mediation_type: MediationType::HTTP,
            mediation_target: "http://localhost".to_string(),
            message_group_id: None,
            batch_id: None,
        }
    }

    #[tokio::test]
    async fn admit_is_put_if_absent() {
        let registry = PipelineRegistry::new();
        let cb = CountingCallback::new();

        assert!(registry.admit(&pointer("m1"), cb.clone()));
        assert!(!registry.admit(&pointer("m1"), cb.clone()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn ack_removes_and_invokes_once() {
        let registry = PipelineRegistry::new();
        let cb = CountingCallback::new();

        registry.admit(&pointer("m1"), cb.clone());
        registry.ack(&pointer("m1")).await;

        assert!(registry.is_empty());
        assert_eq!(cb.acks.load(Ordering::SeqCst), 1);

        // Idempotent: second completion is a no-op
        registry.ack(&pointer("m1")).await;
        registry.nack(&pointer("m1")).await;
        assert_eq!(cb.acks.load(Ordering::SeqCst), 1);
        assert_eq!(cb.nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn forget_never_invokes_callback() {
        let registry = PipelineRegistry::new();
        let cb = CountingCallback::new();

        registry.admit(&pointer("m1"), cb.clone());
        registry.forget("m1");

        assert!(registry.is_empty());
        assert_eq!(cb.acks.load(Ordering::SeqCst), 0);
        assert_eq!(cb.nacks.load(Ordering::SeqCst), 0);

        // The id can be admitted again (broker redelivery)
        assert!(registry.admit(&pointer("m1"), cb));
    }
}

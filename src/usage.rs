use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// How a prompt resolution was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionOutcome {
    /// A self-contained type template was used verbatim.
    SelfContained,
    /// Base template composed with a type fragment.
    Composed,
    /// Base template alone.
    BaseOnly,
    /// The built-in fallback prompt; no usable template existed.
    Fallback,
}

/// One prompt-resolution attempt, emitted for analytics.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    /// Template name, or `builtin_fallback` when no template was used.
    pub template: String,
    pub email_type: String,
    pub outcome: ResolutionOutcome,
    pub latency_ms: u64,
    pub token_estimate: Option<u64>,
    pub at: DateTime<Utc>,
}

/// Aggregated usage for one template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TemplateUsage {
    pub resolutions: u64,
    pub total_latency_ms: u64,
    pub total_token_estimate: u64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Collects per-resolution usage events without ever blocking the hot
/// path: events go over an unbounded channel to an aggregation worker, and
/// a failed send is logged and dropped. The global counters are atomics so
/// concurrent resolvers never lose increments.
pub struct UsageTracker {
    resolutions: AtomicU64,
    fallbacks: AtomicU64,
    sender: mpsc::UnboundedSender<UsageEvent>,
    aggregates: Arc<Mutex<HashMap<String, TemplateUsage>>>,
    _worker: tokio::task::JoinHandle<()>,
}

impl UsageTracker {
    /// Spawns the aggregation worker; requires a running tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<UsageEvent>();
        let aggregates: Arc<Mutex<HashMap<String, TemplateUsage>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let worker_aggregates = aggregates.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                // A poisoned lock must not kill the drain loop while the
                // sender half keeps queueing events; take the data as-is.
                let mut map = worker_aggregates.lock().unwrap_or_else(|e| {
                    log::warn!("usage aggregate lock poisoned, recovering");
                    e.into_inner()
                });
                let entry = map.entry(event.template.clone()).or_default();
                entry.resolutions += 1;
                entry.total_latency_ms += event.latency_ms;
                entry.total_token_estimate += event.token_estimate.unwrap_or(0);
                entry.last_used = Some(event.at);
            }
        });

        UsageTracker {
            resolutions: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            sender,
            aggregates,
            _worker: worker,
        }
    }

    pub fn record(&self, event: UsageEvent) {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        if event.outcome == ResolutionOutcome::Fallback {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        log::debug!(
            "prompt resolved via {:?} (template '{}', {} ms)",
            event.outcome,
            event.template,
            event.latency_ms
        );
        if let Err(e) = self.sender.send(event) {
            log::warn!("failed to record usage event: {e}");
        }
    }

    pub fn total_resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    pub fn total_fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of the per-template aggregates. The worker
    /// consumes events asynchronously, so a snapshot taken immediately
    /// after `record` may not include that event yet.
    pub fn snapshot(&self) -> HashMap<String, TemplateUsage> {
        self.aggregates
            .lock()
            .unwrap_or_else(|e| {
                log::warn!("usage aggregate lock poisoned, recovering");
                e.into_inner()
            })
            .clone()
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

use crate::config::{
    ClassificationRule, PromptCategory, PromptTemplate, RuleKind, SegmentTypeConfig, SenderRule,
    SubjectPattern, BASE_TEMPLATE_TYPE,
};
use crate::prompt::BaseSections;
use crate::store::RuleStore;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Default snapshot lifetime. Administrative edits become visible within
/// one TTL window even without an explicit invalidation.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// An immutable, point-in-time view of every rule collection, shared
/// behind an `Arc`. Classification rules are pre-sorted by descending
/// priority (stable, so ties keep store order) and content-pattern regexes
/// are pre-compiled; per-type timezone rules are pre-sorted by descending
/// priority.
pub struct ConfigSnapshot {
    pub classification_rules: Vec<ClassificationRule>,
    pub sender_rules: Vec<SenderRule>,
    pub subject_patterns: Vec<SubjectPattern>,
    pub segment_types: HashMap<String, SegmentTypeConfig>,
    pub prompt_templates: Vec<PromptTemplate>,
    /// Compiled content-pattern regexes keyed by rule name. A rule absent
    /// from this map had an invalid pattern and degrades to substring
    /// matching.
    pub compiled_patterns: HashMap<String, Regex>,
    /// The active base parsing template split at its schema marker, if one
    /// exists.
    pub base_sections: Option<BaseSections>,
    loaded_at: Instant,
}

impl ConfigSnapshot {
    pub fn build(
        mut classification_rules: Vec<ClassificationRule>,
        sender_rules: Vec<SenderRule>,
        subject_patterns: Vec<SubjectPattern>,
        segment_types: Vec<SegmentTypeConfig>,
        prompt_templates: Vec<PromptTemplate>,
    ) -> Self {
        classification_rules.retain(|r| r.is_active);
        // Stable sort: equal priorities keep their store order.
        classification_rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut compiled_patterns = HashMap::new();
        for rule in &classification_rules {
            if let RuleKind::ContentPattern { pattern } = &rule.kind {
                match RegexBuilder::new(pattern)
                    .case_insensitive(rule.case_insensitive)
                    .build()
                {
                    Ok(regex) => {
                        compiled_patterns.insert(rule.name.clone(), regex);
                    }
                    Err(e) => {
                        log::warn!(
                            "invalid content pattern in rule '{}', falling back to substring match: {e}",
                            rule.name
                        );
                    }
                }
            }
        }

        let mut segment_map = HashMap::new();
        for mut config in segment_types {
            config
                .timezone_rules
                .sort_by(|a, b| b.priority.cmp(&a.priority));
            segment_map.insert(config.name.clone(), config);
        }

        let prompt_templates: Vec<PromptTemplate> =
            prompt_templates.into_iter().filter(|t| t.is_active).collect();

        let base_sections = prompt_templates
            .iter()
            .filter(|t| {
                t.category == PromptCategory::Parsing && t.segment_type == BASE_TEMPLATE_TYPE
            })
            .max_by_key(|t| t.version)
            .map(|t| BaseSections::parse(&t.prompt));

        ConfigSnapshot {
            classification_rules,
            sender_rules,
            subject_patterns,
            segment_types: segment_map,
            prompt_templates,
            compiled_patterns,
            base_sections,
            loaded_at: Instant::now(),
        }
    }

    /// Snapshot with no rules at all. Classification against it yields the
    /// default label and prompt resolution yields the built-in fallback.
    pub fn empty() -> Self {
        ConfigSnapshot::build(Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new())
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() < ttl
    }

    pub fn segment_type(&self, name: &str) -> Option<&SegmentTypeConfig> {
        self.segment_types.get(name)
    }

    /// The active template for `(category, segment_type)`, preferring the
    /// highest version if the single-active invariant has been violated.
    pub fn active_template(
        &self,
        category: PromptCategory,
        segment_type: &str,
    ) -> Option<&PromptTemplate> {
        let mut hit: Option<&PromptTemplate> = None;
        let mut count = 0usize;
        for template in self
            .prompt_templates
            .iter()
            .filter(|t| t.category == category && t.segment_type == segment_type)
        {
            count += 1;
            if hit.map_or(true, |h| template.version > h.version) {
                hit = Some(template);
            }
        }
        if count > 1 {
            log::warn!(
                "{count} active prompt templates for ({category:?}, {segment_type}), using version {}",
                hit.map(|h| h.version).unwrap_or(0)
            );
        }
        hit
    }
}

/// TTL-bounded cache of one `ConfigSnapshot` over a `RuleStore`.
///
/// Readers always get a complete snapshot (swap is atomic), a reload in
/// flight is never observed partially, and concurrent expiries collapse
/// into a single store read: callers queue on the reload lock and re-check
/// freshness once they hold it. On reload failure the last good snapshot
/// keeps serving.
pub struct ConfigCache {
    store: Arc<dyn RuleStore>,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<ConfigSnapshot>>>,
    reload: Mutex<()>,
    /// Invalidation generation counter. A snapshot only counts as clean if
    /// it was installed for the current generation, so an `invalidate()`
    /// arriving while a reload's store fetch is in flight still forces the
    /// next read to reload.
    invalidations: AtomicU64,
    /// Generation the installed snapshot satisfies.
    applied: AtomicU64,
}

impl ConfigCache {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self::with_ttl(store, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn RuleStore>, ttl: Duration) -> Self {
        ConfigCache {
            store,
            ttl,
            snapshot: RwLock::new(None),
            reload: Mutex::new(()),
            invalidations: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    /// Mark the cached snapshot stale. The next read reloads before
    /// serving, bounding staleness after an administrative write.
    pub fn invalidate(&self) {
        log::debug!("config cache invalidated");
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn pending_invalidation(&self) -> bool {
        self.invalidations.load(Ordering::SeqCst) != self.applied.load(Ordering::SeqCst)
    }

    /// The current snapshot, reloading first if the cached one is missing,
    /// expired, or invalidated. Never fails: a reload error falls back to
    /// the last good snapshot, or an empty one if nothing was ever loaded.
    pub async fn snapshot(&self) -> Arc<ConfigSnapshot> {
        if let Some(current) = self.current().await {
            if !self.pending_invalidation() && current.is_fresh(self.ttl) {
                return current;
            }
        }

        // Single-flight: whoever holds the reload lock does the store
        // round trip; everyone else re-checks and reuses the result.
        let _guard = self.reload.lock().await;
        if let Some(current) = self.current().await {
            if !self.pending_invalidation() && current.is_fresh(self.ttl) {
                return current;
            }
        }

        // The fetch only reflects invalidations issued up to this point;
        // a later one bumps the counter past `generation` and keeps the
        // installed snapshot stale.
        let generation = self.invalidations.load(Ordering::SeqCst);
        match self.fetch().await {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                *self.snapshot.write().await = Some(fresh.clone());
                self.applied.store(generation, Ordering::SeqCst);
                log::debug!(
                    "config cache reloaded: {} classification rules, {} segment types, {} templates",
                    fresh.classification_rules.len(),
                    fresh.segment_types.len(),
                    fresh.prompt_templates.len()
                );
                fresh
            }
            Err(e) => match self.current().await {
                Some(stale) => {
                    log::warn!("config reload failed, serving stale snapshot: {e}");
                    stale
                }
                None => {
                    log::error!("config reload failed with no prior snapshot: {e}");
                    Arc::new(ConfigSnapshot::empty())
                }
            },
        }
    }

    /// Force a reload regardless of TTL. On failure the previous snapshot
    /// stays in place.
    pub async fn load(&self) {
        self.invalidate();
        let _ = self.snapshot().await;
    }

    async fn current(&self) -> Option<Arc<ConfigSnapshot>> {
        self.snapshot.read().await.clone()
    }

    async fn fetch(&self) -> Result<ConfigSnapshot, crate::store::StoreError> {
        let classification_rules = self.store.list_active_classification_rules().await?;
        let sender_rules = self.store.list_sender_rules().await?;
        let subject_patterns = self.store.list_subject_patterns().await?;
        let segment_types = self.store.list_segment_type_configs().await?;
        let prompt_templates = self.store.list_active_prompt_templates().await?;
        Ok(ConfigSnapshot::build(
            classification_rules,
            sender_rules,
            subject_patterns,
            segment_types,
            prompt_templates,
        ))
    }
}

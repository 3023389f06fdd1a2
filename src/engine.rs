use crate::cache::{ConfigCache, ConfigSnapshot};
use crate::classifier::{EmailMessage, RuleMatcher};
use crate::prompt::{extract_time_hints, PromptResolver, TimeHint};
use crate::store::RuleStore;
use crate::timezone::TimezoneResolver;
use crate::usage::UsageTracker;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Classification and prompt output for one email, produced against a
/// single pinned cache snapshot.
#[derive(Debug, Clone)]
pub struct PreparedEmail {
    pub email_type: String,
    pub prompt: String,
    pub time_hints: Vec<TimeHint>,
}

/// Front door for the surrounding pipeline: wires the rule store, the
/// config cache, and the three resolvers together.
///
/// All operations are total. A down store, a bad rule, or a missing
/// template degrades to defaults and fallbacks; nothing here stalls an
/// email.
pub struct ItineraryEngine {
    cache: Arc<ConfigCache>,
    matcher: RuleMatcher,
    prompts: PromptResolver,
    timezones: TimezoneResolver,
    usage: Arc<UsageTracker>,
}

impl ItineraryEngine {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self::with_ttl(store, crate::cache::DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn RuleStore>, ttl: Duration) -> Self {
        let cache = Arc::new(ConfigCache::with_ttl(store.clone(), ttl));
        // Administrative writes invalidate the cache without waiting out
        // the TTL. Weak, so the listener cannot keep the cache alive.
        let listener_cache = Arc::downgrade(&cache);
        store.register_write_listener(Arc::new(move || {
            if let Some(cache) = listener_cache.upgrade() {
                cache.invalidate();
            }
        }));
        let usage = Arc::new(UsageTracker::new());
        ItineraryEngine {
            matcher: RuleMatcher::new(cache.clone()),
            prompts: PromptResolver::new(cache.clone(), usage.clone()),
            timezones: TimezoneResolver::new(cache.clone()),
            cache,
            usage,
        }
    }

    /// Booking-type label for an email; `other` when nothing matches.
    pub async fn classify(&self, email: &EmailMessage) -> String {
        self.matcher.classify(email).await
    }

    /// Model-ready prompt string for a classified email.
    pub async fn resolve_prompt(
        &self,
        email_type: &str,
        body: &str,
        hints: &[TimeHint],
    ) -> String {
        self.prompts.resolve(email_type, body, hints).await
    }

    /// Authoritative IANA timezone for the model's structured output.
    pub async fn resolve_timezone(
        &self,
        email_type: &str,
        model_output: &Value,
        raw_body: &str,
    ) -> String {
        self.timezones.resolve(email_type, model_output, raw_body).await
    }

    /// Classify and resolve the prompt for one email against a single
    /// cache snapshot, so a reload cannot slide in between the two steps.
    /// The caller sends the prompt to the model and hands the output to
    /// `resolve_timezone`.
    pub async fn prepare(&self, email: &EmailMessage) -> PreparedEmail {
        let snapshot: Arc<ConfigSnapshot> = self.cache.snapshot().await;
        let email_type = RuleMatcher::classify_with(&snapshot, email);
        let time_hints = extract_time_hints(&email.body);
        let prompt = self
            .prompts
            .resolve_with(&snapshot, &email_type, &email.body, &time_hints);
        PreparedEmail {
            email_type,
            prompt,
            time_hints,
        }
    }

    /// Administrative hook: call after any rule or template write so the
    /// next read observes it instead of waiting out the TTL.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }
}

pub mod cache;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod prompt;
pub mod store;
pub mod timezone;
pub mod usage;

pub use cache::{ConfigCache, ConfigSnapshot, DEFAULT_CACHE_TTL};
pub use classifier::{EmailMessage, RuleMatcher};
pub use config::{
    ClassificationRule, DisplayRule, PromptCategory, PromptTemplate, RuleKind, RuleSet,
    SegmentTypeConfig, SenderRule, SubjectPattern, TimeField, TimezoneAnchor, TimezoneRule,
    TimezoneSource, TrustLevel, DEFAULT_EMAIL_TYPE,
};
pub use engine::{ItineraryEngine, PreparedEmail};
pub use prompt::{extract_time_hints, interpolate, PromptResolver, TimeHint};
pub use store::{MemoryRuleStore, RuleStore, StoreError, StoreResult};
pub use timezone::{TimezoneResolver, GLOBAL_FALLBACK_TIMEZONE};
pub use usage::{ResolutionOutcome, TemplateUsage, UsageEvent, UsageTracker};

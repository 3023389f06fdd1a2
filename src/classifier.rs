use crate::cache::{ConfigCache, ConfigSnapshot};
use crate::config::{ClassificationRule, RuleKind, DEFAULT_EMAIL_TYPE};
use std::sync::Arc;

/// Raw email inputs supplied by the processing pipeline.
#[derive(Debug, Default, Clone)]
pub struct EmailMessage {
    pub body: String,
    pub subject: String,
    pub from_address: String,
}

/// Priority-ordered, first-match classification of emails to booking-type
/// labels.
pub struct RuleMatcher {
    cache: Arc<ConfigCache>,
}

impl RuleMatcher {
    pub fn new(cache: Arc<ConfigCache>) -> Self {
        RuleMatcher { cache }
    }

    /// Classify against the current cache snapshot. Total: store or cache
    /// trouble yields the default label, never an error.
    pub async fn classify(&self, email: &EmailMessage) -> String {
        let snapshot = self.cache.snapshot().await;
        Self::classify_with(&snapshot, email)
    }

    /// Classify against an explicit snapshot, so a caller can hold one
    /// consistent view across the classify/prompt steps for a single email.
    pub fn classify_with(snapshot: &ConfigSnapshot, email: &EmailMessage) -> String {
        for rule in &snapshot.classification_rules {
            if rule_matches(rule, snapshot, email) {
                log::info!(
                    "rule '{}' (priority {}) matched, classifying as '{}'",
                    rule.name,
                    rule.priority,
                    rule.email_type
                );
                return rule.email_type.clone();
            }
            log::debug!("rule '{}' did not match", rule.name);
        }
        log::debug!("no classification rule matched, defaulting to '{DEFAULT_EMAIL_TYPE}'");
        DEFAULT_EMAIL_TYPE.to_string()
    }
}

fn rule_matches(rule: &ClassificationRule, snapshot: &ConfigSnapshot, email: &EmailMessage) -> bool {
    match &rule.kind {
        RuleKind::Keyword { pattern } => contains(&email.body, pattern, rule.case_insensitive),
        RuleKind::SubjectPattern { pattern } => {
            contains(&email.subject, pattern, rule.case_insensitive)
        }
        RuleKind::SenderDomain { pattern } => {
            contains(&email.from_address, pattern, rule.case_insensitive)
        }
        RuleKind::ContentPattern { pattern } => {
            // Compiled at snapshot build; a miss means the pattern was
            // invalid and the rule degrades to substring containment.
            match snapshot.compiled_patterns.get(&rule.name) {
                Some(regex) => regex.is_match(&email.body),
                None => contains(&email.body, pattern, rule.case_insensitive),
            }
        }
    }
}

fn contains(surface: &str, pattern: &str, case_insensitive: bool) -> bool {
    if case_insensitive {
        surface.to_lowercase().contains(&pattern.to_lowercase())
    } else {
        surface.contains(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleSet;
    use crate::store::MemoryRuleStore;
    use chrono::Utc;

    fn rule(name: &str, email_type: &str, kind: RuleKind, priority: i32) -> ClassificationRule {
        ClassificationRule {
            name: name.to_string(),
            email_type: email_type.to_string(),
            kind,
            priority,
            is_active: true,
            case_insensitive: true,
            created_at: Utc::now(),
        }
    }

    fn snapshot_of(rules: Vec<ClassificationRule>) -> ConfigSnapshot {
        ConfigSnapshot::build(rules, Vec::new(), Vec::new(), Vec::new(), Vec::new())
    }

    fn ps_email() -> EmailMessage {
        EmailMessage {
            body: "Your PS reservation is confirmed. Your flight departs at 5:40 PM.".to_string(),
            subject: "UPCOMING: PS ATL | Delta 2214".to_string(),
            from_address: "memberservices@reserveps.com".to_string(),
        }
    }

    #[test]
    fn higher_priority_rule_wins_when_both_match() {
        let snapshot = snapshot_of(vec![
            rule(
                "flight_keyword",
                "flight",
                RuleKind::Keyword {
                    pattern: "flight".to_string(),
                },
                10,
            ),
            rule(
                "ps_sender_reserveps",
                "private_terminal",
                RuleKind::SenderDomain {
                    pattern: "@reserveps.com".to_string(),
                },
                25,
            ),
        ]);
        let label = RuleMatcher::classify_with(&snapshot, &ps_email());
        assert_eq!(label, "private_terminal");
    }

    #[test]
    fn classification_is_deterministic_for_a_snapshot() {
        let snapshot = snapshot_of(RuleSet::default().classification_rules);
        let email = ps_email();
        let first = RuleMatcher::classify_with(&snapshot, &email);
        let second = RuleMatcher::classify_with(&snapshot, &email);
        assert_eq!(first, second);
    }

    #[test]
    fn priority_ties_break_by_load_order() {
        let snapshot = snapshot_of(vec![
            rule(
                "first_loaded",
                "hotel",
                RuleKind::Keyword {
                    pattern: "confirmation".to_string(),
                },
                10,
            ),
            rule(
                "second_loaded",
                "flight",
                RuleKind::Keyword {
                    pattern: "confirmation".to_string(),
                },
                10,
            ),
        ]);
        let email = EmailMessage {
            body: "Your confirmation number is ABC123".to_string(),
            ..Default::default()
        };
        assert_eq!(RuleMatcher::classify_with(&snapshot, &email), "hotel");
    }

    #[test]
    fn no_match_returns_default_label() {
        let snapshot = snapshot_of(RuleSet::default().classification_rules);
        let email = EmailMessage {
            body: "Lunch on Tuesday?".to_string(),
            subject: "hi".to_string(),
            from_address: "friend@example.com".to_string(),
        };
        assert_eq!(RuleMatcher::classify_with(&snapshot, &email), DEFAULT_EMAIL_TYPE);
    }

    #[test]
    fn inactive_rule_is_never_evaluated() {
        let mut matching = rule(
            "flight_keyword",
            "flight",
            RuleKind::Keyword {
                pattern: "flight".to_string(),
            },
            10,
        );
        matching.is_active = false;
        let snapshot = snapshot_of(vec![matching]);
        let email = EmailMessage {
            body: "your flight is booked".to_string(),
            ..Default::default()
        };
        assert_eq!(RuleMatcher::classify_with(&snapshot, &email), DEFAULT_EMAIL_TYPE);
    }

    #[test]
    fn content_pattern_uses_compiled_regex() {
        let snapshot = snapshot_of(vec![rule(
            "flight_number",
            "flight",
            RuleKind::ContentPattern {
                pattern: r"\b[A-Z]{2}\s?\d{2,4}\b".to_string(),
            },
            10,
        )]);
        let email = EmailMessage {
            body: "Carrier DL 2214 departs tomorrow".to_string(),
            ..Default::default()
        };
        assert_eq!(RuleMatcher::classify_with(&snapshot, &email), "flight");
    }

    #[test]
    fn invalid_regex_falls_back_to_substring() {
        let snapshot = snapshot_of(vec![rule(
            "broken",
            "hotel",
            RuleKind::ContentPattern {
                pattern: "suite [".to_string(),
            },
            10,
        )]);
        let email = EmailMessage {
            body: "You booked Suite [Ocean View]".to_string(),
            ..Default::default()
        };
        assert_eq!(RuleMatcher::classify_with(&snapshot, &email), "hotel");
    }

    #[test]
    fn case_sensitive_rule_respects_case() {
        let mut sensitive = rule(
            "ps_subject_exact",
            "private_terminal",
            RuleKind::SubjectPattern {
                pattern: "UPCOMING: PS".to_string(),
            },
            20,
        );
        sensitive.case_insensitive = false;
        let snapshot = snapshot_of(vec![sensitive]);

        let lowercased = EmailMessage {
            subject: "upcoming: ps atl".to_string(),
            ..Default::default()
        };
        assert_eq!(
            RuleMatcher::classify_with(&snapshot, &lowercased),
            DEFAULT_EMAIL_TYPE
        );

        let exact = EmailMessage {
            subject: "UPCOMING: PS ATL".to_string(),
            ..Default::default()
        };
        assert_eq!(
            RuleMatcher::classify_with(&snapshot, &exact),
            "private_terminal"
        );
    }

    #[tokio::test]
    async fn classify_through_cache_uses_store_rules() {
        let store = Arc::new(MemoryRuleStore::new(RuleSet::default()));
        let cache = Arc::new(ConfigCache::new(store));
        let matcher = RuleMatcher::new(cache);
        assert_eq!(matcher.classify(&ps_email()).await, "private_terminal");
    }
}

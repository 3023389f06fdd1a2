use crate::cache::{ConfigCache, ConfigSnapshot};
use crate::config::{PromptCategory, BASE_TEMPLATE_TYPE};
use crate::usage::{ResolutionOutcome, UsageEvent, UsageTracker};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap();
    static ref TIME_RE: Regex =
        Regex::new(r"(?i)\b\d{1,2}:\d{2}(?::\d{2})?\s*(?:a\.?m\.?|p\.?m\.?)?").unwrap();
}

/// The line that opens the base template's schema instructions. Fragments
/// are spliced immediately before it.
const SCHEMA_MARKER: &str = "Return a JSON object with this exact structure";

/// Rendered when the pipeline found no clock times in the email.
const NO_TIMES_FOUND: &str = "No specific times found in email.";

const FALLBACK_TEMPLATE_NAME: &str = "builtin_fallback";

/// Minimal built-in instruction set used when no template is available at
/// all (store down, empty rule set). Requests the same top-level JSON
/// shape as the base template.
pub const FALLBACK_PARSING_PROMPT: &str = r#"Extract travel booking details from this email. The booking type is: {{emailType}}

Email content:
{{emailContent}}

Times found in the email:
{{extractedTimes}}

Return a JSON object with this exact structure:
{
  "type": "{{emailType}}",
  "confirmation_number": "string or null",
  "passenger_name": "string or null",
  "travel_dates": { "departure": "ISO 8601 or null", "return": "ISO 8601 or null" },
  "locations": { "origin": "string or null", "destination": "string or null" },
  "price": { "amount": "number or null", "currency": "string or null" },
  "details": "string"
}
Respond with the JSON object only."#;

/// A clock time found in the email, with the line it appeared on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeHint {
    pub text: String,
    pub context: String,
}

/// The base parsing template split into its two structural slots. A type
/// fragment is composed between them, so template authors can reword
/// either side without breaking the splice.
#[derive(Debug, Clone)]
pub struct BaseSections {
    pub preamble: String,
    pub schema_footer: String,
}

impl BaseSections {
    pub fn parse(prompt: &str) -> Self {
        match prompt.find(SCHEMA_MARKER) {
            Some(idx) => BaseSections {
                preamble: prompt[..idx].trim_end().to_string(),
                schema_footer: prompt[idx..].to_string(),
            },
            None => BaseSections {
                preamble: prompt.trim_end().to_string(),
                schema_footer: String::new(),
            },
        }
    }

    /// The base template with a type fragment spliced in front of the
    /// schema instructions.
    pub fn compose(&self, fragment: &str) -> String {
        if self.schema_footer.is_empty() {
            format!("{}\n\n{}", self.preamble, fragment.trim())
        } else {
            format!("{}\n\n{}\n\n{}", self.preamble, fragment.trim(), self.schema_footer)
        }
    }

    /// The base template on its own.
    pub fn full(&self) -> String {
        if self.schema_footer.is_empty() {
            self.preamble.clone()
        } else {
            format!("{}\n\n{}", self.preamble, self.schema_footer)
        }
    }
}

/// Replace every `{{name}}` occurrence with the supplied value, or the
/// empty string if none was supplied. No placeholder survives.
pub fn interpolate(template: &str, vars: &HashMap<&str, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            vars.get(name).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Render time hints as the numbered list the templates expect.
pub fn render_time_hints(hints: &[TimeHint]) -> String {
    if hints.is_empty() {
        return NO_TIMES_FOUND.to_string();
    }
    hints
        .iter()
        .enumerate()
        .map(|(i, hint)| format!("{}. \"{}\" in context: \"{}\"", i + 1, hint.text, hint.context))
        .collect::<Vec<String>>()
        .join("\n")
}

/// Scan the raw email body for clock times, keeping the surrounding line
/// as context. Capped so a timetable-heavy email cannot bloat the prompt.
pub fn extract_time_hints(body: &str) -> Vec<TimeHint> {
    const MAX_HINTS: usize = 10;
    let mut hints = Vec::new();
    for line in body.lines() {
        for m in TIME_RE.find_iter(line) {
            hints.push(TimeHint {
                text: m.as_str().trim().to_string(),
                context: line.trim().to_string(),
            });
            if hints.len() >= MAX_HINTS {
                return hints;
            }
        }
    }
    hints
}

/// Resolves booking-type labels to fully interpolated, model-ready prompt
/// strings. Resolution order: self-contained type template, base plus
/// type fragment, base alone, built-in fallback. Total: always returns a
/// usable prompt.
pub struct PromptResolver {
    cache: Arc<ConfigCache>,
    usage: Arc<UsageTracker>,
}

impl PromptResolver {
    pub fn new(cache: Arc<ConfigCache>, usage: Arc<UsageTracker>) -> Self {
        PromptResolver { cache, usage }
    }

    pub async fn resolve(&self, email_type: &str, body: &str, hints: &[TimeHint]) -> String {
        let snapshot = self.cache.snapshot().await;
        self.resolve_with(&snapshot, email_type, body, hints)
    }

    /// Resolve against an explicit snapshot (see `RuleMatcher::classify_with`).
    pub fn resolve_with(
        &self,
        snapshot: &ConfigSnapshot,
        email_type: &str,
        body: &str,
        hints: &[TimeHint],
    ) -> String {
        let started = Instant::now();

        let type_template = snapshot.active_template(PromptCategory::Parsing, email_type);
        let (template_text, outcome, template_name) = match type_template {
            Some(t) if t.self_contained => {
                (t.prompt.clone(), ResolutionOutcome::SelfContained, t.name.clone())
            }
            fragment => match (&snapshot.base_sections, fragment) {
                (Some(base), Some(frag)) => (
                    base.compose(&frag.prompt),
                    ResolutionOutcome::Composed,
                    frag.name.clone(),
                ),
                (Some(base), None) => {
                    let base_name = snapshot
                        .active_template(PromptCategory::Parsing, BASE_TEMPLATE_TYPE)
                        .map(|t| t.name.clone())
                        .unwrap_or_else(|| "parsing_base".to_string());
                    (base.full(), ResolutionOutcome::BaseOnly, base_name)
                }
                // A fragment with no base to splice into is unusable.
                (None, _) => {
                    log::warn!(
                        "no usable parsing template for '{email_type}', using built-in fallback"
                    );
                    (
                        FALLBACK_PARSING_PROMPT.to_string(),
                        ResolutionOutcome::Fallback,
                        FALLBACK_TEMPLATE_NAME.to_string(),
                    )
                }
            },
        };

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("emailContent", body.to_string());
        vars.insert("emailType", email_type.to_string());
        vars.insert("extractedTimes", render_time_hints(hints));

        let resolved = interpolate(&template_text, &vars);

        self.usage.record(UsageEvent {
            template: template_name,
            email_type: email_type.to_string(),
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
            token_estimate: Some((resolved.len() / 4) as u64),
            at: Utc::now(),
        });

        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuleSet, BASE_PARSING_PROMPT};
    use crate::store::MemoryRuleStore;

    fn default_snapshot() -> ConfigSnapshot {
        let rules = RuleSet::default();
        ConfigSnapshot::build(
            rules.classification_rules,
            rules.sender_rules,
            rules.subject_patterns,
            rules.segment_types,
            rules.prompt_templates,
        )
    }

    fn resolver() -> PromptResolver {
        let store = Arc::new(MemoryRuleStore::new(RuleSet::default()));
        PromptResolver::new(
            Arc::new(ConfigCache::new(store)),
            Arc::new(UsageTracker::new()),
        )
    }

    #[tokio::test]
    async fn self_contained_template_used_verbatim_with_interpolation() {
        let resolver = resolver();
        let snapshot = default_snapshot();
        let body = "Your PS ATL reservation for Delta 2214 departing 5:40 PM.";
        let prompt = resolver.resolve_with(&snapshot, "private_terminal", body, &[]);

        assert!(prompt.contains(body));
        assert!(prompt.contains("private departure facility"));
        assert!(prompt.contains(NO_TIMES_FOUND));
        assert!(!prompt.contains("{{"));
    }

    #[tokio::test]
    async fn fragment_is_composed_before_schema_footer() {
        let resolver = resolver();
        let snapshot = default_snapshot();
        let prompt = resolver.resolve_with(&snapshot, "hotel", "Hotel confirmation 123", &[]);

        let fragment_pos = prompt
            .find("This is a hotel confirmation")
            .expect("fragment missing from composed prompt");
        let schema_pos = prompt
            .find(SCHEMA_MARKER)
            .expect("schema footer missing from composed prompt");
        assert!(fragment_pos < schema_pos);
        assert!(!prompt.contains("{{"));
    }

    #[tokio::test]
    async fn base_only_path_pins_email_type() {
        let resolver = resolver();
        let snapshot = default_snapshot();
        // No flight-specific template is seeded, so the base is used alone.
        let prompt = resolver.resolve_with(&snapshot, "flight", "Flight DL 2214", &[]);
        assert!(prompt.contains("The booking type is: flight"));
        assert!(prompt.contains("\"type\": \"flight\""));
        assert!(!prompt.contains("{{"));
    }

    #[tokio::test]
    async fn empty_snapshot_uses_builtin_fallback() {
        let resolver = resolver();
        let snapshot = ConfigSnapshot::empty();
        let prompt = resolver.resolve_with(&snapshot, "hotel", "body text", &[]);
        assert!(prompt.contains("Extract travel booking details"));
        assert!(prompt.contains("body text"));
        assert!(!prompt.contains("{{"));
        assert_eq!(resolver.usage.total_fallbacks(), 1);
    }

    #[tokio::test]
    async fn time_hints_render_as_numbered_list() {
        let hints = vec![
            TimeHint {
                text: "5:40 PM".to_string(),
                context: "Departure at 5:40 PM from gate 12".to_string(),
            },
            TimeHint {
                text: "2:40 PM".to_string(),
                context: "Arrive by 2:40 PM".to_string(),
            },
        ];
        let rendered = render_time_hints(&hints);
        assert!(rendered.starts_with("1. \"5:40 PM\" in context: \"Departure at 5:40 PM"));
        assert!(rendered.contains("\n2. \"2:40 PM\""));
    }

    #[test]
    fn extract_time_hints_finds_times_with_line_context() {
        let body = "Delta 2214 departs at 5:40 PM.\nPlease arrive by 2:40 PM.\nNo times here.";
        let hints = extract_time_hints(body);
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0].text, "5:40 PM");
        assert_eq!(hints[0].context, "Delta 2214 departs at 5:40 PM.");
    }

    #[test]
    fn interpolate_replaces_unknown_placeholders_with_empty() {
        let mut vars = HashMap::new();
        vars.insert("known", "value".to_string());
        let out = interpolate("a {{known}} and {{ unknown }} b", &vars);
        assert_eq!(out, "a value and  b");
    }

    #[test]
    fn base_sections_split_at_schema_marker() {
        let sections = BaseSections::parse(BASE_PARSING_PROMPT);
        assert!(sections.preamble.contains("{{emailContent}}"));
        assert!(sections.schema_footer.starts_with(SCHEMA_MARKER));
    }

    #[test]
    fn base_without_marker_keeps_whole_text_as_preamble() {
        let sections = BaseSections::parse("just instructions, no schema");
        assert_eq!(sections.preamble, "just instructions, no schema");
        assert!(sections.schema_footer.is_empty());
        assert_eq!(sections.full(), "just instructions, no schema");
    }

    #[tokio::test]
    async fn resolve_through_cache_matches_snapshot_resolution() {
        let resolver = resolver();
        let via_cache = resolver.resolve("hotel", "Hotel stay in Madrid", &[]).await;
        assert!(via_cache.contains("Hotel stay in Madrid"));
        assert!(!via_cache.contains("{{"));
    }
}

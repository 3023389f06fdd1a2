use crate::cache::{ConfigCache, ConfigSnapshot};
use crate::config::{SegmentTypeConfig, TimezoneAnchor, TimezoneRule, TimezoneSource};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// Last resort of the fallback chain. Resolution never returns nothing.
pub const GLOBAL_FALLBACK_TIMEZONE: &str = "America/New_York";

lazy_static! {
    /// Known private-terminal facility codes as they appear in email
    /// bodies, e.g. "PS ATL" or "PS LAX".
    static ref FACILITY_CODE_RE: Regex = Regex::new(r"\bPS\s+[A-Z]{3}\b").unwrap();
}

/// Built-in location lookup: airport codes and major city names. Codes are
/// matched as whole tokens, city names as substrings of the location text.
static LOCATION_TIMEZONES: &[(&str, &str)] = &[
    // US airport codes
    ("atl", "America/New_York"),
    ("jfk", "America/New_York"),
    ("lga", "America/New_York"),
    ("ewr", "America/New_York"),
    ("bos", "America/New_York"),
    ("mia", "America/New_York"),
    ("ord", "America/Chicago"),
    ("dfw", "America/Chicago"),
    ("iah", "America/Chicago"),
    ("aus", "America/Chicago"),
    ("msp", "America/Chicago"),
    ("den", "America/Denver"),
    ("slc", "America/Denver"),
    ("phx", "America/Phoenix"),
    ("lax", "America/Los_Angeles"),
    ("sfo", "America/Los_Angeles"),
    ("sea", "America/Los_Angeles"),
    ("san", "America/Los_Angeles"),
    ("las", "America/Los_Angeles"),
    ("hnl", "Pacific/Honolulu"),
    // US cities
    ("new york", "America/New_York"),
    ("boston", "America/New_York"),
    ("atlanta", "America/New_York"),
    ("miami", "America/New_York"),
    ("washington", "America/New_York"),
    ("chicago", "America/Chicago"),
    ("dallas", "America/Chicago"),
    ("houston", "America/Chicago"),
    ("austin", "America/Chicago"),
    ("denver", "America/Denver"),
    ("phoenix", "America/Phoenix"),
    ("los angeles", "America/Los_Angeles"),
    ("san francisco", "America/Los_Angeles"),
    ("seattle", "America/Los_Angeles"),
    ("san diego", "America/Los_Angeles"),
    ("las vegas", "America/Los_Angeles"),
    ("honolulu", "Pacific/Honolulu"),
    // International
    ("lhr", "Europe/London"),
    ("london", "Europe/London"),
    ("cdg", "Europe/Paris"),
    ("paris", "Europe/Paris"),
    ("mad", "Europe/Madrid"),
    ("madrid", "Europe/Madrid"),
    ("barcelona", "Europe/Madrid"),
    ("fco", "Europe/Rome"),
    ("rome", "Europe/Rome"),
    ("fra", "Europe/Berlin"),
    ("berlin", "Europe/Berlin"),
    ("ams", "Europe/Amsterdam"),
    ("amsterdam", "Europe/Amsterdam"),
    ("nrt", "Asia/Tokyo"),
    ("hnd", "Asia/Tokyo"),
    ("tokyo", "Asia/Tokyo"),
    ("hkg", "Asia/Hong_Kong"),
    ("hong kong", "Asia/Hong_Kong"),
    ("sin", "Asia/Singapore"),
    ("singapore", "Asia/Singapore"),
    ("dxb", "Asia/Dubai"),
    ("dubai", "Asia/Dubai"),
    ("syd", "Australia/Sydney"),
    ("sydney", "Australia/Sydney"),
    ("mexico city", "America/Mexico_City"),
    ("toronto", "America/Toronto"),
    ("yyz", "America/Toronto"),
];

/// Determines the authoritative IANA timezone for a parsed booking.
///
/// Precedence: facility override for facility-anchored types, then the
/// type's timezone rules directed by its display rule, then the built-in
/// location table, then the type default, then the global fallback. Every
/// step that lacks configuration is skipped silently; the chain always
/// terminates with a zone.
pub struct TimezoneResolver {
    cache: Arc<ConfigCache>,
}

impl TimezoneResolver {
    pub fn new(cache: Arc<ConfigCache>) -> Self {
        TimezoneResolver { cache }
    }

    pub async fn resolve(&self, email_type: &str, model_output: &Value, raw_body: &str) -> String {
        let snapshot = self.cache.snapshot().await;
        Self::resolve_with(&snapshot, email_type, model_output, raw_body)
    }

    /// Resolve against an explicit snapshot (see `RuleMatcher::classify_with`).
    pub fn resolve_with(
        snapshot: &ConfigSnapshot,
        email_type: &str,
        model_output: &Value,
        raw_body: &str,
    ) -> String {
        let config = snapshot.segment_type(email_type);
        if config.is_none() {
            log::debug!("no segment type config for '{email_type}', skipping rule-based steps");
        }

        // Facility-anchored types: the departure facility's clock is
        // authoritative, whatever the destination says.
        if let Some(config) = config {
            if config.timezone_anchor == TimezoneAnchor::Facility {
                if let Some(facility) = facility_identifier(model_output, raw_body) {
                    if let Some(tz) = match_timezone_rules(&config.timezone_rules, &facility) {
                        log::debug!(
                            "facility '{facility}' matched a {email_type} timezone rule: {tz}"
                        );
                        return tz;
                    }
                    log::debug!("facility '{facility}' matched no {email_type} timezone rule");
                } else {
                    log::debug!("no facility identifier found for {email_type} booking");
                }
            } else if let Some(display_rule) = &config.display_rule {
                // Display rule says which location field feeds inference.
                if let Some(location) = source_location(model_output, display_rule.timezone_source)
                {
                    if let Some(tz) = match_timezone_rules(&config.timezone_rules, &location) {
                        log::debug!(
                            "location '{location}' matched a {email_type} timezone rule: {tz}"
                        );
                        return tz;
                    }
                }
            }
        }

        // Static table, tried against every plausible location string.
        for candidate in location_candidates(config, model_output, raw_body) {
            if let Some(tz) = static_location_lookup(&candidate) {
                log::debug!("static location table resolved '{candidate}' to {tz}");
                return tz;
            }
        }

        if let Some(tz) = config.and_then(|c| c.default_timezone.clone()) {
            log::debug!("using {email_type} default timezone {tz}");
            return tz;
        }

        log::debug!("falling back to global default timezone for '{email_type}'");
        GLOBAL_FALLBACK_TIMEZONE.to_string()
    }
}

/// The facility identifier for facility-anchored types, in preference
/// order: the structured `service_details.facility_name`, then
/// `locations.origin`, then a known facility-code pattern in the raw body.
fn facility_identifier(model_output: &Value, raw_body: &str) -> Option<String> {
    if let Some(name) = json_str(model_output, "/service_details/facility_name") {
        return Some(name);
    }
    if let Some(origin) = json_str(model_output, "/locations/origin") {
        return Some(origin);
    }
    FACILITY_CODE_RE
        .find(raw_body)
        .map(|m| m.as_str().to_string())
}

fn source_location(model_output: &Value, source: TimezoneSource) -> Option<String> {
    let pointer = match source {
        TimezoneSource::Origin => "/locations/origin",
        TimezoneSource::Destination => "/locations/destination",
    };
    json_str(model_output, pointer)
}

/// Location strings worth trying against the static table, most specific
/// first. The list tolerates every path being absent.
fn location_candidates(
    config: Option<&SegmentTypeConfig>,
    model_output: &Value,
    raw_body: &str,
) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(config) = config {
        if config.timezone_anchor == TimezoneAnchor::Facility {
            if let Some(facility) = facility_identifier(model_output, raw_body) {
                candidates.push(facility);
            }
        }
        if let Some(display_rule) = &config.display_rule {
            if let Some(location) = source_location(model_output, display_rule.timezone_source) {
                candidates.push(location);
            }
        }
    }
    for pointer in ["/locations/destination", "/locations/origin"] {
        if let Some(location) = json_str(model_output, pointer) {
            if !candidates.contains(&location) {
                candidates.push(location);
            }
        }
    }
    candidates
}

/// First rule whose pattern is a case-insensitive substring of the
/// location. Rules arrive pre-sorted by descending priority.
fn match_timezone_rules(rules: &[TimezoneRule], location: &str) -> Option<String> {
    let location = location.to_lowercase();
    rules
        .iter()
        .find(|r| location.contains(&r.location_pattern.to_lowercase()))
        .map(|r| r.timezone.clone())
}

fn static_location_lookup(location: &str) -> Option<String> {
    let location = location.to_lowercase();
    let tokens: Vec<&str> = location
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    for (key, tz) in LOCATION_TIMEZONES {
        let hit = if key.len() == 3 {
            // Airport codes only count as standalone tokens; "lax" must
            // not fire inside "relaxing".
            tokens.iter().any(|t| t == key)
        } else {
            location.contains(key)
        };
        if hit {
            return Some((*tz).to_string());
        }
    }
    None
}

fn json_str(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

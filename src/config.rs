use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label returned when no classification rule matches an email.
pub const DEFAULT_EMAIL_TYPE: &str = "other";

/// Segment-type identifier used for the shared base parsing template.
pub const BASE_TEMPLATE_TYPE: &str = "base";

fn default_true() -> bool {
    true
}

fn default_now() -> DateTime<Utc> {
    Utc::now()
}

/// A single classification rule. Rules are evaluated in descending
/// `priority` order; ties keep their original load order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub name: String,
    pub email_type: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
    #[serde(default = "default_now")]
    pub created_at: DateTime<Utc>,
}

/// The match strategy of a classification rule. Each variant targets one
/// search surface of the email.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Substring match against the email body.
    Keyword { pattern: String },
    /// Substring match against the subject line.
    SubjectPattern { pattern: String },
    /// Substring match against the sender address.
    SenderDomain { pattern: String },
    /// Regular expression tested against the body. An invalid pattern
    /// degrades to substring containment at evaluation time.
    ContentPattern { pattern: String },
}

impl RuleKind {
    pub fn pattern(&self) -> &str {
        match self {
            RuleKind::Keyword { pattern }
            | RuleKind::SubjectPattern { pattern }
            | RuleKind::SenderDomain { pattern }
            | RuleKind::ContentPattern { pattern } => pattern,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Untrusted,
}

/// Sender-level trust metadata. `email_type` is optional: a rule may mark a
/// sender trusted without pinning it to one booking type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderRule {
    pub sender_pattern: String,
    #[serde(default)]
    pub email_type: Option<String>,
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "default_now")]
    pub created_at: DateTime<Utc>,
}

/// Subject-line pattern used by the reprocessing collaborator to
/// re-identify emails. Read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectPattern {
    pub email_type: String,
    pub pattern: String,
    #[serde(default)]
    pub variations: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Which physical location anchors a booking type's authoritative clock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimezoneAnchor {
    /// The destination (or display-rule-directed) location. The common case.
    #[default]
    Destination,
    /// The service facility itself, e.g. a private departure terminal. The
    /// facility's clock wins over anything inferred from the destination.
    Facility,
}

/// Per-booking-type configuration owning that type's timezone and display
/// rules and (optionally) a default zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentTypeConfig {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub default_timezone: Option<String>,
    #[serde(default)]
    pub timezone_anchor: TimezoneAnchor,
    #[serde(default)]
    pub timezone_rules: Vec<TimezoneRule>,
    #[serde(default)]
    pub display_rule: Option<DisplayRule>,
    #[serde(default)]
    pub display_config: Option<serde_json::Value>,
}

/// Location-pattern to timezone mapping, scoped to the owning segment type.
/// Evaluated in descending priority within that type only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimezoneRule {
    pub location_pattern: String,
    pub timezone: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeField {
    Departure,
    Return,
    EarliestArrival,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimezoneSource {
    Origin,
    Destination,
}

/// Display formatting for a segment type. At most one per type; a type
/// without one passes its data through unformatted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayRule {
    pub primary_time_field: TimeField,
    pub timezone_source: TimezoneSource,
    #[serde(default)]
    pub route_format: Option<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PromptCategory {
    Classification,
    Parsing,
}

/// A versioned prompt template. Edits create new versions; at most one
/// version per `name` is active at a time (the write path enforces this,
/// readers tolerate violations by preferring the highest version).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub category: PromptCategory,
    #[serde(rename = "type")]
    pub segment_type: String,
    pub version: u32,
    pub prompt: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// A self-contained template carries its own complete schema
    /// instructions and is used verbatim; otherwise the template is a
    /// fragment spliced into the base parsing template.
    #[serde(default)]
    pub self_contained: bool,
    #[serde(default = "default_now")]
    pub created_at: DateTime<Utc>,
}

/// The full rule set as persisted/loaded in one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub classification_rules: Vec<ClassificationRule>,
    #[serde(default)]
    pub sender_rules: Vec<SenderRule>,
    #[serde(default)]
    pub subject_patterns: Vec<SubjectPattern>,
    #[serde(default)]
    pub segment_types: Vec<SegmentTypeConfig>,
    #[serde(default)]
    pub prompt_templates: Vec<PromptTemplate>,
}

impl RuleSet {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let rule_set: RuleSet = serde_yaml::from_str(&content)?;
        Ok(rule_set)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Empty rule set. Classification of anything against it yields the
    /// default label.
    pub fn empty() -> Self {
        RuleSet {
            classification_rules: Vec::new(),
            sender_rules: Vec::new(),
            subject_patterns: Vec::new(),
            segment_types: Vec::new(),
            prompt_templates: Vec::new(),
        }
    }
}

impl Default for RuleSet {
    /// Starter rule set covering the standard booking types so the engine
    /// is usable before any administrative configuration.
    fn default() -> Self {
        RuleSet {
            classification_rules: vec![
                ClassificationRule {
                    name: "ps_sender_reserveps".to_string(),
                    email_type: "private_terminal".to_string(),
                    kind: RuleKind::SenderDomain {
                        pattern: "@reserveps.com".to_string(),
                    },
                    priority: 25,
                    is_active: true,
                    case_insensitive: true,
                    created_at: Utc::now(),
                },
                ClassificationRule {
                    name: "ps_subject_upcoming".to_string(),
                    email_type: "private_terminal".to_string(),
                    kind: RuleKind::SubjectPattern {
                        pattern: "UPCOMING: PS".to_string(),
                    },
                    priority: 24,
                    is_active: true,
                    case_insensitive: true,
                    created_at: Utc::now(),
                },
                ClassificationRule {
                    name: "car_rental_keyword".to_string(),
                    email_type: "car_rental".to_string(),
                    kind: RuleKind::Keyword {
                        pattern: "car rental".to_string(),
                    },
                    priority: 15,
                    is_active: true,
                    case_insensitive: true,
                    created_at: Utc::now(),
                },
                ClassificationRule {
                    name: "hotel_keyword".to_string(),
                    email_type: "hotel".to_string(),
                    kind: RuleKind::Keyword {
                        pattern: "hotel".to_string(),
                    },
                    priority: 12,
                    is_active: true,
                    case_insensitive: true,
                    created_at: Utc::now(),
                },
                ClassificationRule {
                    name: "flight_keyword".to_string(),
                    email_type: "flight".to_string(),
                    kind: RuleKind::Keyword {
                        pattern: "flight".to_string(),
                    },
                    priority: 10,
                    is_active: true,
                    case_insensitive: true,
                    created_at: Utc::now(),
                },
            ],
            sender_rules: vec![SenderRule {
                sender_pattern: "@reserveps.com".to_string(),
                email_type: Some("private_terminal".to_string()),
                trust_level: TrustLevel::Trusted,
                notes: Some("PS member services".to_string()),
                created_at: Utc::now(),
            }],
            subject_patterns: vec![SubjectPattern {
                email_type: "private_terminal".to_string(),
                pattern: "UPCOMING: PS".to_string(),
                variations: vec![
                    "Your PS Reservation".to_string(),
                    "PS Reservation Confirmation".to_string(),
                ],
                is_active: true,
            }],
            segment_types: default_segment_types(),
            prompt_templates: default_prompt_templates(),
        }
    }
}

fn default_segment_types() -> Vec<SegmentTypeConfig> {
    vec![
        SegmentTypeConfig {
            name: "flight".to_string(),
            display_name: "Flight".to_string(),
            description: Some("Commercial airline booking".to_string()),
            is_active: true,
            default_timezone: None,
            timezone_anchor: TimezoneAnchor::Destination,
            timezone_rules: Vec::new(),
            display_rule: Some(DisplayRule {
                primary_time_field: TimeField::Departure,
                timezone_source: TimezoneSource::Origin,
                route_format: Some("{origin} to {destination}".to_string()),
                custom_fields: HashMap::new(),
            }),
            display_config: None,
        },
        SegmentTypeConfig {
            name: "hotel".to_string(),
            display_name: "Hotel".to_string(),
            description: Some("Hotel stay".to_string()),
            is_active: true,
            default_timezone: None,
            timezone_anchor: TimezoneAnchor::Destination,
            timezone_rules: Vec::new(),
            display_rule: Some(DisplayRule {
                primary_time_field: TimeField::Departure,
                timezone_source: TimezoneSource::Destination,
                route_format: None,
                custom_fields: HashMap::new(),
            }),
            display_config: None,
        },
        SegmentTypeConfig {
            name: "car_rental".to_string(),
            display_name: "Car Rental".to_string(),
            description: Some("Rental car pickup and return".to_string()),
            is_active: true,
            default_timezone: None,
            timezone_anchor: TimezoneAnchor::Destination,
            timezone_rules: Vec::new(),
            display_rule: Some(DisplayRule {
                primary_time_field: TimeField::Departure,
                timezone_source: TimezoneSource::Origin,
                route_format: None,
                custom_fields: HashMap::new(),
            }),
            display_config: None,
        },
        SegmentTypeConfig {
            name: "private_terminal".to_string(),
            display_name: "Private Terminal".to_string(),
            description: Some("Private departure terminal service".to_string()),
            is_active: true,
            default_timezone: Some("America/New_York".to_string()),
            timezone_anchor: TimezoneAnchor::Facility,
            timezone_rules: vec![
                TimezoneRule {
                    location_pattern: "PS ATL".to_string(),
                    timezone: "America/New_York".to_string(),
                    priority: 10,
                },
                TimezoneRule {
                    location_pattern: "PS LAX".to_string(),
                    timezone: "America/Los_Angeles".to_string(),
                    priority: 10,
                },
                TimezoneRule {
                    location_pattern: "PS JFK".to_string(),
                    timezone: "America/New_York".to_string(),
                    priority: 10,
                },
                TimezoneRule {
                    location_pattern: "PS DFW".to_string(),
                    timezone: "America/Chicago".to_string(),
                    priority: 10,
                },
            ],
            display_rule: Some(DisplayRule {
                primary_time_field: TimeField::EarliestArrival,
                timezone_source: TimezoneSource::Origin,
                route_format: None,
                custom_fields: HashMap::new(),
            }),
            display_config: None,
        },
        SegmentTypeConfig {
            name: DEFAULT_EMAIL_TYPE.to_string(),
            display_name: "Other".to_string(),
            description: None,
            is_active: true,
            default_timezone: None,
            timezone_anchor: TimezoneAnchor::Destination,
            timezone_rules: Vec::new(),
            display_rule: None,
            display_config: None,
        },
    ]
}

fn default_prompt_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate {
            name: "parsing_base".to_string(),
            category: PromptCategory::Parsing,
            segment_type: BASE_TEMPLATE_TYPE.to_string(),
            version: 1,
            prompt: BASE_PARSING_PROMPT.to_string(),
            is_active: true,
            self_contained: false,
            created_at: Utc::now(),
        },
        PromptTemplate {
            name: "parsing_hotel".to_string(),
            category: PromptCategory::Parsing,
            segment_type: "hotel".to_string(),
            version: 1,
            prompt: HOTEL_FRAGMENT_PROMPT.to_string(),
            is_active: true,
            self_contained: false,
            created_at: Utc::now(),
        },
        PromptTemplate {
            name: "parsing_private_terminal".to_string(),
            category: PromptCategory::Parsing,
            segment_type: "private_terminal".to_string(),
            version: 1,
            prompt: PRIVATE_TERMINAL_PROMPT.to_string(),
            is_active: true,
            self_contained: true,
            created_at: Utc::now(),
        },
    ]
}

pub const BASE_PARSING_PROMPT: &str = r#"You are a travel itinerary parser. Extract the booking details from the confirmation email below.

The booking type is: {{emailType}}

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
Respond with the JSON object only, no commentary."#;

pub const HOTEL_FRAGMENT_PROMPT: &str = r#"This is a hotel confirmation. Treat check-in as the departure date and check-out as the return date. Put the hotel name and city in locations.destination and the room type, rate plan, and cancellation terms in details."#;

pub const PRIVATE_TERMINAL_PROMPT: &str = r#"You are parsing a private terminal (PS) reservation email. These confirm access to a private departure facility attached to a commercial airport.

Email content:
{{emailContent}}

Times found in the email:
{{extractedTimes}}

Return a JSON object with this exact structure:
{
  "type": "private_terminal",
  "confirmation_number": "string or null",
  "passenger_name": "string or null",
  "travel_dates": { "departure": "ISO 8601 or null", "return": null },
  "locations": { "origin": "facility name, e.g. PS ATL", "destination": "string or null" },
  "price": { "amount": "number or null", "currency": "string or null" },
  "service_details": {
    "facility_name": "facility name, e.g. PS LAX",
    "earliest_arrival_time": "ISO 8601 or null",
    "latest_arrival_time": "ISO 8601 or null"
  },
  "associated_flight": { "flight_number": "string or null", "departure_time": "ISO 8601 or null" },
  "details": "string"
}
All times are local to the facility, not the flight destination. If the email gives a flight departure time but no arrival window, set earliest_arrival_time to three hours before the flight departure.
Respond with the JSON object only, no commentary."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_kind_round_trips_through_yaml() {
        let yaml = r#"
name: ps_sender
email_type: private_terminal
type: sender_domain
pattern: "@reserveps.com"
priority: 25
"#;
        let rule: ClassificationRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            rule.kind,
            RuleKind::SenderDomain {
                pattern: "@reserveps.com".to_string()
            }
        );
        assert!(rule.is_active);
        assert!(rule.case_insensitive);
    }

    #[test]
    fn default_rule_set_covers_standard_types() {
        let rules = RuleSet::default();
        let types: Vec<&str> = rules.segment_types.iter().map(|t| t.name.as_str()).collect();
        for expected in ["flight", "hotel", "car_rental", "private_terminal", "other"] {
            assert!(types.contains(&expected), "missing segment type {expected}");
        }
        let ps = rules
            .segment_types
            .iter()
            .find(|t| t.name == "private_terminal")
            .unwrap();
        assert_eq!(ps.timezone_anchor, TimezoneAnchor::Facility);
    }

    #[test]
    fn default_templates_have_one_active_version_each() {
        let rules = RuleSet::default();
        let mut names: Vec<&str> = rules
            .prompt_templates
            .iter()
            .filter(|t| t.is_active)
            .map(|t| t.name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), rules.prompt_templates.len());
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WatcherError;

/// Normalized key/value snapshot of a rendered page. Ordered so that diff
/// descriptions and fingerprints are stable across runs.
pub type StateMap = BTreeMap<String, String>;

// =============================================================================
// Monitoring interval
// =============================================================================

/// Fixed enumeration of scrape cadences. The small set keeps scheduler
/// arithmetic trivial and allows bucketing by tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Min15,
    Min30,
    Hourly,
    Daily,
}

impl Interval {
    pub fn duration(self) -> Duration {
        match self {
            Interval::Min15 => Duration::minutes(15),
            Interval::Min30 => Duration::minutes(30),
            Interval::Hourly => Duration::hours(1),
            Interval::Daily => Duration::days(1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Min15 => "15min",
            Interval::Min30 => "30min",
            Interval::Hourly => "hourly",
            Interval::Daily => "daily",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "15min" => Some(Interval::Min15),
            "30min" => Some(Interval::Min30),
            "hourly" => Some(Interval::Hourly),
            "daily" => Some(Interval::Daily),
            _ => None,
        }
    }
}

// =============================================================================
// Alert policy
// =============================================================================

/// Predicate deciding whether a state diff deserves an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertPolicy {
    /// Any non-empty diff produces an event.
    EveryChange,
    /// Only transitions into a key's configured alert-relevant value set.
    FirstMatch,
    /// The AI judges whether the diff matches the owner's stated intent.
    Intent,
}

impl AlertPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertPolicy::EveryChange => "every_change",
            AlertPolicy::FirstMatch => "first_match",
            AlertPolicy::Intent => "intent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "every_change" => Some(AlertPolicy::EveryChange),
            "first_match" => Some(AlertPolicy::FirstMatch),
            "intent" => Some(AlertPolicy::Intent),
            _ => None,
        }
    }
}

// =============================================================================
// Visibility
// =============================================================================

/// Who may observe a target's feed. Public targets carry a slug unique
/// across all public targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "slug")]
pub enum Visibility {
    Private,
    Public(String),
}

impl Visibility {
    pub fn is_public(&self) -> bool {
        matches!(self, Visibility::Public(_))
    }

    pub fn slug(&self) -> Option<&str> {
        match self {
            Visibility::Private => None,
            Visibility::Public(slug) => Some(slug),
        }
    }
}

// =============================================================================
// Extraction config
// =============================================================================

/// Locator syntax, disambiguated by prefix: `//...` or `(...` is XPath,
/// anything else is a CSS selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorKind {
    Css,
    XPath,
}

pub fn locator_kind(locator: &str) -> LocatorKind {
    if locator.starts_with("//") || locator.starts_with('(') {
        LocatorKind::XPath
    } else {
        LocatorKind::Css
    }
}

/// Per-key normalization applied after the unconditional trim and internal
/// whitespace collapse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Normalize {
    #[serde(default)]
    pub lowercase: bool,
    #[serde(default)]
    pub numeric: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KeySpec {
    /// CSS selector or XPath expression (see `locator_kind`).
    pub locator: String,
    #[serde(default)]
    pub normalize: Normalize,
    /// Values that constitute an interesting state under the first-match policy.
    #[serde(default)]
    pub alert_values: Vec<String>,
}

impl KeySpec {
    pub fn kind(&self) -> LocatorKind {
        locator_kind(&self.locator)
    }
}

pub const MAX_CONFIG_KEYS: usize = 32;
pub const MAX_LOCATOR_LEN: usize = 512;

/// Self-contained mapping from key name to locator + normalization.
/// Validated against the schema below before it is ever persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionConfig {
    pub keys: BTreeMap<String, KeySpec>,
}

impl ExtractionConfig {
    /// Minimal fallback used when config synthesis is unavailable: the whole
    /// page body under a single `content` key.
    pub fn fallback() -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(
            "content".to_string(),
            KeySpec {
                locator: "body".to_string(),
                normalize: Normalize::default(),
                alert_values: Vec::new(),
            },
        );
        Self { keys }
    }

    pub fn validate(&self) -> Result<(), WatcherError> {
        if self.keys.is_empty() {
            return Err(WatcherError::Validation(
                "extraction config must define at least one key".to_string(),
            ));
        }
        if self.keys.len() > MAX_CONFIG_KEYS {
            return Err(WatcherError::Validation(format!(
                "extraction config defines {} keys, maximum is {MAX_CONFIG_KEYS}",
                self.keys.len()
            )));
        }
        for (name, spec) in &self.keys {
            if name.is_empty()
                || name.len() > 64
                || !name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
                || !name.starts_with(|c: char| c.is_ascii_lowercase())
            {
                return Err(WatcherError::Validation(format!(
                    "invalid key name {name:?}: must be snake_case, starting with a letter"
                )));
            }
            let locator = spec.locator.trim();
            if locator.is_empty() {
                return Err(WatcherError::Validation(format!(
                    "key {name:?} has an empty locator"
                )));
            }
            if locator.len() > MAX_LOCATOR_LEN {
                return Err(WatcherError::Validation(format!(
                    "key {name:?} locator exceeds {MAX_LOCATOR_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Target
// =============================================================================

/// Derived observability state. Degraded does not stop scheduling; it only
/// scales the cadence by the backoff multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Paused,
    Active,
    Degraded,
}

/// A monitored page: URL, extraction config, cadence, and alert policy,
/// plus the rolling scrape bookkeeping the scheduler and workers maintain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub url: String,
    pub name: String,
    pub description: String,
    pub config: ExtractionConfig,
    pub interval: Interval,
    pub alert_policy: AlertPolicy,
    pub summary_enabled: bool,
    pub active: bool,
    pub visibility: Visibility,
    pub folder_id: Option<Uuid>,
    /// Present only after at least one successful scrape.
    pub current_state: Option<StateMap>,
    /// State as of the most recently emitted alert (first-match bookkeeping).
    pub last_alert_state: Option<StateMap>,
    pub last_scrape_at: Option<DateTime<Utc>>,
    pub last_scrape_end: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_errors: u32,
    pub created_at: DateTime<Utc>,
}

impl Target {
    pub fn status(&self, degraded_threshold: u32) -> TargetStatus {
        if !self.active {
            TargetStatus::Paused
        } else if self.consecutive_errors >= degraded_threshold {
            TargetStatus::Degraded
        } else {
            TargetStatus::Active
        }
    }

    pub fn healthy(&self, degraded_threshold: u32) -> bool {
        self.consecutive_errors < degraded_threshold
    }
}

// =============================================================================
// Change event
// =============================================================================

/// Immutable record of a state transition worth surfacing. Append-only;
/// the AI summary is patched in after the fact, off the critical path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub target_id: Uuid,
    pub ts: DateTime<Utc>,
    pub title: String,
    /// One line per changed key, `"<key>: <prior> → <current>"`.
    pub description: String,
    pub permalink: String,
    pub summary: Option<String>,
    pub prior_state: StateMap,
    pub current_state: StateMap,
    pub fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(locator: &str) -> KeySpec {
        KeySpec {
            locator: locator.to_string(),
            normalize: Normalize::default(),
            alert_values: Vec::new(),
        }
    }

    #[test]
    fn locator_prefix_disambiguates() {
        assert_eq!(locator_kind("div.price > span"), LocatorKind::Css);
        assert_eq!(locator_kind("//div[@id='price']"), LocatorKind::XPath);
        assert_eq!(locator_kind("(//h1)[1]"), LocatorKind::XPath);
    }

    #[test]
    fn empty_config_is_invalid() {
        let config = ExtractionConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn fallback_config_validates() {
        let config = ExtractionConfig::fallback();
        config.validate().expect("fallback must be valid");
        assert_eq!(config.keys.len(), 1);
        assert!(config.keys.contains_key("content"));
    }

    #[test]
    fn key_names_must_be_snake_case() {
        let mut config = ExtractionConfig::default();
        config.keys.insert("Status".to_string(), spec("h1"));
        assert!(config.validate().is_err());

        let mut config = ExtractionConfig::default();
        config.keys.insert("ticket_status".to_string(), spec("h1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn too_many_keys_rejected() {
        let mut config = ExtractionConfig::default();
        for i in 0..=MAX_CONFIG_KEYS {
            config.keys.insert(format!("key_{i}"), spec("h1"));
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_locator_rejected() {
        let mut config = ExtractionConfig::default();
        config
            .keys
            .insert("status".to_string(), spec(&"a".repeat(MAX_LOCATOR_LEN + 1)));
        assert!(config.validate().is_err());
    }

    #[test]
    fn interval_round_trips() {
        for interval in [
            Interval::Min15,
            Interval::Min30,
            Interval::Hourly,
            Interval::Daily,
        ] {
            assert_eq!(Interval::parse(interval.as_str()), Some(interval));
        }
        assert_eq!(Interval::parse("weekly"), None);
    }

    #[test]
    fn degraded_at_threshold() {
        let target = Target {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            url: "https://example.com".to_string(),
            name: "example".to_string(),
            description: String::new(),
            config: ExtractionConfig::fallback(),
            interval: Interval::Hourly,
            alert_policy: AlertPolicy::EveryChange,
            summary_enabled: false,
            active: true,
            visibility: Visibility::Private,
            folder_id: None,
            current_state: None,
            last_alert_state: None,
            last_scrape_at: None,
            last_scrape_end: None,
            last_error: None,
            consecutive_errors: 5,
            created_at: Utc::now(),
        };
        assert_eq!(target.status(5), TargetStatus::Degraded);
        assert!(!target.healthy(5));

        let mut recovered = target.clone();
        recovered.consecutive_errors = 0;
        assert_eq!(recovered.status(5), TargetStatus::Active);
    }
}

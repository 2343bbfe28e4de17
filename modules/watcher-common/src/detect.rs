//! Change detection. Pure functions from (target, prior state, current
//! state) to a detection outcome; no clock reads, no I/O. The worker applies
//! the outcome: persist baseline, write an event, patch last-alert state.

use xxhash_rust::xxh3::xxh3_64;

use crate::types::{AlertPolicy, StateMap, Target};

/// One key's transition in a symmetric diff. A key missing on either side
/// (after a config change) shows up with `None` on that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub key: String,
    pub prior: Option<String>,
    pub current: Option<String>,
}

/// Outcome of evaluating a scrape against the target's alert policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// First successful scrape: store the baseline, emit nothing.
    Baseline,
    /// States are identical, nothing to do.
    Unchanged,
    /// A diff exists but the policy keeps it quiet. The baseline still
    /// advances so later scrapes compare against the new state.
    Silent { update_last_alert: bool },
    /// The policy wants an event.
    Alert(AlertDraft),
}

/// Everything the worker needs to compose the change event. The AI summary
/// is not part of the draft; it is patched in later, off the critical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertDraft {
    pub changes: Vec<KeyChange>,
    /// One line per changed key, `"<key>: <prior> → <current>"`.
    pub description: String,
    /// Stable digest of the change lines, used for duplicate suppression.
    pub fingerprint: String,
    /// Whether `last_alert_state` must be set to the current state.
    pub update_last_alert: bool,
    /// Intent policy: the AI collaborator decides whether this diff matches
    /// the owner's stated intent before the event is written.
    pub needs_judgment: bool,
}

/// Symmetric diff over the union of keys, sorted by key name.
pub fn diff_states(prior: &StateMap, current: &StateMap) -> Vec<KeyChange> {
    let mut changes = Vec::new();

    for (key, prior_value) in prior {
        match current.get(key) {
            Some(current_value) if current_value == prior_value => {}
            other => changes.push(KeyChange {
                key: key.clone(),
                prior: Some(prior_value.clone()),
                current: other.cloned(),
            }),
        }
    }
    for (key, current_value) in current {
        if !prior.contains_key(key) {
            changes.push(KeyChange {
                key: key.clone(),
                prior: None,
                current: Some(current_value.clone()),
            });
        }
    }

    changes.sort_by(|a, b| a.key.cmp(&b.key));
    changes
}

/// Human-readable diff, one `"<key>: <prior> → <current>"` line per change.
pub fn describe_changes(changes: &[KeyChange]) -> String {
    changes
        .iter()
        .map(|c| {
            format!(
                "{}: {} → {}",
                c.key,
                c.prior.as_deref().unwrap_or("(none)"),
                c.current.as_deref().unwrap_or("(none)")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Stable digest over the sorted change lines. Two scrapes observing the
/// same transition hash identically regardless of scrape timing.
pub fn fingerprint(changes: &[KeyChange]) -> String {
    let joined = describe_changes(changes);
    format!("{:016x}", xxh3_64(joined.as_bytes()))
}

/// Evaluate a freshly extracted state against the target's alert policy.
pub fn detect(target: &Target, current: &StateMap) -> Detection {
    let prior = match &target.current_state {
        Some(state) if !state.is_empty() => state,
        _ => return Detection::Baseline,
    };

    let changes = diff_states(prior, current);
    if changes.is_empty() {
        return Detection::Unchanged;
    }

    match target.alert_policy {
        AlertPolicy::EveryChange => Detection::Alert(AlertDraft {
            description: describe_changes(&changes),
            fingerprint: fingerprint(&changes),
            changes,
            update_last_alert: false,
            needs_judgment: false,
        }),
        AlertPolicy::Intent => Detection::Alert(AlertDraft {
            description: describe_changes(&changes),
            fingerprint: fingerprint(&changes),
            changes,
            update_last_alert: false,
            needs_judgment: true,
        }),
        AlertPolicy::FirstMatch => detect_first_match(target, current, changes),
    }
}

/// First-match policy: an event fires when any one key transitions into its
/// configured alert-relevant value set, guarded against re-alerting for a
/// state already alerted on. `last_alert_state` tracks the most recent state
/// the policy evaluated (quiet or not), so a departure and re-entry alerts
/// again while a repeat observation of the same interesting state does not.
fn detect_first_match(target: &Target, current: &StateMap, changes: Vec<KeyChange>) -> Detection {
    let matched: Vec<&KeyChange> = changes
        .iter()
        .filter(|c| {
            let Some(current_value) = c.current.as_deref() else {
                return false;
            };
            let Some(spec) = target.config.keys.get(&c.key) else {
                return false;
            };
            if !spec.alert_values.iter().any(|v| v == current_value) {
                return false;
            }
            // Transition INTO the set: the prior value must not already be in it.
            match c.prior.as_deref() {
                Some(prior_value) => !spec.alert_values.iter().any(|v| v == prior_value),
                None => true,
            }
        })
        .collect();

    if matched.is_empty() {
        return Detection::Silent {
            update_last_alert: true,
        };
    }

    let last_alert = target.last_alert_state.as_ref();
    let differs = matched.iter().any(|c| {
        last_alert
            .and_then(|state| state.get(&c.key))
            .map(|v| Some(v.as_str()) != c.current.as_deref())
            .unwrap_or(true)
    });

    if !differs {
        return Detection::Silent {
            update_last_alert: true,
        };
    }

    Detection::Alert(AlertDraft {
        description: describe_changes(&changes),
        fingerprint: fingerprint(&changes),
        changes,
        update_last_alert: true,
        needs_judgment: false,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::types::{
        AlertPolicy, ExtractionConfig, Interval, KeySpec, Normalize, Visibility,
    };

    fn state(pairs: &[(&str, &str)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn make_target(policy: AlertPolicy, alert_values: &[&str]) -> Target {
        let mut keys = BTreeMap::new();
        keys.insert(
            "status".to_string(),
            KeySpec {
                locator: "#status".to_string(),
                normalize: Normalize::default(),
                alert_values: alert_values.iter().map(|v| v.to_string()).collect(),
            },
        );
        Target {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            url: "https://example.com/tickets".to_string(),
            name: "ticket page".to_string(),
            description: "tell me when tickets open".to_string(),
            config: ExtractionConfig { keys },
            interval: Interval::Min15,
            alert_policy: policy,
            summary_enabled: false,
            active: true,
            visibility: Visibility::Private,
            folder_id: None,
            current_state: None,
            last_alert_state: None,
            last_scrape_at: None,
            last_scrape_end: None,
            last_error: None,
            consecutive_errors: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn first_scrape_is_baseline() {
        let target = make_target(AlertPolicy::EveryChange, &[]);
        let detection = detect(&target, &state(&[("status", "closed")]));
        assert_eq!(detection, Detection::Baseline);
    }

    #[test]
    fn identical_states_are_unchanged() {
        let mut target = make_target(AlertPolicy::EveryChange, &[]);
        target.current_state = Some(state(&[("status", "closed")]));
        let detection = detect(&target, &state(&[("status", "closed")]));
        assert_eq!(detection, Detection::Unchanged);
    }

    #[test]
    fn every_change_alerts_on_any_diff() {
        let mut target = make_target(AlertPolicy::EveryChange, &[]);
        target.current_state = Some(state(&[("status", "closed")]));

        let detection = detect(&target, &state(&[("status", "open")]));
        let Detection::Alert(draft) = detection else {
            panic!("expected an alert, got {detection:?}");
        };
        assert_eq!(draft.description, "status: closed → open");
        assert!(!draft.update_last_alert);
        assert!(!draft.needs_judgment);
    }

    #[test]
    fn intent_policy_defers_to_judgment() {
        let mut target = make_target(AlertPolicy::Intent, &[]);
        target.current_state = Some(state(&[("status", "closed")]));

        let Detection::Alert(draft) = detect(&target, &state(&[("status", "open")])) else {
            panic!("expected an alert draft");
        };
        assert!(draft.needs_judgment);
    }

    #[test]
    fn diff_covers_added_and_removed_keys() {
        let prior = state(&[("status", "closed"), ("price", "10")]);
        let current = state(&[("status", "closed"), ("qty", "3")]);
        let changes = diff_states(&prior, &current);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].key, "price");
        assert_eq!(changes[0].current, None);
        assert_eq!(changes[1].key, "qty");
        assert_eq!(changes[1].prior, None);
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let prior = state(&[("status", "closed")]);
        let open = state(&[("status", "open")]);
        let gone = state(&[("status", "gone")]);

        let a = fingerprint(&diff_states(&prior, &open));
        let b = fingerprint(&diff_states(&prior, &open));
        let c = fingerprint(&diff_states(&prior, &gone));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn first_match_ignores_changes_outside_the_set() {
        let mut target = make_target(AlertPolicy::FirstMatch, &["open"]);
        target.current_state = Some(state(&[("status", "closed")]));

        let detection = detect(&target, &state(&[("status", "waitlist")]));
        assert_eq!(
            detection,
            Detection::Silent {
                update_last_alert: true
            }
        );
    }

    #[test]
    fn first_match_requires_a_transition_into_the_set() {
        let mut target = make_target(AlertPolicy::FirstMatch, &["open", "presale"]);
        // Already inside the set; moving between interesting values is not
        // a transition into it.
        target.current_state = Some(state(&[("status", "open")]));
        target.last_alert_state = Some(state(&[("status", "open")]));

        let detection = detect(&target, &state(&[("status", "presale")]));
        assert_eq!(
            detection,
            Detection::Silent {
                update_last_alert: true
            }
        );
    }

    /// The sequence closed → open → open → closed → open fires exactly on
    /// the two transitions into "open".
    #[test]
    fn first_match_alert_once_sequence() {
        let mut target = make_target(AlertPolicy::FirstMatch, &["open"]);
        let mut events = 0;

        for step in ["closed", "open", "open", "closed", "open"] {
            let current = state(&[("status", step)]);
            match detect(&target, &current) {
                Detection::Baseline => {
                    target.current_state = Some(current);
                }
                Detection::Unchanged => {}
                Detection::Silent { update_last_alert } => {
                    if update_last_alert {
                        target.last_alert_state = Some(current.clone());
                    }
                    target.current_state = Some(current);
                }
                Detection::Alert(draft) => {
                    events += 1;
                    if draft.update_last_alert {
                        target.last_alert_state = Some(current.clone());
                    }
                    target.current_state = Some(current);
                }
            }
        }

        assert_eq!(events, 2, "exactly the two transitions into open alert");
    }

    #[test]
    fn first_match_any_one_key_suffices() {
        let mut target = make_target(AlertPolicy::FirstMatch, &["open"]);
        target.config.keys.insert(
            "stock".to_string(),
            KeySpec {
                locator: "#stock".to_string(),
                normalize: Normalize::default(),
                alert_values: vec!["available".to_string()],
            },
        );
        target.current_state = Some(state(&[("status", "closed"), ("stock", "none")]));

        // Only one of the two watched keys enters its set.
        let Detection::Alert(draft) =
            detect(&target, &state(&[("status", "closed"), ("stock", "available")]))
        else {
            panic!("expected alert when any one key matches");
        };
        assert!(draft.update_last_alert);
    }
}

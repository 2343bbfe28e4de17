//! Feed materialization: a target's recent events as RSS 2.0 XML.
//!
//! Pure projection of stored events, no transformation. Encoded output is
//! cached per target behind a version counter; every event insert (and
//! summary patch) bumps the counter and the stale entry is discarded lazily
//! on the next request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rss::{ChannelBuilder, GuidBuilder, ItemBuilder};
use tracing::debug;
use uuid::Uuid;

use watcher_common::{ChangeEvent, Target, WatcherError};
use watcher_store::Store;

/// How many recent events a feed carries.
const FEED_ITEMS: i64 = 50;

// =============================================================================
// Version-counter cache
// =============================================================================

struct CachedFeed {
    version: u64,
    xml: String,
}

/// Process-local cache keyed by (target id, version counter).
#[derive(Default)]
pub struct FeedCache {
    entries: Mutex<HashMap<Uuid, CachedFeed>>,
    versions: Mutex<HashMap<Uuid, u64>>,
}

impl FeedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version for a target; 0 until the first bump.
    pub fn version(&self, target_id: Uuid) -> u64 {
        *self.versions.lock().unwrap().get(&target_id).unwrap_or(&0)
    }

    /// Invalidate: called on every event insert and summary patch.
    pub fn bump(&self, target_id: Uuid) {
        *self.versions.lock().unwrap().entry(target_id).or_insert(0) += 1;
    }

    /// Forget a deleted target entirely.
    pub fn evict(&self, target_id: Uuid) {
        self.versions.lock().unwrap().remove(&target_id);
        self.entries.lock().unwrap().remove(&target_id);
    }

    fn get(&self, target_id: Uuid, version: u64) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&target_id)
            .filter(|cached| cached.version == version)
            .map(|cached| cached.xml.clone())
    }

    fn put(&self, target_id: Uuid, version: u64, xml: String) {
        self.entries
            .lock()
            .unwrap()
            .insert(target_id, CachedFeed { version, xml });
    }
}

// =============================================================================
// Assembler
// =============================================================================

#[derive(Clone)]
pub struct FeedAssembler {
    store: Store,
    cache: Arc<FeedCache>,
}

impl FeedAssembler {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: Arc::new(FeedCache::new()),
        }
    }

    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    /// Encoded feed for a target, from cache when the version still matches.
    pub async fn feed_xml(&self, target: &Target) -> Result<String, WatcherError> {
        let version = self.cache.version(target.id);
        if let Some(xml) = self.cache.get(target.id, version) {
            return Ok(xml);
        }

        let events = self.store.list_events(target.id, None, FEED_ITEMS).await?;
        let xml = render_feed(target, &events);
        debug!(target_id = %target.id, version, items = events.len(), "feed rendered");
        self.cache.put(target.id, version, xml.clone());
        Ok(xml)
    }
}

/// RSS 2.0 encoding. Channel metadata comes from the target, items from the
/// events verbatim; the writer handles XML escaping.
pub fn render_feed(target: &Target, events: &[ChangeEvent]) -> String {
    let last_build = events
        .iter()
        .map(|e| e.ts)
        .max()
        .map(|ts| ts.max(target.created_at))
        .unwrap_or(target.created_at);

    let items: Vec<rss::Item> = events
        .iter()
        .map(|event| {
            let description = event
                .summary
                .clone()
                .unwrap_or_else(|| event.description.clone());
            ItemBuilder::default()
                .title(Some(event.title.clone()))
                .description(Some(description))
                .link(Some(event.permalink.clone()))
                .pub_date(Some(event.ts.to_rfc2822()))
                .guid(Some(
                    GuidBuilder::default()
                        .value(event.id.to_string())
                        .permalink(false)
                        .build(),
                ))
                .build()
        })
        .collect();

    ChannelBuilder::default()
        .title(target.name.clone())
        .link(target.url.clone())
        .description(target.description.clone())
        .last_build_date(Some(last_build.to_rfc2822()))
        .items(items)
        .build()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use watcher_common::{AlertPolicy, ExtractionConfig, Interval, StateMap, Visibility};

    fn make_target() -> Target {
        Target {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            url: "https://example.com/tickets".to_string(),
            name: "ticket page".to_string(),
            description: "watching ticket status".to_string(),
            config: ExtractionConfig::fallback(),
            interval: Interval::Hourly,
            alert_policy: AlertPolicy::EveryChange,
            summary_enabled: true,
            active: true,
            visibility: Visibility::Private,
            folder_id: None,
            current_state: None,
            last_alert_state: None,
            last_scrape_at: None,
            last_scrape_end: None,
            last_error: None,
            consecutive_errors: 0,
            created_at: Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
        }
    }

    fn make_event(target: &Target, summary: Option<&str>) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            target_id: target.id,
            ts: Utc.with_ymd_and_hms(2026, 5, 2, 9, 30, 0).unwrap(),
            title: target.name.clone(),
            description: "status: closed → open".to_string(),
            permalink: target.url.clone(),
            summary: summary.map(|s| s.to_string()),
            prior_state: StateMap::new(),
            current_state: BTreeMap::from([("status".to_string(), "open".to_string())]),
            fingerprint: "abcd000011112222".to_string(),
        }
    }

    #[test]
    fn feed_carries_channel_metadata_and_items() {
        let target = make_target();
        let event = make_event(&target, None);
        let xml = render_feed(&target, &[event.clone()]);

        assert!(xml.contains("<title>ticket page</title>"));
        assert!(xml.contains("<link>https://example.com/tickets</link>"));
        assert!(xml.contains("<description>watching ticket status</description>"));
        assert!(xml.contains(&event.ts.to_rfc2822()));
        assert!(xml.contains(&event.id.to_string()));
        assert!(xml.contains("isPermaLink=\"false\""));
    }

    #[test]
    fn summary_replaces_key_change_lines_when_present() {
        let target = make_target();
        let event = make_event(&target, Some("Tickets went on sale."));
        let xml = render_feed(&target, &[event]);

        assert!(xml.contains("Tickets went on sale."));
        assert!(!xml.contains("status: closed"));
    }

    #[test]
    fn description_markup_is_escaped() {
        let target = make_target();
        let mut event = make_event(&target, None);
        event.description = "status: <b>open</b> & loud".to_string();
        let xml = render_feed(&target, &[event]);

        assert!(!xml.contains("<b>open</b>"));
        assert!(xml.contains("&lt;b&gt;") || xml.contains("<![CDATA["));
    }

    #[test]
    fn last_build_date_is_max_of_events_and_creation() {
        let target = make_target();

        let empty = render_feed(&target, &[]);
        assert!(empty.contains(&target.created_at.to_rfc2822()));

        let event = make_event(&target, None);
        let with_event = render_feed(&target, &[event.clone()]);
        assert!(with_event.contains(&event.ts.to_rfc2822()));
    }

    #[test]
    fn cache_version_gates_entries() {
        let cache = FeedCache::new();
        let id = Uuid::new_v4();

        assert_eq!(cache.version(id), 0);
        cache.put(id, 0, "<rss/>".to_string());
        assert_eq!(cache.get(id, 0).as_deref(), Some("<rss/>"));

        cache.bump(id);
        assert_eq!(cache.version(id), 1);
        assert!(cache.get(id, 1).is_none(), "stale entry is not served");

        cache.evict(id);
        assert_eq!(cache.version(id), 0);
    }
}

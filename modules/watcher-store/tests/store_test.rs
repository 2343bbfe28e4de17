//! Integration tests for the Store.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use uuid::Uuid;

use watcher_common::{
    AlertPolicy, ExtractionConfig, Interval, KeySpec, Normalize, StateMap, Visibility,
};
use watcher_store::{EventCursor, InsertOutcome, NewChangeEvent, NewTarget, Store};

/// Get a migrated test store, or skip if no test DB is available.
async fn test_store() -> Option<Store> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let store = Store::connect(&url).await.ok()?;
    store.migrate().await.ok()?;
    Some(store)
}

fn unique_email() -> String {
    format!("{}@example.test", Uuid::new_v4().simple())
}

fn status_config() -> ExtractionConfig {
    let mut keys = BTreeMap::new();
    keys.insert(
        "status".to_string(),
        KeySpec {
            locator: "#status".to_string(),
            normalize: Normalize::default(),
            alert_values: vec!["open".to_string()],
        },
    );
    ExtractionConfig { keys }
}

fn state(value: &str) -> StateMap {
    let mut map = StateMap::new();
    map.insert("status".to_string(), value.to_string());
    map
}

fn new_target(owner_id: Uuid, visibility: Visibility) -> NewTarget {
    NewTarget {
        owner_id,
        url: "https://example.com/tickets".to_string(),
        name: "ticket page".to_string(),
        description: "tickets".to_string(),
        config: status_config(),
        interval: Interval::Min15,
        alert_policy: AlertPolicy::EveryChange,
        summary_enabled: false,
        visibility,
        folder_id: None,
    }
}

fn change_event(target_id: Uuid, fingerprint: &str) -> NewChangeEvent {
    NewChangeEvent {
        target_id,
        ts: Utc::now(),
        title: "ticket page".to_string(),
        description: "status: closed → open".to_string(),
        permalink: "https://example.com/tickets".to_string(),
        prior_state: state("closed"),
        current_state: state("open"),
        fingerprint: fingerprint.to_string(),
    }
}

// =========================================================================
// Targets
// =========================================================================

#[tokio::test]
async fn targets_are_born_paused_and_round_trip() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();

    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();
    assert!(!target.active, "new targets start paused");
    assert_eq!(target.consecutive_errors, 0);
    assert!(target.current_state.is_none());

    store.set_target_active(target.id, true).await.unwrap();
    let fetched = store.get_target(target.id).await.unwrap().unwrap();
    assert!(fetched.active);
    assert_eq!(fetched.config, status_config());
    assert_eq!(fetched.interval, Interval::Min15);
    assert_eq!(fetched.alert_policy, AlertPolicy::EveryChange);
}

#[tokio::test]
async fn public_slugs_are_unique_across_owners() {
    let Some(store) = test_store().await else {
        return;
    };
    let slug = format!("launch-{}", Uuid::new_v4().simple());
    let a = store.create_principal(&unique_email()).await.unwrap();
    let b = store.create_principal(&unique_email()).await.unwrap();

    store
        .create_target(new_target(a.id, Visibility::Public(slug.clone())))
        .await
        .unwrap();
    let dup = store
        .create_target(new_target(b.id, Visibility::Public(slug.clone())))
        .await;
    assert!(dup.is_err(), "second public target with same slug must fail");

    let found = store.get_target_by_slug(&slug).await.unwrap().unwrap();
    assert_eq!(found.owner_id, a.id);
}

#[tokio::test]
async fn scrape_bookkeeping_resets_and_increments() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();

    let started = Utc::now();
    let finished = started + Duration::seconds(3);

    let count = store
        .record_scrape_failure(target.id, "dns failure", started, finished)
        .await
        .unwrap();
    assert_eq!(count, 1);
    let count = store
        .record_scrape_failure(target.id, "dns failure", started, finished)
        .await
        .unwrap();
    assert_eq!(count, 2, "failures strictly increase the counter");

    store
        .record_scrape_success(target.id, &state("closed"), started, finished)
        .await
        .unwrap();
    let fetched = store.get_target(target.id).await.unwrap().unwrap();
    assert_eq!(fetched.consecutive_errors, 0, "success resets the counter");
    assert!(fetched.last_error.is_none());
    assert_eq!(fetched.current_state, Some(state("closed")));
    assert_eq!(fetched.last_scrape_end, Some(finished));
}

#[tokio::test]
async fn config_update_clears_the_baseline() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();
    store
        .record_scrape_success(target.id, &state("closed"), Utc::now(), Utc::now())
        .await
        .unwrap();

    store
        .update_target_config(target.id, &ExtractionConfig::fallback())
        .await
        .unwrap();
    let fetched = store.get_target(target.id).await.unwrap().unwrap();
    assert!(fetched.current_state.is_none());
    assert!(fetched.last_alert_state.is_none());
}

// =========================================================================
// Events: idempotent insertion, ordering, pagination
// =========================================================================

#[tokio::test]
async fn duplicate_fingerprint_within_window_inserts_once() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();

    let event = change_event(target.id, "aaaa000011112222");
    let first = store.insert_event(&event, 60).await.unwrap();
    let second = store.insert_event(&event, 60).await.unwrap();

    assert!(matches!(first, InsertOutcome::Inserted(_)));
    assert_eq!(second, InsertOutcome::Duplicate);

    let events = store.list_events(target.id, None, 10).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn concurrent_duplicate_inserts_yield_one_row() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();

    let event = change_event(target.id, "bbbb000011112222");
    let (a, b) = tokio::join!(
        store.insert_event(&event, 60),
        store.insert_event(&event, 60)
    );
    let inserted = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|o| matches!(o, InsertOutcome::Inserted(_)))
        .count();
    assert_eq!(inserted, 1, "exactly one concurrent insert wins");
}

#[tokio::test]
async fn distinct_fingerprints_both_insert() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();

    let open = change_event(target.id, "cccc000011112222");
    let mut closed = change_event(target.id, "dddd000011112222");
    closed.description = "status: open → closed".to_string();

    assert!(matches!(
        store.insert_event(&open, 60).await.unwrap(),
        InsertOutcome::Inserted(_)
    ));
    assert!(matches!(
        store.insert_event(&closed, 60).await.unwrap(),
        InsertOutcome::Inserted(_)
    ));
}

#[tokio::test]
async fn events_list_newest_first_with_keyset_cursor() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();

    let base = Utc::now() - Duration::minutes(30);
    for i in 0..5 {
        let mut event = change_event(target.id, &format!("fp{i:014}"));
        event.ts = base + Duration::minutes(i * 5);
        store.insert_event(&event, 60).await.unwrap();
    }

    let page1 = store.list_events(target.id, None, 3).await.unwrap();
    assert_eq!(page1.len(), 3);
    assert!(page1[0].ts > page1[2].ts, "newest first");

    let cursor = EventCursor {
        ts: page1[2].ts,
        id: page1[2].id,
    };
    let page2 = store.list_events(target.id, Some(cursor), 3).await.unwrap();
    assert_eq!(page2.len(), 2);
    assert!(page2[0].ts < page1[2].ts);
}

#[tokio::test]
async fn summary_is_patched_after_insert() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();

    store
        .insert_event(&change_event(target.id, "eeee000011112222"), 60)
        .await
        .unwrap();
    let event = &store.list_events(target.id, None, 1).await.unwrap()[0];
    assert!(event.summary.is_none(), "summary is never set on insert");

    store
        .set_event_summary(event.id, "Tickets went on sale.")
        .await
        .unwrap();
    let patched = store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(patched.summary.as_deref(), Some("Tickets went on sale."));
}

// =========================================================================
// Subscriptions and audience
// =========================================================================

#[tokio::test]
async fn owners_cannot_subscribe_to_their_own_target() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let slug = format!("own-{}", Uuid::new_v4().simple());
    let target = store
        .create_target(new_target(owner.id, Visibility::Public(slug)))
        .await
        .unwrap();

    assert!(store.subscribe(owner.id, target.id).await.is_err());
    assert!(!store.is_subscribed(owner.id, target.id).await.unwrap());
    assert!(store.is_audience(owner.id, target.id).await.unwrap());
}

#[tokio::test]
async fn private_targets_reject_subscriptions() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let reader = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();

    assert!(store.subscribe(reader.id, target.id).await.is_err());
}

#[tokio::test]
async fn duplicate_subscriptions_are_rejected() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let reader = store.create_principal(&unique_email()).await.unwrap();
    let slug = format!("dup-{}", Uuid::new_v4().simple());
    let target = store
        .create_target(new_target(owner.id, Visibility::Public(slug)))
        .await
        .unwrap();

    store.subscribe(reader.id, target.id).await.unwrap();
    assert!(store.subscribe(reader.id, target.id).await.is_err());
}

#[tokio::test]
async fn unsubscribe_keeps_events_and_read_states_for_the_owner() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let reader = store.create_principal(&unique_email()).await.unwrap();
    let slug = format!("bye-{}", Uuid::new_v4().simple());
    let target = store
        .create_target(new_target(owner.id, Visibility::Public(slug)))
        .await
        .unwrap();

    store.subscribe(reader.id, target.id).await.unwrap();
    store
        .insert_event(&change_event(target.id, "ffff000011112222"), 60)
        .await
        .unwrap();
    let event = &store.list_events(target.id, None, 1).await.unwrap()[0];
    store.mark_read(reader.id, event.id, true).await.unwrap();

    store.unsubscribe(reader.id, target.id).await.unwrap();

    assert!(!store.is_subscribed(reader.id, target.id).await.unwrap());
    let for_reader = store
        .list_events_for(reader.id, target.id, None, 10)
        .await
        .unwrap();
    assert!(for_reader.is_empty(), "ex-subscriber sees nothing");

    let for_owner = store
        .list_events_for(owner.id, target.id, None, 10)
        .await
        .unwrap();
    assert_eq!(for_owner.len(), 1, "the event survives for the owner");
}

// =========================================================================
// Read/star state and unread counts
// =========================================================================

#[tokio::test]
async fn mark_read_and_toggle_star_upsert() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();
    store
        .insert_event(&change_event(target.id, "1111000011112222"), 60)
        .await
        .unwrap();
    let event = &store.list_events(target.id, None, 1).await.unwrap()[0];

    store.mark_read(owner.id, event.id, true).await.unwrap();
    store.mark_read(owner.id, event.id, false).await.unwrap();

    assert!(store.toggle_star(owner.id, event.id).await.unwrap());
    assert!(!store.toggle_star(owner.id, event.id).await.unwrap());
}

#[tokio::test]
async fn unread_counts_cover_owned_and_subscribed() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let reader = store.create_principal(&unique_email()).await.unwrap();

    let folder = store.create_folder(owner.id, "shops", None).await.unwrap();
    let mut owned = new_target(owner.id, Visibility::Private);
    owned.folder_id = Some(folder.id);
    let owned = store.create_target(owned).await.unwrap();

    let slug = format!("pub-{}", Uuid::new_v4().simple());
    let public = store
        .create_target(new_target(owner.id, Visibility::Public(slug)))
        .await
        .unwrap();
    store.subscribe(reader.id, public.id).await.unwrap();

    for (target, fp) in [(&owned, "2222000011112222"), (&public, "3333000011112222")] {
        store
            .insert_event(&change_event(target.id, fp), 60)
            .await
            .unwrap();
    }

    // Owner: both targets unread, folder id carried for the owned one.
    let counts = store.unread_counts(owner.id).await.unwrap();
    assert_eq!(counts.len(), 2);
    let owned_row = counts.iter().find(|c| c.target_id == owned.id).unwrap();
    assert_eq!(owned_row.folder_id, Some(folder.id));
    assert_eq!(owned_row.unread, 1);

    // Reader: only the subscribed target, and marking read drains it.
    let counts = store.unread_counts(reader.id).await.unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].target_id, public.id);

    let event = &store.list_events(public.id, None, 1).await.unwrap()[0];
    store.mark_read(reader.id, event.id, true).await.unwrap();
    let counts = store.unread_counts(reader.id).await.unwrap();
    assert!(counts.is_empty());
}

// =========================================================================
// Cascade delete and retention
// =========================================================================

#[tokio::test]
async fn deleting_a_target_cascades_everything() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let reader = store.create_principal(&unique_email()).await.unwrap();
    let slug = format!("gone-{}", Uuid::new_v4().simple());
    let target = store
        .create_target(new_target(owner.id, Visibility::Public(slug)))
        .await
        .unwrap();

    store.subscribe(reader.id, target.id).await.unwrap();
    store
        .insert_event(&change_event(target.id, "4444000011112222"), 60)
        .await
        .unwrap();
    let event = &store.list_events(target.id, None, 1).await.unwrap()[0];
    store.mark_read(reader.id, event.id, true).await.unwrap();

    store.delete_target(target.id).await.unwrap();

    assert!(store.get_target(target.id).await.unwrap().is_none());
    assert!(store.get_event(event.id).await.unwrap().is_none());
    assert!(!store.is_subscribed(reader.id, target.id).await.unwrap());
    assert!(store.unread_counts(reader.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn retention_trims_only_old_events() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let target = store
        .create_target(new_target(owner.id, Visibility::Private))
        .await
        .unwrap();

    let mut old = change_event(target.id, "5555000011112222");
    old.ts = Utc::now() - Duration::days(120);
    store.insert_event(&old, 60).await.unwrap();
    store
        .insert_event(&change_event(target.id, "6666000011112222"), 60)
        .await
        .unwrap();

    let trimmed = store
        .trim_events_before(Utc::now() - Duration::days(90))
        .await
        .unwrap();
    assert!(trimmed >= 1);

    let remaining = store.list_events(target.id, None, 10).await.unwrap();
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn folder_deletion_detaches_targets() {
    let Some(store) = test_store().await else {
        return;
    };
    let owner = store.create_principal(&unique_email()).await.unwrap();
    let folder = store.create_folder(owner.id, "detach", None).await.unwrap();
    let mut target = new_target(owner.id, Visibility::Private);
    target.folder_id = Some(folder.id);
    let target = store.create_target(target).await.unwrap();

    store.delete_folder(folder.id).await.unwrap();
    let fetched = store.get_target(target.id).await.unwrap().unwrap();
    assert_eq!(fetched.folder_id, None, "target survives folder deletion");
}

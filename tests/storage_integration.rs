//! Integration tests for the SQLite storage implementation: lifecycle
//! rules, cascades, grouped counts, and keyset pagination.

use chrono::Utc;
use std::sync::Arc;

use shunt::models::{LinkStatus, NewClickRecord, NewShortLink, UtmParams};
use shunt::storage::{
    DateWindow, Dimension, Scope, SqliteStorage, Storage, StorageError,
};

async fn test_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

fn new_link(slug: &str, owner: &str) -> NewShortLink {
    NewShortLink {
        slug: slug.to_string(),
        original_url: "https://a.test/".to_string(),
        owner_id: owner.to_string(),
        password_hash: None,
        expires_at: None,
        utm: UtmParams::default(),
    }
}

fn today_window() -> DateWindow {
    let today = Utc::now().date_naive();
    DateWindow::new(today, today)
}

fn click(url_id: i64, owner: &str) -> NewClickRecord {
    NewClickRecord {
        url_id,
        owner_id: owner.to_string(),
        created_at: Utc::now().timestamp(),
        ..Default::default()
    }
}

#[tokio::test]
async fn duplicate_slug_is_a_conflict() {
    let storage = test_storage().await;
    storage.create_link(new_link("promo", "acme")).await.unwrap();

    let result = storage.create_link(new_link("promo", "other")).await;
    assert!(matches!(result, Err(StorageError::Conflict)));
}

#[tokio::test]
async fn status_update_round_trips() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("promo", "acme")).await.unwrap();

    assert!(storage
        .set_link_status(link.id, LinkStatus::Inactive)
        .await
        .unwrap());
    let stored = storage.get_link(link.id).await.unwrap().unwrap();
    assert_eq!(stored.status, LinkStatus::Inactive);

    // Unknown id reports no change.
    assert!(!storage
        .set_link_status(9999, LinkStatus::Active)
        .await
        .unwrap());
}

#[tokio::test]
async fn creating_a_variant_marks_the_link_as_split_tested() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("split", "acme")).await.unwrap();
    assert!(!link.is_ab_test);

    storage
        .create_variant(link.id, "https://a.test/b", 50)
        .await
        .unwrap();
    let stored = storage.get_link(link.id).await.unwrap().unwrap();
    assert!(stored.is_ab_test);
}

#[tokio::test]
async fn deleting_the_last_variant_clears_the_split_flag() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("split", "acme")).await.unwrap();
    let v1 = storage
        .create_variant(link.id, "https://a.test/b", 50)
        .await
        .unwrap();
    let v2 = storage
        .create_variant(link.id, "https://a.test/c", 30)
        .await
        .unwrap();

    assert!(storage.delete_variant(v1.id).await.unwrap());
    let stored = storage.get_link(link.id).await.unwrap().unwrap();
    assert!(stored.is_ab_test);

    assert!(storage.delete_variant(v2.id).await.unwrap());
    let stored = storage.get_link(link.id).await.unwrap().unwrap();
    assert!(!stored.is_ab_test);
}

#[tokio::test]
async fn variant_weight_outside_bounds_is_rejected() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("split", "acme")).await.unwrap();

    assert!(storage
        .create_variant(link.id, "https://a.test/b", 101)
        .await
        .is_err());
    assert!(storage
        .create_variant(link.id, "https://a.test/b", -1)
        .await
        .is_err());

    // A rejected variant must not flip the split flag.
    let stored = storage.get_link(link.id).await.unwrap().unwrap();
    assert!(!stored.is_ab_test);
}

#[tokio::test]
async fn routing_rule_attribution_round_trips() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("smart", "acme")).await.unwrap();
    assert!(!link.is_smart_routing);

    storage
        .insert_click(NewClickRecord {
            routing_rule_id: Some(42),
            ..click(link.id, "acme")
        })
        .await
        .unwrap();

    let rows = storage
        .load_clicks(&Scope::Link(link.id), &today_window())
        .await
        .unwrap();
    assert_eq!(rows[0].routing_rule_id, Some(42));
}

#[tokio::test]
async fn deleting_a_link_cascades_to_clicks_and_variants() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("promo", "acme")).await.unwrap();
    storage
        .create_variant(link.id, "https://a.test/b", 50)
        .await
        .unwrap();
    storage.insert_click(click(link.id, "acme")).await.unwrap();

    assert!(storage.delete_link(link.id).await.unwrap());

    assert!(storage.get_link(link.id).await.unwrap().is_none());
    assert!(storage.active_variants(link.id).await.unwrap().is_empty());
    assert_eq!(
        storage
            .count_clicks(&Scope::Link(link.id), &today_window())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn increments_are_atomic_updates() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("promo", "acme")).await.unwrap();

    for _ in 0..5 {
        storage.increment_link_clicks(link.id).await.unwrap();
    }
    let stored = storage.get_link(link.id).await.unwrap().unwrap();
    assert_eq!(stored.click_count, 5);
}

#[tokio::test]
async fn grouped_counts_order_and_coalesce_missing_values() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("promo", "acme")).await.unwrap();

    for country in ["Germany", "Germany", "France", "France", "Albania"] {
        storage
            .insert_click(NewClickRecord {
                country: Some(country.to_string()),
                ..click(link.id, "acme")
            })
            .await
            .unwrap();
    }
    // A click with no geo data groups under "Unknown".
    storage.insert_click(click(link.id, "acme")).await.unwrap();

    let rows = storage
        .grouped_counts(&Scope::Link(link.id), &today_window(), Dimension::Country, 10)
        .await
        .unwrap();

    // Count descending, then value ascending for ties.
    assert_eq!(
        rows,
        vec![
            ("France".to_string(), 2),
            ("Germany".to_string(), 2),
            ("Albania".to_string(), 1),
            ("Unknown".to_string(), 1),
        ]
    );
}

#[tokio::test]
async fn owner_scope_spans_links() {
    let storage = test_storage().await;
    let a = storage.create_link(new_link("one", "acme")).await.unwrap();
    let b = storage.create_link(new_link("two", "acme")).await.unwrap();
    let other = storage.create_link(new_link("three", "rival")).await.unwrap();

    storage.insert_click(click(a.id, "acme")).await.unwrap();
    storage.insert_click(click(b.id, "acme")).await.unwrap();
    storage.insert_click(click(other.id, "rival")).await.unwrap();

    let scope = Scope::Owner("acme".to_string());
    assert_eq!(storage.count_clicks(&scope, &today_window()).await.unwrap(), 2);
}

#[tokio::test]
async fn clicks_page_is_keyset_paginated() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("promo", "acme")).await.unwrap();
    for _ in 0..7 {
        storage.insert_click(click(link.id, "acme")).await.unwrap();
    }

    let scope = Scope::Link(link.id);
    let window = today_window();

    let first = storage.clicks_page(&scope, &window, 0, 3).await.unwrap();
    assert_eq!(first.len(), 3);

    let after = first.last().unwrap().id;
    let second = storage.clicks_page(&scope, &window, after, 3).await.unwrap();
    assert_eq!(second.len(), 3);
    assert!(second.iter().all(|c| c.id > after));

    let third_after = second.last().unwrap().id;
    let third = storage
        .clicks_page(&scope, &window, third_after, 3)
        .await
        .unwrap();
    assert_eq!(third.len(), 1);
}

#[tokio::test]
async fn variant_counts_exclude_bot_clicks() {
    let storage = test_storage().await;
    let link = storage.create_link(new_link("split", "acme")).await.unwrap();
    let variant = storage
        .create_variant(link.id, "https://a.test/b", 50)
        .await
        .unwrap();

    storage
        .insert_click(NewClickRecord {
            variant_id: Some(variant.id),
            ..click(link.id, "acme")
        })
        .await
        .unwrap();
    storage
        .insert_click(NewClickRecord {
            variant_id: Some(variant.id),
            is_bot: true,
            bot_name: Some("Googlebot".into()),
            ..click(link.id, "acme")
        })
        .await
        .unwrap();
    storage.insert_click(click(link.id, "acme")).await.unwrap();

    let counts = storage
        .variant_counts(link.id, &today_window())
        .await
        .unwrap();

    let variant_clicks = counts
        .iter()
        .find(|(id, _)| *id == Some(variant.id))
        .map(|(_, n)| *n);
    let control_clicks = counts.iter().find(|(id, _)| id.is_none()).map(|(_, n)| *n);
    assert_eq!(variant_clicks, Some(1));
    assert_eq!(control_clicks, Some(1));
}

#[tokio::test]
async fn inactive_webhooks_are_not_returned_for_dispatch() {
    let storage = test_storage().await;
    storage
        .create_webhook("https://a.test/hook", "s", &["link.clicked"])
        .await
        .unwrap();
    storage
        .create_webhook("https://b.test/hook", "s", &["link.deleted"])
        .await
        .unwrap();

    let subscribed = storage
        .active_webhooks_for_event("link.clicked")
        .await
        .unwrap();
    assert_eq!(subscribed.len(), 1);
    assert_eq!(subscribed[0].url, "https://a.test/hook");
}

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_api::hub::{Client, Event, EventKind, MemoryEventStore};

use common::{is_presence, next_event, wait_until};

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn presence_online_and_offline_fire_once_per_transition() {
    let t = common::test_hub();
    let hub = t.hub();
    let ws = common::workspace_id();
    let (u1, watcher, sentinel) = (common::user_id(), common::user_id(), common::user_id());

    let (w, mut rx) = Client::new(&ws, &watcher, 64);
    hub.register(w).await.unwrap();
    common::events_until(&mut rx, |e| is_presence(e, &watcher, "online")).await;

    // Two connections for the same user.
    let (a, _ra) = Client::new(&ws, &u1, 64);
    let (b, _rb) = Client::new(&ws, &u1, 64);
    let (ha, hb) = (a.handle(), b.handle());
    hub.register(a).await.unwrap();
    hub.register(b).await.unwrap();

    // The sentinel's online event is ordered after both registrations.
    let (s, _rs) = Client::new(&ws, &sentinel, 64);
    let hs = s.handle();
    hub.register(s).await.unwrap();
    let seen = common::events_until(&mut rx, |e| is_presence(e, &sentinel, "online")).await;
    let online: Vec<_> = seen.iter().filter(|e| is_presence(e, &u1, "online")).collect();
    assert_eq!(online.len(), 1);
    assert!(hub.is_user_online(&ws, &u1));

    // Closing one connection keeps the user online.
    hub.unregister(ha).await.unwrap();
    hub.unregister(hb.clone()).await.unwrap();
    hub.unregister(hs).await.unwrap();
    let seen = common::events_until(&mut rx, |e| is_presence(e, &sentinel, "offline")).await;
    let offline: Vec<_> = seen.iter().filter(|e| is_presence(e, &u1, "offline")).collect();
    assert_eq!(offline.len(), 1);
    assert!(!hub.is_user_online(&ws, &u1));

    // Removing an already-removed connection changes nothing.
    hub.unregister(hb).await.unwrap();
    hub.broadcast_to_workspace(&ws, common::message("marker"));
    let seen = common::events_until(&mut rx, |e| e.kind == EventKind::MessageNew).await;
    assert!(seen.iter().all(|e| e.kind != EventKind::PresenceChanged));
}

#[tokio::test]
async fn concurrent_registrations_announce_online_once() {
    let t = common::test_hub();
    let hub = t.hub().clone();
    let ws = common::workspace_id();
    let (u1, watcher, sentinel) = (common::user_id(), common::user_id(), common::user_id());

    let (w, mut rx) = Client::new(&ws, &watcher, 256);
    hub.register(w).await.unwrap();
    common::events_until(&mut rx, |e| is_presence(e, &watcher, "online")).await;

    let mut tasks = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..20 {
        let (client, crx) = Client::new(&ws, &u1, 8);
        receivers.push(crx);
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move { hub.register(client).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let (s, _rs) = Client::new(&ws, &sentinel, 8);
    hub.register(s).await.unwrap();
    let seen = common::events_until(&mut rx, |e| is_presence(e, &sentinel, "online")).await;
    assert_eq!(seen.iter().filter(|e| is_presence(e, &u1, "online")).count(), 1);
    assert_eq!(hub.connection_count(), 22);
}

#[tokio::test]
async fn presence_is_scoped_to_the_workspace() {
    let t = common::test_hub();
    let hub = t.hub();
    let (ws1, ws2) = (common::workspace_id(), common::workspace_id());
    let (u1, u2) = (common::user_id(), common::user_id());

    let (other, mut other_rx) = Client::new(&ws2, &u2, 64);
    hub.register(other).await.unwrap();
    common::events_until(&mut other_rx, |e| is_presence(e, &u2, "online")).await;

    let (c, _rc) = Client::new(&ws1, &u1, 64);
    hub.register(c).await.unwrap();
    wait_until(|| hub.is_user_online(&ws1, &u1)).await;

    hub.broadcast_to_workspace(&ws2, common::message("marker"));
    let seen = common::events_until(&mut other_rx, |e| e.kind == EventKind::MessageNew).await;
    assert_eq!(seen.len(), 1);
    assert!(!hub.is_user_online(&ws2, &u1));
}

#[tokio::test]
async fn unregister_closes_the_connection_queue() {
    let t = common::test_hub();
    let hub = t.hub();
    let ws = common::workspace_id();
    let u1 = common::user_id();

    let (c, mut rx) = Client::new(&ws, &u1, 64);
    let handle = c.handle();
    hub.register(c).await.unwrap();
    wait_until(|| hub.is_user_online(&ws, &u1)).await;

    hub.unregister(handle).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "queue was not closed after unregister");
}

#[tokio::test]
async fn connected_user_ids_lists_distinct_users() {
    let t = common::test_hub();
    let hub = t.hub();
    let ws = common::workspace_id();
    let (u1, u2) = (common::user_id(), common::user_id());

    let mut keep = Vec::new();
    for user in [&u1, &u1, &u2] {
        let (c, rx) = Client::new(&ws, user.as_str(), 64);
        keep.push(rx);
        hub.register(c).await.unwrap();
    }
    wait_until(|| hub.connection_count() == 3).await;

    let mut users = hub.connected_user_ids(&ws);
    users.sort();
    let mut expected = vec![u1, u2];
    expected.sort();
    assert_eq!(users, expected);
}

// ---------------------------------------------------------------------------
// Forced disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_user_clients_signals_transports() {
    let t = common::test_hub();
    let hub = t.hub();
    let ws = common::workspace_id();
    let (u1, u2) = (common::user_id(), common::user_id());

    let (a, _ra) = Client::new(&ws, &u1, 64);
    let (b, _rb) = Client::new(&ws, &u1, 64);
    let (c, _rc) = Client::new(&ws, &u2, 64);
    let (ha, hb, hc) = (a.handle(), b.handle(), c.handle());
    for client in [a, b, c] {
        hub.register(client).await.unwrap();
    }
    wait_until(|| hub.connection_count() == 3).await;

    hub.disconnect_user_clients(&ws, &u1);
    tokio::time::timeout(Duration::from_secs(1), async {
        ha.disconnected().await;
        hb.disconnected().await;
    })
    .await
    .expect("user connections were not signalled");
    assert!(!hc.is_disconnected());

    // Still registered until each transport unregisters.
    assert!(hub.is_user_online(&ws, &u1));
    hub.unregister(ha).await.unwrap();
    hub.unregister(hb).await.unwrap();
    wait_until(|| !hub.is_user_online(&ws, &u1)).await;
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_replays_missed_events_in_order() {
    let t = common::test_hub();
    let hub = t.hub();
    let ws = common::workspace_id();
    let u1 = common::user_id();

    let (c, mut rx) = Client::new(&ws, &u1, 64);
    let handle = c.handle();
    hub.register(c).await.unwrap();
    wait_until(|| hub.is_user_online(&ws, &u1)).await;

    let first = hub.broadcast_to_workspace(&ws, common::message("first"));
    let seen = common::events_until(&mut rx, |e| e.id == first).await;
    let last_seen = seen.last().unwrap().id.clone();

    hub.unregister(handle).await.unwrap();
    wait_until(|| !hub.is_user_online(&ws, &u1)).await;

    let second = hub.broadcast_to_workspace(&ws, common::message("second"));
    let third = hub.broadcast_to_workspace(&ws, common::message("third"));
    wait_until(|| t.store.contains(&ws, &third)).await;

    let replayed = hub.get_events_since(&ws, &last_seen).await.unwrap();
    let ids: Vec<_> = replayed
        .iter()
        .filter(|e| e.kind == EventKind::MessageNew)
        .map(|e| e.id.clone())
        .collect();
    assert_eq!(ids, vec![second, third]);
    assert!(replayed.iter().all(|e| e.id > last_seen));
}

#[tokio::test]
async fn replay_of_fixed_ids_excludes_cursor() {
    let store = Arc::new(MemoryEventStore::new());
    let ws = common::workspace_id();
    let now = Utc::now();
    for id in ["01H000", "01H001", "01H002"] {
        store.insert_at(
            &ws,
            Event::with_id(id, EventKind::MessageNew, serde_json::json!({})),
            now,
        );
    }
    let t = common::test_hub_with(common::test_config(), store);

    let events = t.hub().get_events_since(&ws, "01H000").await.unwrap();
    let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["01H001", "01H002"]);
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn startup_cleanup_purges_expired_events() {
    let store = Arc::new(MemoryEventStore::new());
    let ws = common::workspace_id();
    let now = Utc::now();
    store.insert_at(
        &ws,
        Event::with_id("01H000", EventKind::MessageNew, serde_json::json!({})),
        now - chrono::Duration::hours(25),
    );
    store.insert_at(
        &ws,
        Event::with_id("01H001", EventKind::MessageNew, serde_json::json!({})),
        now - chrono::Duration::hours(1),
    );

    let _t = common::test_hub_with(common::test_config(), store.clone());

    wait_until(|| !store.contains(&ws, "01H000")).await;
    assert!(store.contains(&ws, "01H001"));
}

#[tokio::test]
async fn zero_retention_disables_cleanup() {
    let store = Arc::new(MemoryEventStore::new());
    let ws = common::workspace_id();
    store.insert_at(
        &ws,
        Event::with_id("01H000", EventKind::MessageNew, serde_json::json!({})),
        Utc::now() - chrono::Duration::days(30),
    );

    let mut config = common::test_config();
    config.hub.event_retention = Duration::ZERO;
    let t = common::test_hub_with(config, store.clone());

    // Let the control loop start and process a registration.
    let (c, _rx) = Client::new(&ws, "usr_x", 8);
    t.hub().register(c).await.unwrap();
    wait_until(|| t.hub().connection_count() == 1).await;

    assert!(store.contains(&ws, "01H000"));
}

#[tokio::test]
async fn periodic_cleanup_runs_on_the_interval() {
    let store = Arc::new(MemoryEventStore::new());
    let ws = common::workspace_id();

    let mut config = common::test_config();
    config.hub.event_retention = Duration::from_secs(60);
    config.hub.cleanup_interval = Duration::from_millis(50);
    let _t = common::test_hub_with(config, store.clone());

    // Inserted after the startup pass; only the periodic pass can remove it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.insert_at(
        &ws,
        Event::with_id("01H000", EventKind::MessageNew, serde_json::json!({})),
        Utc::now() - chrono::Duration::minutes(5),
    );

    wait_until(|| !store.contains(&ws, "01H000")).await;
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_fails_after_shutdown() {
    let t = common::test_hub();
    let ws = common::workspace_id();
    t.shutdown.cancel();

    // The control loop drops its intake once it observes cancellation.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let (c, _rx) = Client::new(&ws, "usr_x", 8);
            if t.hub().register(c).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("register kept succeeding after shutdown");
}

#[tokio::test]
async fn full_queue_drops_without_affecting_other_connections() {
    let t = common::test_hub();
    let hub = t.hub();
    let ws = common::workspace_id();
    let (slow, fast) = (common::user_id(), common::user_id());

    let (s, mut srx) = Client::new(&ws, &slow, 2);
    let (f, mut frx) = Client::new(&ws, &fast, 64);
    hub.register(s).await.unwrap();
    hub.register(f).await.unwrap();
    wait_until(|| hub.connection_count() == 2).await;
    // Let presence traffic settle, then empty both queues.
    let _ = next_event(&mut frx).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    while srx.try_recv().is_ok() {}
    while frx.try_recv().is_ok() {}

    for i in 0..3 {
        hub.broadcast_to_workspace(&ws, common::message(&i.to_string()));
    }

    assert!(srx.try_recv().is_ok());
    assert!(srx.try_recv().is_ok());
    assert!(srx.try_recv().is_err());
    for _ in 0..3 {
        assert!(frx.try_recv().is_ok());
    }
}

//! End-to-end pipeline tests: poll, queue, persist, fan out

mod helpers;

use fleet_common::events::FleetEvent;
use fleet_sync::db::positions::{history_count, latest_position};
use fleet_sync::hub::protocol::ServerMessage;
use fleet_sync::provider::PositionsResponse;
use helpers::{build_state, test_db, FakeProvider};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_poll_cycle_persists_single_position() {
    let (_dir, pool) = test_db().await;
    let provider = Arc::new(FakeProvider::with(vec![Ok(PositionsResponse {
        records: vec![json!({"device_id": "D1", "lat": 10, "lon": 20, "speed": 0})],
        next_watermark: Some("T1".into()),
        ..Default::default()
    })]));
    let state = build_state(pool.clone(), provider.clone());

    let metrics = state.poller.force_sync().await;
    assert_eq!(metrics.positions_updated, 1);
    assert_eq!(state.batch.get_queue_size(), 1);

    let outcome = state.batch.process_batch().await.expect("batch should run");
    assert_eq!(outcome.persisted, 1);

    let stored = latest_position(&pool, "D1").await.unwrap().expect("position stored");
    assert_eq!(stored.device_id, "D1");
    assert_eq!(stored.latitude, 10.0);
    assert_eq!(stored.longitude, 20.0);
    assert_eq!(history_count(&pool, "D1").await.unwrap(), 1);

    let watermark = state.poller.get_watermark().await.unwrap();
    assert_eq!(watermark.last_query_time.as_deref(), Some("T1"));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_persisted_positions_reach_subscribed_clients() {
    let (_dir, pool) = test_db().await;
    let provider = Arc::new(FakeProvider::with(vec![Ok(PositionsResponse {
        records: vec![
            json!({"device_id": "A", "lat": 1.0, "lon": 1.0}),
            json!({"device_id": "B", "lat": 2.0, "lon": 2.0}),
        ],
        ..Default::default()
    })]));
    let state = build_state(pool, provider);

    let (only_a, mut rx_a) = state.hub.register().await;
    let (_all, mut rx_all) = state.hub.register().await;
    state.hub.subscribe(only_a, vec!["A".into()]).await;
    while rx_a.try_recv().is_ok() {}
    while rx_all.try_recv().is_ok() {}

    let mut events = state.event_bus.subscribe();
    state.poller.force_sync().await;
    state.batch.process_batch().await.expect("batch should run");

    // Forward the persisted event the way the hub listener does
    loop {
        match events.recv().await.unwrap() {
            FleetEvent::PositionsPersisted { positions, .. } => {
                for position in &positions {
                    state.hub.broadcast_position_update(position).await;
                }
                break;
            }
            _ => continue,
        }
    }

    let a_devices: Vec<String> = std::iter::from_fn(|| rx_a.try_recv().ok())
        .filter_map(|frame| match frame.message {
            ServerMessage::LivePositionUpdate { position } => Some(position.device_id),
            _ => None,
        })
        .collect();
    assert_eq!(a_devices, vec!["A"]);

    let all_count = std::iter::from_fn(|| rx_all.try_recv().ok()).count();
    assert_eq!(all_count, 2);
}

#[tokio::test]
async fn test_invalid_records_are_counted_not_queued() {
    let (_dir, pool) = test_db().await;
    let provider = Arc::new(FakeProvider::with(vec![Ok(PositionsResponse {
        records: vec![
            json!({"device_id": "", "lat": 1.0, "lon": 1.0}),
            json!({"device_id": "X", "lat": 1.0, "lon": 200.0}),
            json!({"lat": 1.0}),
        ],
        ..Default::default()
    })]));
    let state = build_state(pool, provider);

    let metrics = state.poller.force_sync().await;
    assert_eq!(metrics.invalid_records, 3);
    assert_eq!(metrics.positions_updated, 0);
    assert_eq!(metrics.errors, 0);
    assert_eq!(state.batch.get_queue_size(), 0);
}

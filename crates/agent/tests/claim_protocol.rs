#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use relay_agent::detect::{Channel, Detector};
use relay_agent::config::DetectionConfig;
use relay_agent::dispatch::Dispatched;
use relay_agent::gateway::memory::Mutation;
use relay_agent::gateway::{Gateway, MemoryGateway};
use relay_core::model::{ExecutionStatus, WorkItem};
use serde_json::json;

use common::{dispatcher, task, wait_until};

fn claims_for(gw: &MemoryGateway, item_id: &str) -> usize {
    gw.mutations_for(item_id)
        .iter()
        .filter(|m| matches!(m, Mutation::Claimed { .. }))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_claim_across_channels_and_destinations() {
    let gw = Arc::new(MemoryGateway::new());
    gw.put_task(task("t1", "single", json!({"command": "true"})));

    let mut items = Vec::new();
    for n in 0..20 {
        let item = WorkItem::pending("t1", n);
        gw.insert_item(&item).await.unwrap();
        items.push(item);
    }

    let a = dispatcher(&gw, "dest-a", Duration::ZERO);
    let b = dispatcher(&gw, "dest-b", Duration::ZERO);

    let mut attempts = Vec::new();
    for item in &items {
        for d in [&a, &b] {
            for channel in [Channel::Push, Channel::Poll] {
                let d = d.clone();
                let item = item.clone();
                attempts.push(tokio::spawn(async move { d.offer(item, channel).await }));
            }
        }
    }

    let mut started = 0;
    for attempt in attempts {
        if attempt.await.unwrap().unwrap() == Dispatched::Started {
            started += 1;
        }
    }
    assert_eq!(started, items.len());

    a.wait_idle().await;
    b.wait_idle().await;
    for item in &items {
        assert_eq!(claims_for(&gw, &item.id), 1, "item {}", item.id);
        let stored = gw.item(&item.id).unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(matches!(stored.destination_id.as_deref(), Some("dest-a") | Some("dest-b")));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_tick_detection_records_one_claim() {
    let gw = Arc::new(MemoryGateway::new());
    gw.put_task(task("t1", "single", json!({"command": "true"})));
    let mut item = WorkItem::pending("t1", 0);
    item.id = "e1".into();
    gw.insert_item(&item).await.unwrap();

    let d = dispatcher(&gw, "me", Duration::ZERO);
    let (push, poll) = tokio::join!(
        d.offer(item.clone(), Channel::Push),
        d.offer(item.clone(), Channel::Poll)
    );
    let mut outcomes = vec![push.unwrap(), poll.unwrap()];
    outcomes.sort_by_key(|o| *o == Dispatched::Started);
    assert_eq!(outcomes[1], Dispatched::Started);
    assert_ne!(outcomes[0], Dispatched::Started);

    d.wait_idle().await;
    let mutations = gw.mutations_for("e1");
    assert_eq!(claims_for(&gw, "e1"), 1);
    let claimed_transitions = mutations
        .iter()
        .filter(|m| matches!(m, Mutation::Claimed { destination_id, .. } if destination_id == "me"))
        .count();
    assert_eq!(claimed_transitions, 1);
    assert_eq!(
        mutations,
        vec![
            Mutation::Inserted { item_id: "e1".into() },
            Mutation::Claimed {
                item_id: "e1".into(),
                destination_id: "me".into()
            },
            Mutation::StatusUpdated {
                item_id: "e1".into(),
                status: ExecutionStatus::Running
            },
            Mutation::StatusUpdated {
                item_id: "e1".into(),
                status: ExecutionStatus::Completed
            },
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redetected_running_item_is_not_spawned_twice() {
    let gw = Arc::new(MemoryGateway::new());
    gw.put_task(task("t1", "single", json!({"command": "sleep 0.3"})));
    let item = WorkItem::pending("t1", 0);
    gw.insert_item(&item).await.unwrap();

    let d = dispatcher(&gw, "me", Duration::ZERO);
    assert_eq!(d.offer(item.clone(), Channel::Push).await.unwrap(), Dispatched::Started);
    assert!(d.is_executing(&item.id));

    // A stale snapshot from the poll channel still says pending.
    assert_eq!(d.offer(item.clone(), Channel::Poll).await.unwrap(), Dispatched::AlreadyExecuting);

    d.wait_idle().await;
    let runs = gw
        .mutations_for(&item.id)
        .into_iter()
        .filter(|m| matches!(m, Mutation::StatusUpdated { status: ExecutionStatus::Running, .. }))
        .count();
    assert_eq!(runs, 1);
    assert_eq!(gw.claim_calls(), 1);
    assert!(d.active().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_poll_drains_backlog_and_skips_foreign_assignments() {
    let gw = Arc::new(MemoryGateway::new());
    gw.put_task(task("t1", "single", json!({"command": "true"})));
    let open = WorkItem::pending("t1", 1);
    let mine = WorkItem::pending("t1", 2).assigned_to("me");
    let theirs = WorkItem::pending("t1", 3).assigned_to("them");
    for item in [&open, &mine, &theirs] {
        gw.insert_item(item).await.unwrap();
    }

    let d = dispatcher(&gw, "me", Duration::from_secs(30));
    let detector = Detector::new(gw.clone(), d.clone(), "me", DetectionConfig::default());
    assert_eq!(detector.poll_once().await, 2);
    d.wait_idle().await;

    assert_eq!(gw.item(&open.id).unwrap().status, ExecutionStatus::Completed);
    assert_eq!(gw.item(&mine.id).unwrap().status, ExecutionStatus::Completed);
    assert_eq!(gw.item(&theirs.id).unwrap().status, ExecutionStatus::Pending);
    assert!(gw.mutations_for(&theirs.id).iter().all(|m| matches!(m, Mutation::Inserted { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_push_listener_resubscribes_after_feed_drops() {
    let gw = Arc::new(MemoryGateway::new());
    gw.put_task(task("t1", "single", json!({"command": "true"})));

    let d = dispatcher(&gw, "me", Duration::ZERO);
    let config = DetectionConfig {
        backoff_initial_ms: 10,
        backoff_max_ms: 50,
        ..Default::default()
    };
    let detector = Arc::new(Detector::new(gw.clone(), d.clone(), "me", config));
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let push = {
        let detector = detector.clone();
        tokio::spawn(async move { detector.run_push(stop_rx).await })
    };

    assert!(wait_until(Duration::from_secs(2), || gw.subscriptions() == 1).await);
    let first = WorkItem::pending("t1", 0);
    gw.insert_item(&first).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            gw.item(&first.id).map(|i| i.status) == Some(ExecutionStatus::Completed)
        })
        .await
    );

    gw.disconnect_feeds();
    assert!(wait_until(Duration::from_secs(2), || gw.subscriptions() == 2).await);
    let second = WorkItem::pending("t1", 1);
    gw.insert_item(&second).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            gw.item(&second.id).map(|i| i.status) == Some(ExecutionStatus::Completed)
        })
        .await
    );

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), push).await.unwrap().unwrap();
    d.wait_idle().await;
}

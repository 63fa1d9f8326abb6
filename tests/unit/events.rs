//! Event bus tests across concurrent publishers and subscribers

use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use sidecar_injector::events::{EventBus, Kind, Message};

#[tokio::test]
async fn test_concurrent_publishers_reach_every_subscriber() {
    let bus = EventBus::new();
    let mut pods = bus.subscribe(&[Kind::PodAdded, Kind::PodUpdated]);
    let mut updates = bus.subscribe(&[Kind::PodUpdated]);

    let mut publishers = Vec::new();
    for i in 0..10 {
        let bus = bus.clone();
        let kind = if i % 2 == 0 { Kind::PodAdded } else { Kind::PodUpdated };
        publishers.push(tokio::spawn(async move {
            bus.publish(Message::new(kind).with_new(json!({ "i": i })))
                .await;
        }));
    }
    for publisher in publishers {
        publisher.await.unwrap();
    }

    let mut received = 0;
    while let Ok(msg) = pods.try_recv() {
        assert!(matches!(msg.kind, Kind::PodAdded | Kind::PodUpdated));
        received += 1;
    }
    assert_eq!(received, 10);

    let mut received = 0;
    while let Ok(msg) = updates.try_recv() {
        assert_eq!(msg.kind, Kind::PodUpdated);
        received += 1;
    }
    assert_eq!(received, 5);
}

#[tokio::test]
async fn test_no_replay_for_late_subscribers() {
    let bus = EventBus::new();
    let _early = bus.subscribe(&[Kind::ServiceAdded]);
    bus.publish(Message::new(Kind::ServiceAdded)).await;

    let mut late = bus.subscribe(&[Kind::ServiceAdded]);
    assert!(late.try_recv().is_err());

    bus.publish(Message::new(Kind::ServiceAdded)).await;
    assert_eq!(late.recv().await.unwrap().kind, Kind::ServiceAdded);
}

#[tokio::test]
async fn test_unsubscribe_while_flooded() {
    let bus = EventBus::with_capacity(2);
    let slow = bus.subscribe(&[Kind::EndpointUpdated]);
    let mut fast = bus.subscribe(&[Kind::EndpointUpdated]);

    // The slow subscriber never reads; publishers pile up behind it
    let publisher = {
        let bus = bus.clone();
        tokio::spawn(async move {
            for i in 0..5 {
                bus.publish(Message::new(Kind::EndpointUpdated).with_new(json!(i)))
                    .await;
            }
        })
    };

    assert_eq!(fast.recv().await.unwrap().new_obj, Some(json!(0)));
    timeout(Duration::from_secs(1), bus.unsubscribe(slow))
        .await
        .unwrap();

    // Once the slow subscriber is gone the rest flows to the fast one
    for i in 1..5 {
        let msg = timeout(Duration::from_secs(1), fast.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.new_obj, Some(json!(i)));
    }
    timeout(Duration::from_secs(1), publisher)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bus.subscriber_count(Kind::EndpointUpdated), 1);
}

#[tokio::test]
async fn test_kind_round_trips_through_text() {
    for kind in Kind::ALL {
        assert_eq!(kind.to_string().parse::<Kind>().unwrap(), kind);
    }
}

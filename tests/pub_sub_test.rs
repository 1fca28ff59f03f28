mod common;

use std::sync::Arc;

use anyhow::Error;
use wampcore::{
    core::{
        kernel::{
            Kernel,
            KernelConfig,
        },
        types::{
            Dictionary,
            Integer,
            List,
            Value,
        },
        uri::Uri,
    },
    peer::{
        Event,
        PeerConfig,
        RawSocketPeer,
        Subscription,
        new_raw_socket_peer,
    },
    router::{
        RealmConfig,
        RouterConfig,
        RouterHandle,
        new_raw_socket_router,
    },
};

const REALM: &str = "default_realm";

async fn start_router(kernel: Arc<Kernel>) -> Result<RouterHandle, Error> {
    let mut config = RouterConfig::default();
    config.realms.push(RealmConfig {
        name: "default".to_owned(),
        uri: Uri::try_from(REALM)?,
    });
    let router = new_raw_socket_router(kernel, config)?;
    let handle = router.start().await?;
    Ok(handle)
}

fn create_peer(kernel: Arc<Kernel>, agent: &str) -> Result<RawSocketPeer, Error> {
    let mut config = PeerConfig::default();
    config.name = agent.to_owned();
    config.agent = agent.to_owned();
    new_raw_socket_peer(kernel, config)
}

#[tokio::test]
async fn peer_receives_published_messages_for_topic_in_order() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let publisher = create_peer(kernel.clone(), "publisher").unwrap();
    let subscriber = create_peer(kernel.clone(), "subscriber").unwrap();

    assert_matches::assert_matches!(
        publisher
            .connect(&router_handle.local_addr().to_string())
            .await,
        Ok(())
    );
    assert_matches::assert_matches!(publisher.join_realm(REALM).await, Ok(_));

    assert_matches::assert_matches!(
        subscriber
            .connect(&router_handle.local_addr().to_string())
            .await,
        Ok(())
    );
    assert_matches::assert_matches!(subscriber.join_realm(REALM).await, Ok(_));

    let subscription = subscriber
        .subscribe(Uri::try_from("coin_toss").unwrap())
        .await
        .unwrap();
    let subscription_id = subscription.id;

    async fn receive_events(mut subscription: Subscription) {
        let mut received = Vec::new();
        while received.len() < 5 {
            let event = subscription.event_rx.recv().await;
            assert_matches::assert_matches!(event, Ok(event) => {
                assert_matches::assert_matches!(event.arguments.first(), Some(Value::Integer(i)) => {
                    received.push(*i);
                    pretty_assertions::assert_eq!(
                        event.arguments_keyword,
                        Dictionary::from_iter([("index".to_owned(), Value::Integer(*i))])
                    );
                });
            });
        }

        // Within one topic, events arrive in publish order.
        pretty_assertions::assert_eq!(received, Vec::from_iter(0..5 as Integer));
    }

    let subscribe_handle = tokio::spawn(receive_events(subscription));

    for i in 0..5 as Integer {
        assert_matches::assert_matches!(
            publisher
                .publish(
                    Uri::try_from("coin_toss").unwrap(),
                    Event {
                        arguments: List::from_iter([Value::Integer(i)]),
                        arguments_keyword: Dictionary::from_iter([(
                            "index".to_owned(),
                            Value::Integer(i)
                        )]),
                    },
                )
                .await,
            Ok(_)
        );
    }

    assert_matches::assert_matches!(subscribe_handle.await, Ok(()));

    assert_matches::assert_matches!(subscriber.unsubscribe(subscription_id).await, Ok(()));
}

#[tokio::test]
async fn coin_toss_round_trip_delivers_heads_then_tails() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let publisher = create_peer(kernel.clone(), "s1").unwrap();
    let subscriber = create_peer(kernel.clone(), "s2").unwrap();

    publisher
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    publisher.join_realm(REALM).await.unwrap();
    subscriber
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    subscriber.join_realm(REALM).await.unwrap();

    let mut subscription = subscriber
        .subscribe(Uri::try_from("coin_toss").unwrap())
        .await
        .unwrap();

    for side in ["heads", "tails"] {
        publisher
            .publish(
                Uri::try_from("coin_toss").unwrap(),
                Event {
                    arguments: List::from_iter([Value::String(side.to_owned())]),
                    arguments_keyword: Dictionary::default(),
                },
            )
            .await
            .unwrap();
    }

    assert_matches::assert_matches!(subscription.event_rx.recv().await, Ok(event) => {
        assert_eq!(event.arguments, List::from_iter([Value::String("heads".to_owned())]));
    });
    assert_matches::assert_matches!(subscription.event_rx.recv().await, Ok(event) => {
        assert_eq!(event.arguments, List::from_iter([Value::String("tails".to_owned())]));
    });
}

#[tokio::test]
async fn late_subscriber_receives_last_published_payload() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let publisher = create_peer(kernel.clone(), "publisher").unwrap();
    let late_subscriber = create_peer(kernel.clone(), "late_subscriber").unwrap();

    publisher
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    publisher.join_realm(REALM).await.unwrap();

    let publication_id = publisher
        .publish(
            Uri::try_from("com.example.status").unwrap(),
            Event {
                arguments: List::from_iter([Value::String("ready".to_owned())]),
                arguments_keyword: Dictionary::default(),
            },
        )
        .await
        .unwrap();

    late_subscriber
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    late_subscriber.join_realm(REALM).await.unwrap();

    // The retained payload arrives as the subscription's first event.
    let mut subscription = late_subscriber
        .subscribe(Uri::try_from("com.example.status").unwrap())
        .await
        .unwrap();
    assert_matches::assert_matches!(subscription.event_rx.recv().await, Ok(event) => {
        assert_eq!(event.publication_id, publication_id);
        assert_eq!(event.arguments, List::from_iter([Value::String("ready".to_owned())]));
    });
}

#[tokio::test]
async fn unsubscribing_closes_the_event_stream() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let subscriber = create_peer(kernel.clone(), "subscriber").unwrap();

    subscriber
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    subscriber.join_realm(REALM).await.unwrap();

    let mut subscription = subscriber
        .subscribe(Uri::try_from("com.example.topic").unwrap())
        .await
        .unwrap();
    subscriber.unsubscribe(subscription.id).await.unwrap();

    assert_matches::assert_matches!(
        subscription.event_rx.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Closed)
    );
}

#[tokio::test]
async fn subscribers_in_different_realms_are_isolated() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let mut config = RouterConfig::default();
    config.realms.push(RealmConfig {
        name: "default".to_owned(),
        uri: Uri::try_from(REALM).unwrap(),
    });
    config.realms.push(RealmConfig {
        name: "other".to_owned(),
        uri: Uri::try_from("other_realm").unwrap(),
    });
    let router_handle = new_raw_socket_router(kernel.clone(), config)
        .unwrap()
        .start()
        .await
        .unwrap();

    let publisher = create_peer(kernel.clone(), "publisher").unwrap();
    let subscriber = create_peer(kernel.clone(), "subscriber").unwrap();

    publisher
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    publisher.join_realm(REALM).await.unwrap();
    subscriber
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    subscriber.join_realm("other_realm").await.unwrap();

    let mut subscription = subscriber
        .subscribe(Uri::try_from("com.example.topic").unwrap())
        .await
        .unwrap();

    publisher
        .publish(
            Uri::try_from("com.example.topic").unwrap(),
            Event {
                arguments: List::from_iter([Value::Integer(1)]),
                arguments_keyword: Dictionary::default(),
            },
        )
        .await
        .unwrap();

    // Nothing crosses the realm boundary.
    assert_matches::assert_matches!(
        subscription.event_rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    );
}

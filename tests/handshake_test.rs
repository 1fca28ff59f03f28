mod common;

use std::sync::Arc;

use anyhow::Error;
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::TcpListener,
};
use wampcore::{
    core::{
        error::HandshakeError,
        hash::HashSet,
        kernel::{
            Kernel,
            KernelConfig,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    peer::{
        Event,
        PeerConfig,
        RawSocketPeer,
        new_raw_socket_peer,
    },
    router::{
        RealmConfig,
        RouterConfig,
        RouterHandle,
        new_raw_socket_router,
    },
    serializer::serializer::SerializerType,
};

const REALM: &str = "default_realm";

async fn start_router(
    kernel: Arc<Kernel>,
    configure: impl FnOnce(&mut RouterConfig),
) -> Result<RouterHandle, Error> {
    let mut config = RouterConfig::default();
    config.realms.push(RealmConfig {
        name: "default".to_owned(),
        uri: Uri::try_from(REALM)?,
    });
    configure(&mut config);
    let router = new_raw_socket_router(kernel, config)?;
    let handle = router.start().await?;
    Ok(handle)
}

fn create_peer(
    kernel: Arc<Kernel>,
    configure: impl FnOnce(&mut PeerConfig),
) -> Result<RawSocketPeer, Error> {
    let mut config = PeerConfig::default();
    configure(&mut config);
    new_raw_socket_peer(kernel, config)
}

#[tokio::test]
async fn bad_magic_reply_fails_the_handshake() {
    common::setup_test_environment();

    // A server that accepts TCP connections but does not speak rawsocket.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut offer = [0u8; 4];
        stream.read_exact(&mut offer).await.unwrap();
        stream.write_all(&[0xFF, 0x00, 0x00, 0x00]).await.unwrap();
    });

    let kernel = Kernel::new(KernelConfig::default());
    let peer = create_peer(kernel, |_| ()).unwrap();
    assert_matches::assert_matches!(peer.connect(&addr.to_string()).await, Err(err) => {
        assert_matches::assert_matches!(
            err.downcast_ref::<HandshakeError>(),
            Some(HandshakeError::BadMagic)
        );
    });
}

#[tokio::test]
async fn router_rejects_a_serializer_it_does_not_accept() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone(), |config| {
        config.serializers = HashSet::from_iter([SerializerType::MessagePack]);
    })
    .await
    .unwrap();

    let peer = create_peer(kernel.clone(), |config| {
        config.serializers = HashSet::from_iter([SerializerType::Json]);
    })
    .unwrap();
    assert_matches::assert_matches!(
        peer.connect(&router_handle.local_addr().to_string()).await,
        Err(err) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<HandshakeError>(),
                Some(HandshakeError::Rejected(1))
            );
        }
    );
}

#[tokio::test]
async fn message_pack_sessions_round_trip() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone(), |_| ()).await.unwrap();

    let publisher = create_peer(kernel.clone(), |config| {
        config.serializers = HashSet::from_iter([SerializerType::MessagePack]);
    })
    .unwrap();
    let subscriber = create_peer(kernel.clone(), |config| {
        config.serializers = HashSet::from_iter([SerializerType::MessagePack]);
    })
    .unwrap();

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
        .subscribe(Uri::try_from("com.example.topic").unwrap())
        .await
        .unwrap();
    publisher
        .publish(
            Uri::try_from("com.example.topic").unwrap(),
            Event {
                arguments: List::from_iter([Value::Integer(7)]),
                arguments_keyword: Dictionary::default(),
            },
        )
        .await
        .unwrap();

    assert_matches::assert_matches!(subscription.event_rx.recv().await, Ok(event) => {
        assert_eq!(event.arguments, List::from_iter([Value::Integer(7)]));
    });
}

#[tokio::test]
async fn exceeding_the_pending_write_limit_closes_the_socket() {
    common::setup_test_environment();

    // A small pending-write budget: one oversized frame trips it.
    let kernel = Kernel::new(KernelConfig {
        socket_max_pending_write_bytes: 1024,
        ..KernelConfig::default()
    });
    let router_kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(router_kernel, |_| ()).await.unwrap();

    let publisher = create_peer(kernel.clone(), |_| ()).unwrap();
    publisher
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    publisher.join_realm(REALM).await.unwrap();

    // 2 KiB of payload against a 1 KiB budget: the socket force-closes
    // rather than overshoot.
    let big = "x".repeat(2048);
    assert_matches::assert_matches!(
        publisher
            .publish(
                Uri::try_from("com.example.topic").unwrap(),
                Event {
                    arguments: List::from_iter([Value::String(big)]),
                    arguments_keyword: Dictionary::default(),
                },
            )
            .await,
        Err(_)
    );

    // The session is gone; further publishes fail outright.
    assert_matches::assert_matches!(
        publisher
            .publish(
                Uri::try_from("com.example.topic").unwrap(),
                Event::default(),
            )
            .await,
        Err(_)
    );
}

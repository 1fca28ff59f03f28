mod common;

use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use wampcore::{
    core::{
        error::{
            InteractionError,
            SessionClosedError,
        },
        kernel::{
            Kernel,
            KernelConfig,
        },
        uri::Uri,
    },
    peer::{
        PeerConfig,
        ProcedureHandler,
        RawSocketPeer,
        RpcCall,
        RpcYield,
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
async fn joining_an_unknown_realm_fails() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let peer = create_peer(kernel.clone(), "peer").unwrap();

    peer.connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    assert_matches::assert_matches!(peer.join_realm("unknown_realm").await, Err(err) => {
        assert_matches::assert_matches!(
            err.downcast_ref::<InteractionError>(),
            Some(InteractionError::NoSuchRealm)
        );
    });
}

#[tokio::test]
async fn graceful_close_allows_rejoining_on_the_same_connection() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let peer = create_peer(kernel.clone(), "peer").unwrap();

    peer.connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    let first = peer.join_realm(REALM).await.unwrap();
    assert_matches::assert_matches!(peer.leave_realm().await, Ok(()));

    // The connection survives the GOODBYE exchange; a fresh session gets a
    // fresh ID.
    let second = peer.join_realm(REALM).await.unwrap();
    assert_ne!(first.session_id, second.session_id);
}

#[tokio::test]
async fn closing_a_session_closes_its_subscriptions() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let peer = create_peer(kernel.clone(), "peer").unwrap();

    peer.connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    peer.join_realm(REALM).await.unwrap();

    let mut subscription = peer
        .subscribe(Uri::try_from("com.example.topic").unwrap())
        .await
        .unwrap();
    peer.leave_realm().await.unwrap();

    assert_matches::assert_matches!(
        subscription.event_rx.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Closed)
    );
}

struct Stall {}

#[async_trait]
impl ProcedureHandler for Stall {
    async fn invoke(&self, _: RpcCall) -> Result<RpcYield> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(RpcYield::default())
    }
}

#[tokio::test]
async fn pending_calls_resolve_when_the_session_closes() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let callee = create_peer(kernel.clone(), "callee").unwrap();
    let caller = Arc::new(create_peer(kernel.clone(), "caller").unwrap());

    callee
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    callee.join_realm(REALM).await.unwrap();
    callee
        .register(Uri::try_from("com.example.stall").unwrap(), Box::new(Stall {}))
        .await
        .unwrap();

    caller
        .connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    caller.join_realm(REALM).await.unwrap();

    let call_handle = tokio::spawn({
        let caller = caller.clone();
        async move {
            caller
                .call(
                    Uri::try_from("com.example.stall").unwrap(),
                    RpcCall::default(),
                )
                .await
        }
    });

    // Give the CALL time to go out before tearing the session down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    caller.leave_realm().await.unwrap();

    assert_matches::assert_matches!(call_handle.await, Ok(Err(err)) => {
        assert!(err.is::<SessionClosedError>());
    });
}

#[tokio::test]
async fn operations_fail_without_a_connection() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let peer = create_peer(kernel.clone(), "peer").unwrap();

    assert_matches::assert_matches!(peer.join_realm(REALM).await, Err(_));
    assert_matches::assert_matches!(
        peer.subscribe(Uri::try_from("com.example.topic").unwrap())
            .await,
        Err(_)
    );
    assert_matches::assert_matches!(
        peer.call(Uri::try_from("com.example.rpc").unwrap(), RpcCall::default())
            .await,
        Err(_)
    );
}

#[tokio::test]
async fn router_shutdown_ends_sessions() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let peer = create_peer(kernel.clone(), "peer").unwrap();

    peer.connect(&router_handle.local_addr().to_string())
        .await
        .unwrap();
    peer.join_realm(REALM).await.unwrap();

    router_handle.cancel().unwrap();
    assert_matches::assert_matches!(router_handle.join().await, Ok(()));

    // The session is gone; new work fails.
    let mut session_finished_rx = peer.session_finished_rx();
    tokio::time::timeout(Duration::from_secs(5), session_finished_rx.recv())
        .await
        .expect("session did not finish after router shutdown")
        .ok();
}

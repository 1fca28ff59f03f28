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
            BasicError,
            InteractionError,
        },
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
        PeerConfig,
        ProcedureHandler,
        RawSocketPeer,
        RpcCall,
        RpcYield,
        new_raw_socket_peer,
    },
    router::{
        InternalRpcCall,
        InternalRpcHandler,
        InternalRpcYield,
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

async fn connected_peer(
    kernel: Arc<Kernel>,
    router_handle: &RouterHandle,
    agent: &str,
) -> Result<RawSocketPeer, Error> {
    let mut config = PeerConfig::default();
    config.name = agent.to_owned();
    config.agent = agent.to_owned();
    let peer = new_raw_socket_peer(kernel, config)?;
    peer.connect(&router_handle.local_addr().to_string()).await?;
    peer.join_realm(REALM).await?;
    Ok(peer)
}

struct Add2 {}

#[async_trait]
impl ProcedureHandler for Add2 {
    async fn invoke(&self, call: RpcCall) -> Result<RpcYield> {
        let mut sum = 0;
        for argument in &call.arguments {
            match argument {
                Value::Integer(value) => sum += value,
                _ => {
                    return Err(
                        BasicError::InvalidArgument("arguments must be integers".to_owned()).into(),
                    );
                }
            }
        }
        Ok(RpcYield {
            arguments: List::from_iter([Value::Integer(sum)]),
            arguments_keyword: Dictionary::default(),
        })
    }
}

#[tokio::test]
async fn call_reaches_callee_and_yields_result() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let callee = connected_peer(kernel.clone(), &router_handle, "callee")
        .await
        .unwrap();
    let caller = connected_peer(kernel.clone(), &router_handle, "caller")
        .await
        .unwrap();

    callee
        .register(Uri::try_from("com.example.add2").unwrap(), Box::new(Add2 {}))
        .await
        .unwrap();

    let result = caller
        .call(
            Uri::try_from("com.example.add2").unwrap(),
            RpcCall {
                arguments: List::from_iter([Value::Integer(23), Value::Integer(7)]),
                arguments_keyword: Dictionary::default(),
            },
        )
        .await
        .unwrap();
    assert_eq!(result.arguments, List::from_iter([Value::Integer(30)]));
}

#[tokio::test]
async fn handler_errors_propagate_to_the_caller() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let callee = connected_peer(kernel.clone(), &router_handle, "callee")
        .await
        .unwrap();
    let caller = connected_peer(kernel.clone(), &router_handle, "caller")
        .await
        .unwrap();

    callee
        .register(Uri::try_from("com.example.add2").unwrap(), Box::new(Add2 {}))
        .await
        .unwrap();

    assert_matches::assert_matches!(
        caller
            .call(
                Uri::try_from("com.example.add2").unwrap(),
                RpcCall {
                    arguments: List::from_iter([Value::String("nope".to_owned())]),
                    arguments_keyword: Dictionary::default(),
                },
            )
            .await,
        Err(err) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<BasicError>(),
                Some(BasicError::InvalidArgument(_))
            );
        }
    );
}

#[tokio::test]
async fn duplicate_registration_fails_and_leaves_the_original_live() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let first = connected_peer(kernel.clone(), &router_handle, "first")
        .await
        .unwrap();
    let second = connected_peer(kernel.clone(), &router_handle, "second")
        .await
        .unwrap();
    let caller = connected_peer(kernel.clone(), &router_handle, "caller")
        .await
        .unwrap();

    first
        .register(Uri::try_from("com.x.foo").unwrap(), Box::new(Add2 {}))
        .await
        .unwrap();

    assert_matches::assert_matches!(
        second
            .register(Uri::try_from("com.x.foo").unwrap(), Box::new(Add2 {}))
            .await,
        Err(err) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<InteractionError>(),
                Some(InteractionError::ProcedureAlreadyExists)
            );
        }
    );

    // The original registration still answers calls.
    let result = caller
        .call(
            Uri::try_from("com.x.foo").unwrap(),
            RpcCall {
                arguments: List::from_iter([Value::Integer(1), Value::Integer(2)]),
                arguments_keyword: Dictionary::default(),
            },
        )
        .await
        .unwrap();
    assert_eq!(result.arguments, List::from_iter([Value::Integer(3)]));
}

#[tokio::test]
async fn calling_an_unknown_procedure_fails() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let caller = connected_peer(kernel.clone(), &router_handle, "caller")
        .await
        .unwrap();

    assert_matches::assert_matches!(
        caller
            .call(
                Uri::try_from("com.example.missing").unwrap(),
                RpcCall::default(),
            )
            .await,
        Err(err) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<InteractionError>(),
                Some(InteractionError::NoSuchProcedure)
            );
        }
    );
}

#[tokio::test]
async fn registrations_disappear_when_the_owning_session_closes() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let callee = connected_peer(kernel.clone(), &router_handle, "callee")
        .await
        .unwrap();
    let caller = connected_peer(kernel.clone(), &router_handle, "caller")
        .await
        .unwrap();

    callee
        .register(Uri::try_from("com.x.foo").unwrap(), Box::new(Add2 {}))
        .await
        .unwrap();
    callee.leave_realm().await.unwrap();

    // Registry clean-up races the GOODBYE reply, so poll until the
    // registration is gone.
    let mut deadline = 100;
    loop {
        match caller
            .call(Uri::try_from("com.x.foo").unwrap(), RpcCall::default())
            .await
        {
            Err(err)
                if matches!(
                    err.downcast_ref::<InteractionError>(),
                    Some(InteractionError::NoSuchProcedure)
                ) =>
            {
                break;
            }
            _ => {
                deadline -= 1;
                assert!(deadline > 0, "registration was never cleaned up");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

#[tokio::test]
async fn unregistered_procedure_is_no_longer_callable() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    let callee = connected_peer(kernel.clone(), &router_handle, "callee")
        .await
        .unwrap();
    let caller = connected_peer(kernel.clone(), &router_handle, "caller")
        .await
        .unwrap();

    let registration_id = callee
        .register(Uri::try_from("com.x.foo").unwrap(), Box::new(Add2 {}))
        .await
        .unwrap();
    callee.unregister(registration_id).await.unwrap();

    assert_matches::assert_matches!(
        caller
            .call(Uri::try_from("com.x.foo").unwrap(), RpcCall::default())
            .await,
        Err(err) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<InteractionError>(),
                Some(InteractionError::NoSuchProcedure)
            );
        }
    );
}

struct EchoService {}

#[async_trait]
impl InternalRpcHandler for EchoService {
    async fn invoke(&self, call: InternalRpcCall) -> Result<InternalRpcYield> {
        Ok(InternalRpcYield {
            arguments: call.arguments,
            arguments_keyword: call.arguments_keyword,
        })
    }
}

#[tokio::test]
async fn internal_procedures_answer_like_remote_ones() {
    common::setup_test_environment();

    let kernel = Kernel::new(KernelConfig::default());
    let router_handle = start_router(kernel.clone()).await.unwrap();
    router_handle
        .register_rpc(
            &Uri::try_from(REALM).unwrap(),
            Uri::try_from("com.example.echo").unwrap(),
            Arc::new(EchoService {}),
        )
        .await
        .unwrap();

    let caller = connected_peer(kernel.clone(), &router_handle, "caller")
        .await
        .unwrap();
    let result = caller
        .call(
            Uri::try_from("com.example.echo").unwrap(),
            RpcCall {
                arguments: List::from_iter([Value::String("ping".to_owned())]),
                arguments_keyword: Dictionary::default(),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        result.arguments,
        List::from_iter([Value::String("ping".to_owned())])
    );

    // Internal procedures collide with peer registrations like any other.
    let callee = connected_peer(kernel.clone(), &router_handle, "callee")
        .await
        .unwrap();
    assert_matches::assert_matches!(
        callee
            .register(Uri::try_from("com.example.echo").unwrap(), Box::new(Add2 {}))
            .await,
        Err(err) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<InteractionError>(),
                Some(InteractionError::ProcedureAlreadyExists)
            );
        }
    );
}

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;

use crate::{
    core::kernel::Kernel,
    router::{
        acceptor::RawSocketAcceptorFactory,
        router::{
            Router,
            RouterConfig,
        },
    },
    transport::raw_socket_transport::RawSocketTransportFactory,
};

/// A [`Router`] that accepts incoming rawsocket connections.
pub type RawSocketRouter = Router<TcpStream>;

/// Creates a new [`RawSocketRouter`].
pub fn new_raw_socket_router(kernel: Arc<Kernel>, config: RouterConfig) -> Result<RawSocketRouter> {
    Router::new(
        kernel,
        config,
        Box::new(RawSocketAcceptorFactory::default()),
        Box::new(RawSocketTransportFactory::default()),
    )
}

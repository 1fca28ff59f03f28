use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;

use crate::{
    core::kernel::Kernel,
    peer::{
        connector::RawSocketConnectorFactory,
        peer::{
            Peer,
            PeerConfig,
        },
    },
    transport::raw_socket_transport::RawSocketTransportFactory,
};

/// A WAMP peer over the rawsocket transport.
pub type RawSocketPeer = Peer<TcpStream>;

/// Creates a new [`RawSocketPeer`].
pub fn new_raw_socket_peer(kernel: Arc<Kernel>, config: PeerConfig) -> Result<RawSocketPeer> {
    Peer::new(
        kernel,
        config,
        Box::new(RawSocketConnectorFactory::default()),
        Box::new(RawSocketTransportFactory::default()),
    )
}

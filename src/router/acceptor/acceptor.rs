use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::{
    router::router::RouterConfig,
    serializer::serializer::SerializerType,
};

/// The result of an [`Acceptor`] successfully accepting a WAMP connection.
pub struct Acceptance<S> {
    /// The established stream.
    pub stream: S,
    /// The serializer settled in the handshake.
    pub serializer: SerializerType,
    /// Maximum payload length the router advertised for inbound frames.
    pub max_incoming_payload: usize,
    /// Maximum payload length the peer accepts for outbound frames.
    pub max_outgoing_payload: usize,
}

/// An acceptor, which accepts WAMP connections over a stream.
///
/// Note that the acceptor only *accepts* connections. It does not establish
/// sessions. In other words, the acceptor is only responsible for
/// establishing that both the client and server can talk using WAMP.
#[async_trait]
pub trait Acceptor<S> {
    /// Accepts the incoming TCP connection, erroring out if the handshake
    /// fails.
    async fn accept(&self, config: &RouterConfig, stream: TcpStream) -> Result<Acceptance<S>>;
}

/// A factory for creating a new [`Acceptor`].
pub trait AcceptorFactory<S>: Send + Sync {
    /// Creates a new [`Acceptor`].
    fn new_acceptor(&self) -> Box<dyn Acceptor<S> + Send>;
}

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    core::kernel::Kernel,
    peer::peer::PeerConfig,
    serializer::serializer::SerializerType,
};

/// A connection to a WAMP router produced by a [`Connector`].
///
/// The rawsocket handshake has already completed: the serializer and the
/// maximum payload lengths for both directions are settled.
pub struct Connection<S> {
    pub stream: S,
    pub serializer: SerializerType,
    /// Maximum payload length this peer advertised for inbound frames.
    pub max_incoming_payload: usize,
    /// Maximum payload length the router accepts for outbound frames.
    pub max_outgoing_payload: usize,
}

/// A type for initiating a connection to a router.
#[async_trait]
pub trait Connector<S> {
    async fn connect(
        &self,
        kernel: &Kernel,
        config: &PeerConfig,
        addr: &str,
    ) -> Result<Connection<S>>;
}

/// A type for generating a new [`Connector`].
pub trait ConnectorFactory<S>: Send + Sync {
    /// Creates a new [`Connector`].
    fn new_connector(&self) -> Box<dyn Connector<S> + Send>;
}

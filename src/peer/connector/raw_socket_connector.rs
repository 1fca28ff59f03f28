use std::net::SocketAddr;

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use log::debug;
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::TcpStream,
};

use crate::{
    core::{
        error::{
            HandshakeError,
            TransportError,
        },
        kernel::Kernel,
    },
    peer::{
        connector::connector::{
            Connection,
            Connector,
            ConnectorFactory,
        },
        peer::PeerConfig,
    },
    serializer::serializer::SerializerType,
    transport::frame::{
        HANDSHAKE_LENGTH,
        Handshake,
        decode_handshake,
        encode_handshake,
        max_payload_for_exp,
    },
};

#[derive(Default)]
struct RawSocketConnector {}

impl RawSocketConnector {
    async fn open_stream(&self, kernel: &Kernel, addr: &str) -> Result<TcpStream> {
        let connect = async {
            if kernel.config().use_hostname_resolution {
                TcpStream::connect(addr).await
            } else {
                let addr = addr.parse::<SocketAddr>().map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "hostname resolution is disabled; a numeric address is required",
                    )
                })?;
                TcpStream::connect(addr).await
            }
        };
        match tokio::time::timeout(kernel.config().connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(TransportError::ConnectFailed(err.to_string()).into()),
            Err(_) => Err(TransportError::ConnectTimedOut.into()),
        }
    }

    fn propose_serializer(config: &PeerConfig) -> Result<SerializerType> {
        // The rawsocket handshake proposes a single serializer; prefer JSON
        // when both are allowed.
        [SerializerType::Json, SerializerType::MessagePack]
            .into_iter()
            .find(|serializer| config.serializers.contains(serializer))
            .ok_or_else(|| Error::msg("at least one serializer is required"))
    }
}

#[async_trait]
impl Connector<TcpStream> for RawSocketConnector {
    async fn connect(
        &self,
        kernel: &Kernel,
        config: &PeerConfig,
        addr: &str,
    ) -> Result<Connection<TcpStream>> {
        let mut stream = self.open_stream(kernel, addr).await?;
        let serializer = Self::propose_serializer(config)?;

        stream
            .write_all(&encode_handshake(serializer, config.max_message_size_exp))
            .await
            .map_err(|err| TransportError::Write(err.to_string()))?;

        let mut reply = [0u8; HANDSHAKE_LENGTH];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|_| TransportError::UnexpectedEof)?;

        match decode_handshake(&reply)? {
            Handshake::Offer {
                serializer: accepted,
                max_message_size_exp,
            } => {
                if accepted != serializer {
                    return Err(HandshakeError::SerializerMismatch.into());
                }
                debug!(
                    "Rawsocket handshake with {addr} settled on {accepted:?}, router accepts up to 2^{} byte payloads",
                    9 + max_message_size_exp
                );
                Ok(Connection {
                    stream,
                    serializer: accepted,
                    max_incoming_payload: max_payload_for_exp(config.max_message_size_exp),
                    max_outgoing_payload: max_payload_for_exp(max_message_size_exp),
                })
            }
            Handshake::Rejected { error_code } => {
                Err(HandshakeError::Rejected(error_code).into())
            }
        }
    }
}

/// A factory for generating [`Connector`]s for rawsocket connections.
#[derive(Default)]
pub struct RawSocketConnectorFactory {}

impl ConnectorFactory<TcpStream> for RawSocketConnectorFactory {
    fn new_connector(&self) -> Box<dyn Connector<TcpStream> + Send> {
        Box::new(RawSocketConnector::default())
    }
}

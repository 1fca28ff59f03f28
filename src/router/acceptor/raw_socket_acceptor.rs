use anyhow::Result;
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
    core::error::{
        HandshakeError,
        TransportError,
    },
    router::{
        acceptor::acceptor::{
            Acceptance,
            Acceptor,
            AcceptorFactory,
        },
        router::RouterConfig,
    },
    transport::frame::{
        HANDSHAKE_ERROR_UNSUPPORTED_SERIALIZER,
        HANDSHAKE_LENGTH,
        Handshake,
        decode_handshake,
        encode_handshake,
        encode_handshake_error,
        max_payload_for_exp,
    },
};

#[derive(Default)]
struct RawSocketAcceptor {}

#[async_trait]
impl Acceptor<TcpStream> for RawSocketAcceptor {
    async fn accept(
        &self,
        config: &RouterConfig,
        mut stream: TcpStream,
    ) -> Result<Acceptance<TcpStream>> {
        let mut offer = [0u8; HANDSHAKE_LENGTH];
        stream
            .read_exact(&mut offer)
            .await
            .map_err(|_| TransportError::UnexpectedEof)?;

        let (serializer, peer_exp) = match decode_handshake(&offer) {
            Ok(Handshake::Offer {
                serializer,
                max_message_size_exp,
            }) if config.serializers.contains(&serializer) => (serializer, max_message_size_exp),
            Ok(Handshake::Offer { serializer, .. }) => {
                stream
                    .write_all(&encode_handshake_error(
                        HANDSHAKE_ERROR_UNSUPPORTED_SERIALIZER,
                    ))
                    .await
                    .ok();
                return Err(HandshakeError::UnsupportedSerializer(serializer.rawsocket_id()).into());
            }
            // A serializer id of zero is only meaningful in replies; a client
            // offering it is asking for nothing we can provide.
            Ok(Handshake::Rejected { .. }) => {
                stream
                    .write_all(&encode_handshake_error(
                        HANDSHAKE_ERROR_UNSUPPORTED_SERIALIZER,
                    ))
                    .await
                    .ok();
                return Err(HandshakeError::UnsupportedSerializer(0).into());
            }
            Err(err) => {
                if let HandshakeError::UnsupportedSerializer(id) = err {
                    stream
                        .write_all(&encode_handshake_error(
                            HANDSHAKE_ERROR_UNSUPPORTED_SERIALIZER,
                        ))
                        .await
                        .ok();
                    return Err(HandshakeError::UnsupportedSerializer(id).into());
                }
                return Err(err.into());
            }
        };

        // Echo the accepted serializer with our own maximum message length.
        stream
            .write_all(&encode_handshake(serializer, config.max_message_size_exp))
            .await
            .map_err(|err| TransportError::Write(err.to_string()))?;

        debug!(
            "Accepted rawsocket connection with {serializer:?}, peer accepts up to 2^{} byte payloads",
            9 + peer_exp
        );
        Ok(Acceptance {
            stream,
            serializer,
            max_incoming_payload: max_payload_for_exp(config.max_message_size_exp),
            max_outgoing_payload: max_payload_for_exp(peer_exp),
        })
    }
}

/// A factory for an [`Acceptor`] for rawsocket connections.
#[derive(Default)]
pub struct RawSocketAcceptorFactory {}

impl AcceptorFactory<TcpStream> for RawSocketAcceptorFactory {
    fn new_acceptor(&self) -> Box<dyn Acceptor<TcpStream> + Send> {
        Box::new(RawSocketAcceptor::default())
    }
}

use std::{
    collections::VecDeque,
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    Stream,
};
use log::warn;
use tokio::{
    io::{
        AsyncRead,
        AsyncWrite,
        ReadBuf,
    },
    net::TcpStream,
};

use crate::transport::{
    frame::{
        FRAME_HEADER_LENGTH,
        FrameKind,
        FrameLimits,
        decode_frame_header,
        encode_frame_header,
    },
    transport::{
        Transport,
        TransportData,
        TransportFactory,
    },
};

use crate::core::error::{
    HandshakeError,
    TransportError,
};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// The lifecycle state of a socket.
///
/// Transitions are monotone forward; a closed socket never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Connected,
    Closing,
    Closed,
}

/// A transport implementing the WAMP rawsocket framing protocol over a byte
/// stream whose handshake has already completed.
///
/// Each frame is a 4-byte big-endian header (frame kind in the top byte,
/// payload length in the low 24 bits) followed by the payload. Outbound
/// frames are queued and flushed asynchronously; a write that would push the
/// queued byte count above the configured limit force-closes the socket
/// instead of overshooting.
#[derive(Debug)]
pub struct RawSocketTransport<S> {
    stream: S,
    limits: FrameLimits,
    state: SocketState,

    read_buffer: Vec<u8>,
    pending_write: VecDeque<Vec<u8>>,
    write_offset: usize,

    bytes_read: u64,
    bytes_written: u64,
    bytes_pending_write: usize,
}

impl<S> RawSocketTransport<S> {
    /// Creates a transport over an established, handshaken stream.
    pub fn new(stream: S, limits: FrameLimits) -> Self {
        Self {
            stream,
            limits,
            state: SocketState::Connected,
            read_buffer: Vec::new(),
            pending_write: VecDeque::new(),
            write_offset: 0,
            bytes_read: 0,
            bytes_written: 0,
            bytes_pending_write: 0,
        }
    }

    /// Whether the socket is connected.
    pub fn is_connected(&self) -> bool {
        self.state == SocketState::Connected
    }

    /// Whether the socket is closing.
    pub fn is_closing(&self) -> bool {
        self.state == SocketState::Closing
    }

    /// Whether the socket is fully closed.
    pub fn is_closed(&self) -> bool {
        self.state == SocketState::Closed
    }

    /// Total bytes read off the socket.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Total bytes written to the socket.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes queued for write but not yet handed to the socket.
    pub fn bytes_pending_write(&self) -> usize {
        self.bytes_pending_write
    }

    /// Extracts the next whole frame from the read buffer, if one has fully
    /// arrived.
    fn next_frame(&mut self) -> Result<Option<(FrameKind, Vec<u8>)>> {
        if self.read_buffer.len() < FRAME_HEADER_LENGTH {
            return Ok(None);
        }
        let mut header_bytes = [0u8; FRAME_HEADER_LENGTH];
        header_bytes.copy_from_slice(&self.read_buffer[..FRAME_HEADER_LENGTH]);
        let header = decode_frame_header(&header_bytes)?;
        if header.length > self.limits.max_incoming_payload {
            return Err(HandshakeError::MessageTooLarge {
                got: header.length,
                max: self.limits.max_incoming_payload,
            }
            .into());
        }
        let frame_end = FRAME_HEADER_LENGTH + header.length;
        if self.read_buffer.len() < frame_end {
            return Ok(None);
        }
        let payload = self.read_buffer[FRAME_HEADER_LENGTH..frame_end].to_vec();
        self.read_buffer.drain(..frame_end);
        Ok(Some((header.kind, payload)))
    }
}

impl<S> Transport for RawSocketTransport<S> where S: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<S> Stream for RawSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug,
{
    type Item = Result<TransportData>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.state == SocketState::Closed {
                return task::Poll::Ready(None);
            }

            match this.next_frame() {
                Ok(Some((FrameKind::Data, payload))) => {
                    return task::Poll::Ready(Some(Ok(TransportData::Message(payload))));
                }
                Ok(Some((FrameKind::Ping, payload))) => {
                    return task::Poll::Ready(Some(Ok(TransportData::Ping(payload))));
                }
                // PONG answers one of our PINGs; consuming it is enough.
                Ok(Some((FrameKind::Pong, _))) => continue,
                Ok(None) => (),
                Err(err) => {
                    this.state = SocketState::Closed;
                    return task::Poll::Ready(Some(Err(err)));
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut this.stream).poll_read(cx, &mut read_buf) {
                task::Poll::Pending => return task::Poll::Pending,
                task::Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        this.state = SocketState::Closed;
                        if this.read_buffer.is_empty() {
                            return task::Poll::Ready(None);
                        }
                        return task::Poll::Ready(Some(Err(TransportError::UnexpectedEof.into())));
                    }
                    this.bytes_read += filled.len() as u64;
                    this.read_buffer.extend_from_slice(filled);
                }
                task::Poll::Ready(Err(err)) => {
                    this.state = SocketState::Closed;
                    return task::Poll::Ready(Some(Err(
                        TransportError::Read(err.to_string()).into()
                    )));
                }
            }
        }
    }
}

impl<S> Sink<TransportData> for RawSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug,
{
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        if self.state != SocketState::Connected {
            return task::Poll::Ready(Err(TransportError::SocketClosed.into()));
        }
        task::Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: TransportData) -> Result<(), Self::Error> {
        if self.state != SocketState::Connected {
            return Err(TransportError::SocketClosed.into());
        }

        // An inbound PING is echoed back by the layer above; it goes out
        // tagged as a PONG.
        let (kind, payload) = match item {
            TransportData::Ping(payload) => (FrameKind::Pong, payload),
            TransportData::Message(payload) => (FrameKind::Data, payload),
        };
        if payload.len() > self.limits.max_outgoing_payload {
            return Err(HandshakeError::MessageTooLarge {
                got: payload.len(),
                max: self.limits.max_outgoing_payload,
            }
            .into());
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LENGTH + payload.len());
        frame.extend_from_slice(&encode_frame_header(kind, payload.len()));
        frame.extend_from_slice(&payload);

        if self.bytes_pending_write + frame.len() > self.limits.max_pending_write_bytes {
            warn!(
                "Pending write bytes limit of {} reached; closing connection",
                self.limits.max_pending_write_bytes
            );
            self.state = SocketState::Closing;
            return Err(TransportError::PendingWriteLimit.into());
        }

        self.bytes_pending_write += frame.len();
        self.pending_write.push_back(frame);
        Ok(())
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        while let Some(front) = this.pending_write.front() {
            let slice = &front[this.write_offset..];
            match Pin::new(&mut this.stream).poll_write(cx, slice) {
                task::Poll::Pending => return task::Poll::Pending,
                task::Poll::Ready(Ok(written)) => {
                    this.bytes_written += written as u64;
                    this.bytes_pending_write -= written;
                    this.write_offset += written;
                    if this.write_offset == front.len() {
                        this.pending_write.pop_front();
                        this.write_offset = 0;
                    }
                }
                task::Poll::Ready(Err(err)) => {
                    this.state = SocketState::Closed;
                    return task::Poll::Ready(Err(TransportError::Write(err.to_string()).into()));
                }
            }
        }
        Pin::new(&mut this.stream)
            .poll_flush(cx)
            .map_err(|err| TransportError::Write(err.to_string()).into())
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        if self.state != SocketState::Closed {
            self.state = SocketState::Closing;
        }
        // Flush what we can, but a close must complete even if the write side
        // already failed.
        match self.as_mut().poll_flush(cx) {
            task::Poll::Pending => return task::Poll::Pending,
            task::Poll::Ready(_) => (),
        }
        match Pin::new(&mut self.stream).poll_shutdown(cx) {
            task::Poll::Pending => task::Poll::Pending,
            task::Poll::Ready(result) => {
                self.state = SocketState::Closed;
                task::Poll::Ready(
                    result.map_err(|err| TransportError::Write(err.to_string()).into()),
                )
            }
        }
    }
}

/// A factory for [`RawSocketTransport`] over TCP streams.
#[derive(Default)]
pub struct RawSocketTransportFactory {}

impl TransportFactory<TcpStream> for RawSocketTransportFactory {
    fn new_transport(&self, stream: TcpStream, limits: FrameLimits) -> Box<dyn Transport> {
        Box::new(RawSocketTransport::new(stream, limits))
    }
}

#[cfg(test)]
mod raw_socket_transport_test {
    use futures_util::{
        SinkExt,
        StreamExt,
    };
    use tokio::io::{
        AsyncWriteExt,
        DuplexStream,
    };

    use crate::{
        core::error::{
            HandshakeError,
            TransportError,
        },
        transport::{
            frame::FrameLimits,
            raw_socket_transport::RawSocketTransport,
            transport::TransportData,
        },
    };

    fn limits() -> FrameLimits {
        FrameLimits {
            max_incoming_payload: 1024,
            max_outgoing_payload: 1024,
            max_pending_write_bytes: 16 * 1024,
        }
    }

    fn transport_pair(
        buffer_size: usize,
        limits: FrameLimits,
    ) -> (
        RawSocketTransport<DuplexStream>,
        RawSocketTransport<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(buffer_size);
        (
            RawSocketTransport::new(a, limits),
            RawSocketTransport::new(b, limits),
        )
    }

    #[tokio::test]
    async fn sends_and_receives_framed_messages() {
        let (mut a, mut b) = transport_pair(4096, limits());

        assert_matches::assert_matches!(
            a.send(TransportData::Message(b"[6,{},\"wamp.close.normal\"]".to_vec()))
                .await,
            Ok(())
        );
        assert_matches::assert_matches!(b.next().await, Some(Ok(TransportData::Message(payload))) => {
            assert_eq!(payload, b"[6,{},\"wamp.close.normal\"]".to_vec());
        });

        assert_eq!(a.bytes_written(), 26 + 4);
        assert_eq!(a.bytes_pending_write(), 0);
        assert_eq!(b.bytes_read(), 26 + 4);
    }

    #[tokio::test]
    async fn pong_frames_are_consumed_silently() {
        let (mut a, mut b) = transport_pair(4096, limits());

        // Sending a Ping writes a PONG frame, answering a peer's health
        // check. The receiver consumes it without surfacing anything.
        assert_matches::assert_matches!(a.send(TransportData::Ping(b"beat".to_vec())).await, Ok(()));
        assert_matches::assert_matches!(
            a.send(TransportData::Message(b"[]".to_vec())).await,
            Ok(())
        );
        assert_matches::assert_matches!(b.next().await, Some(Ok(TransportData::Message(_))));
    }

    #[tokio::test]
    async fn closes_on_oversized_inbound_frame() {
        let (a, mut b) = transport_pair(4096, limits());

        // Write a raw header advertising a payload above the 1024-byte limit.
        let mut stream = a.stream;
        stream.write_all(&[0x00, 0x00, 0x08, 0x00]).await.unwrap();

        assert_matches::assert_matches!(b.next().await, Some(Err(err)) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<HandshakeError>(),
                Some(HandshakeError::MessageTooLarge { got: 2048, max: 1024 })
            );
        });
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn rejects_oversized_outbound_frame() {
        let (mut a, _b) = transport_pair(4096, limits());

        assert_matches::assert_matches!(
            a.send(TransportData::Message(vec![0; 2048])).await,
            Err(err) => {
                assert_matches::assert_matches!(
                    err.downcast_ref::<HandshakeError>(),
                    Some(HandshakeError::MessageTooLarge { got: 2048, max: 1024 })
                );
            }
        );
    }

    #[tokio::test]
    async fn force_closes_when_pending_write_limit_is_exceeded() {
        let mut limits = limits();
        limits.max_pending_write_bytes = 1024;
        // A tiny duplex buffer so flushed bytes cannot drain.
        let (mut a, _b) = transport_pair(16, limits);

        // Queue without flushing until the pending byte count trips the
        // limit.
        let mut tripped = false;
        for _ in 0..8 {
            match a.feed(TransportData::Message(vec![0; 256])).await {
                Ok(()) => {
                    assert!(a.bytes_pending_write() <= 1024);
                }
                Err(err) => {
                    assert_matches::assert_matches!(
                        err.downcast_ref::<TransportError>(),
                        Some(TransportError::PendingWriteLimit)
                    );
                    tripped = true;
                    break;
                }
            }
        }
        assert!(tripped);
        assert!(a.is_closing());

        // Further writes fail outright.
        assert_matches::assert_matches!(
            a.feed(TransportData::Message(vec![0; 1])).await,
            Err(err) => {
                assert_matches::assert_matches!(
                    err.downcast_ref::<TransportError>(),
                    Some(TransportError::SocketClosed)
                );
            }
        );
    }

    #[tokio::test]
    async fn ends_stream_on_peer_close() {
        let (a, mut b) = transport_pair(4096, limits());
        drop(a);
        assert_matches::assert_matches!(b.next().await, None);
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn errors_on_eof_mid_frame() {
        let (a, mut b) = transport_pair(4096, limits());

        let mut stream = a.stream;
        stream.write_all(&[0x00, 0x00, 0x00, 0x10, 0xAB]).await.unwrap();
        drop(stream);

        assert_matches::assert_matches!(b.next().await, Some(Err(err)) => {
            assert_matches::assert_matches!(
                err.downcast_ref::<TransportError>(),
                Some(TransportError::UnexpectedEof)
            );
        });
    }
}

use anyhow::Error;
use thiserror::Error;

use crate::{
    core::{
        id::Id,
        types::Value,
        uri::Uri,
    },
    message::message::Message,
};

/// A socket-level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// The connect attempt did not finish within the configured bound.
    #[error("connect timed out")]
    ConnectTimedOut,
    /// The peer closed the connection mid-message.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    /// An operation was attempted on a socket that is closing or closed.
    #[error("socket closing or closed")]
    SocketClosed,
    /// The pending-write byte limit was exceeded.
    ///
    /// The socket is force-closed rather than allowed to overshoot.
    #[error("pending write bytes limit reached")]
    PendingWriteLimit,
    /// A write syscall failed.
    #[error("write failed: {0}")]
    Write(String),
    /// A read syscall failed.
    #[error("read failed: {0}")]
    Read(String),
}

/// A failure of the rawsocket handshake or framing negotiation.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer's handshake did not start with the rawsocket magic byte.
    #[error("handshake did not carry the rawsocket magic byte")]
    BadMagic,
    /// The peer requested a serializer this endpoint does not accept.
    #[error("unsupported serializer {0}")]
    UnsupportedSerializer(u8),
    /// The router accepted the connection with a different serializer than
    /// the one proposed.
    #[error("router selected a different serializer than proposed")]
    SerializerMismatch,
    /// The router rejected the handshake with the given error code.
    #[error("handshake rejected by router (error code {0})")]
    Rejected(u8),
    /// A frame exceeded the maximum payload length negotiated for this
    /// direction.
    #[error("frame of {got} bytes exceeds the negotiated maximum of {max} bytes")]
    MessageTooLarge { got: usize, max: usize },
    /// A frame carried a reserved frame type.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
}

/// A failure to authenticate a session.
#[derive(Debug, Error)]
pub enum AuthenticationError {
    /// The router challenged with a method this peer does not implement.
    #[error("unsupported authentication method {0}")]
    UnsupportedMethod(String),
    /// The router challenged but the peer holds no credentials.
    #[error("router issued a challenge but no credentials were supplied")]
    MissingCredentials,
    /// The challenge response did not match the expected signature.
    #[error("challenge response does not match")]
    BadSignature,
    /// The user performing authentication is not known.
    #[error("unknown authid")]
    UnknownAuthId,
}

/// Error for a request abandoned because its session closed.
#[derive(Debug, Error)]
#[error("session closed")]
pub struct SessionClosedError;

/// Error for a bounded wait that expired.
#[derive(Debug, Error)]
#[error("operation timed out")]
pub struct TimeoutError;

/// A basic error that occurs while processing a WAMP message.
#[derive(Debug, Error)]
pub enum BasicError {
    /// A generic resource was not found.
    #[error("{0}")]
    NotFound(String),
    /// An invalid argument was passed.
    #[error("{0}")]
    InvalidArgument(String),
    /// The operation is not allowed based on process configuration.
    #[error("{0}")]
    NotAllowed(String),
    /// Some internal error occurred.
    #[error("{0}")]
    Internal(String),
}

impl BasicError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotAllowed(_) => "not_allowed",
            Self::Internal(_) => "internal",
        }
    }
}

/// An interaction error that occurs while processing a WAMP message.
///
/// Interaction errors are clearly defined in the WAMP standard and are
/// reserved for errors that peers must be able to parse easily.
#[derive(Debug, Error)]
pub enum InteractionError {
    /// The incoming message violates the WAMP protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The procedure being called does not exist.
    #[error("no such procedure")]
    NoSuchProcedure,
    /// The procedure being registered already exists.
    #[error("procedure already exists")]
    ProcedureAlreadyExists,
    /// The registration being referenced does not exist.
    #[error("no such registration")]
    NoSuchRegistration,
    /// The subscription being referenced does not exist.
    #[error("no such subscription")]
    NoSuchSubscription,
    /// The realm being referenced does not exist.
    #[error("no such realm")]
    NoSuchRealm,
    /// The peer is not authorized for the operation.
    #[error("not authorized")]
    NotAuthorized,
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::NoSuchProcedure => "no_such_procedure",
            Self::ProcedureAlreadyExists => "procedure_already_exists",
            Self::NoSuchRegistration => "no_such_registration",
            Self::NoSuchSubscription => "no_such_subscription",
            Self::NoSuchRealm => "no_such_realm",
            Self::NotAuthorized => "not_authorized",
        }
    }
}

/// A peer-sent WAMP error that does not correspond to any well-known kind.
///
/// The URI carries the semantics.
#[derive(Debug, Clone, Error)]
#[error("{reason}: {message}")]
pub struct WampError {
    pub reason: Uri,
    pub message: String,
}

/// Creates an [`struct@Error`] from a URI error reason and message.
pub fn error_from_uri_reason_and_message(reason: Uri, message: String) -> Error {
    match reason.as_ref() {
        "wamp.error.not_found" => BasicError::NotFound(message).into(),
        "wamp.error.invalid_argument" => BasicError::InvalidArgument(message).into(),
        "wamp.error.not_allowed" => BasicError::NotAllowed(message).into(),
        "wamp.error.protocol_violation" => InteractionError::ProtocolViolation(message).into(),
        "wamp.error.no_such_procedure" => InteractionError::NoSuchProcedure.into(),
        "wamp.error.procedure_already_exists" => InteractionError::ProcedureAlreadyExists.into(),
        "wamp.error.no_such_registration" => InteractionError::NoSuchRegistration.into(),
        "wamp.error.no_such_subscription" => InteractionError::NoSuchSubscription.into(),
        "wamp.error.no_such_realm" => InteractionError::NoSuchRealm.into(),
        "wamp.error.not_authorized" => InteractionError::NotAuthorized.into(),
        "wamp.error.session_closed" => SessionClosedError.into(),
        _ => WampError { reason, message }.into(),
    }
}

/// Extracts a URI error reason and message from a WAMP message.
pub fn extract_error_uri_reason_and_message(message: &Message) -> Result<(&Uri, &str), Error> {
    let reason = match message.reason() {
        Some(reason) => reason,
        None => return Err(Error::msg("message does not contain a reason uri")),
    };
    let message = match message.details().and_then(|details| details.get("message")) {
        Some(Value::String(message)) => message.as_str(),
        _ => "unknown error",
    };
    Ok((reason, message))
}

/// Constructs an [`struct@Error`] from a WAMP message.
///
/// Fails if the message does not describe any error.
pub fn error_from_message(message: &Message) -> Result<Error, Error> {
    let (uri, message) = extract_error_uri_reason_and_message(message)?;
    Ok(error_from_uri_reason_and_message(
        uri.clone(),
        message.to_owned(),
    ))
}

/// An error that can be transmitted over channels.
#[derive(Debug, Clone)]
pub struct ChannelTransmittableError {
    pub reason: Uri,
    pub message: String,
    pub request_id: Option<Id>,
}

impl ChannelTransmittableError {
    /// Converts the error into a real error object that can be returned out.
    pub fn into_error(self) -> Error {
        error_from_uri_reason_and_message(self.reason, self.message)
    }
}

impl From<ChannelTransmittableError> for Error {
    fn from(value: ChannelTransmittableError) -> Self {
        value.into_error()
    }
}

impl TryFrom<&Message> for ChannelTransmittableError {
    type Error = Error;
    fn try_from(value: &Message) -> std::result::Result<Self, Self::Error> {
        let (reason, message) = extract_error_uri_reason_and_message(value)?;
        Ok(Self {
            reason: reason.to_owned(),
            message: message.to_owned(),
            request_id: value.request_id(),
        })
    }
}

impl From<&Error> for ChannelTransmittableError {
    fn from(value: &Error) -> Self {
        Self {
            reason: Uri::for_error(value),
            message: value.to_string(),
            request_id: None,
        }
    }
}

impl From<Error> for ChannelTransmittableError {
    fn from(value: Error) -> Self {
        Self::from(&value)
    }
}

/// Type alias for a channel-transmittable result.
///
/// Assumes `T` is channel-transmittable.
pub type ChannelTransmittableResult<T> = Result<T, ChannelTransmittableError>;

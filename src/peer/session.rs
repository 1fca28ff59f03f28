use std::sync::Arc;

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    info,
    trace,
    warn,
};
use tokio::sync::{
    broadcast,
    mpsc::UnboundedSender,
};

use crate::{
    auth::{
        ClientCredentials,
        wampcra,
    },
    core::{
        error::{
            AuthenticationError,
            ChannelTransmittableError,
            ChannelTransmittableResult,
            InteractionError,
            SessionClosedError,
        },
        hash::HashMap,
        id::{
            Id,
            SequentialIdAllocator,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            error_for_request,
            goodbye_and_out,
        },
        message::{
            AuthenticateMessage,
            ChallengeMessage,
            HelloMessage,
            InvocationMessage,
            Message,
            YieldMessage,
        },
    },
};

/// An event payload, as published to a topic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Event {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// An event received over a subscription.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub publication_id: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// An invocation of a procedure registered by this peer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub request_id: Id,
    pub registration_id: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// The result a procedure handler yields back to the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A command from the peer to its session.
#[derive(Debug)]
pub enum PeerCommand {
    /// Sends a message to the router.
    Send(Message),
    /// Sends HELLO, remembering the credentials for a possible CHALLENGE.
    Hello(HelloMessage, Option<ClientCredentials>),
}

/// Messages produced by a session for consumers of the session's result
/// channels.
pub mod peer_session_message {
    use tokio::sync::broadcast;

    use crate::core::{
        id::Id,
        types::{
            Dictionary,
            List,
        },
        uri::Uri,
    };

    /// An established session in a realm.
    #[derive(Debug, Clone)]
    pub struct EstablishedSession {
        pub realm: Uri,
        pub session_id: Id,
    }

    /// A confirmed subscription.
    #[derive(Debug)]
    pub struct Subscribed {
        pub request_id: Id,
        pub subscription_id: Id,
        pub event_rx: broadcast::Receiver<super::ReceivedEvent>,
    }

    impl Clone for Subscribed {
        fn clone(&self) -> Self {
            Self {
                request_id: self.request_id,
                subscription_id: self.subscription_id,
                event_rx: self.event_rx.resubscribe(),
            }
        }
    }

    /// A confirmed unsubscription.
    #[derive(Debug, Clone)]
    pub struct Unsubscribed {
        pub request_id: Id,
    }

    /// A confirmed publication.
    #[derive(Debug, Clone)]
    pub struct Published {
        pub request_id: Id,
        pub publication_id: Id,
    }

    /// A confirmed registration.
    #[derive(Debug)]
    pub struct Registered {
        pub request_id: Id,
        pub registration_id: Id,
        pub invocation_rx: broadcast::Receiver<super::Invocation>,
    }

    impl Clone for Registered {
        fn clone(&self) -> Self {
            Self {
                request_id: self.request_id,
                registration_id: self.registration_id,
                invocation_rx: self.invocation_rx.resubscribe(),
            }
        }
    }

    /// A confirmed unregistration.
    #[derive(Debug, Clone)]
    pub struct Unregistered {
        pub request_id: Id,
    }

    /// The result of a procedure call.
    #[derive(Debug, Clone)]
    pub struct RpcResult {
        pub request_id: Id,
        pub arguments: List,
        pub arguments_keyword: Dictionary,
    }
}

/// The kind of an outstanding request, keyed by request ID until the matching
/// reply arrives.
#[derive(Debug, Clone)]
enum RequestKind {
    Subscribe { topic: Uri },
    Unsubscribe { subscription_id: Id },
    Publish,
    Register,
    Unregister { registration_id: Id },
    Call,
}

#[derive(Debug, Clone)]
struct EstablishingState {
    realm: Uri,
}

#[derive(Debug, Clone)]
struct EstablishedState {
    realm: Uri,
    session_id: Id,
}

/// The client-side session state machine.
///
/// A transport error or protocol violation from any state moves directly to
/// `Closed`.
#[derive(Debug, Default, Clone)]
enum SessionState {
    #[default]
    Closed,
    SentHello(EstablishingState),
    SentAuthenticate(EstablishingState),
    Established(EstablishedState),
    Closing,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::SentHello(_) => "SentHello",
            Self::SentAuthenticate(_) => "SentAuthenticate",
            Self::Established(_) => "Established",
            Self::Closing => "Closing",
        }
    }

    fn allowed_state_transition(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Closed, Self::SentHello(_))
                | (Self::SentHello(_), Self::SentAuthenticate(_))
                | (Self::SentHello(_), Self::Established(_))
                | (Self::SentHello(_), Self::Closed)
                | (Self::SentAuthenticate(_), Self::Established(_))
                | (Self::SentAuthenticate(_), Self::Closed)
                | (Self::Established(_), Self::Closing)
                | (Self::Established(_), Self::Closed)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// A handle to a [`Session`], for access from the peer's public methods.
pub struct SessionHandle {
    id_allocator: Arc<SequentialIdAllocator>,
    established_session_rx:
        broadcast::Receiver<ChannelTransmittableResult<peer_session_message::EstablishedSession>>,
    closed_session_rx: broadcast::Receiver<()>,
    subscribed_rx: broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Subscribed>>,
    unsubscribed_rx:
        broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Unsubscribed>>,
    published_rx: broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Published>>,
    registered_rx: broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Registered>>,
    unregistered_rx:
        broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Unregistered>>,
    rpc_result_rx: broadcast::Receiver<ChannelTransmittableResult<peer_session_message::RpcResult>>,
}

impl SessionHandle {
    /// The session-scope request ID allocator.
    pub fn id_allocator(&self) -> Arc<SequentialIdAllocator> {
        self.id_allocator.clone()
    }

    pub fn established_session_rx(
        &self,
    ) -> broadcast::Receiver<ChannelTransmittableResult<peer_session_message::EstablishedSession>>
    {
        self.established_session_rx.resubscribe()
    }

    pub fn closed_session_rx(&self) -> broadcast::Receiver<()> {
        self.closed_session_rx.resubscribe()
    }

    pub fn subscribed_rx(
        &self,
    ) -> broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Subscribed>> {
        self.subscribed_rx.resubscribe()
    }

    pub fn unsubscribed_rx(
        &self,
    ) -> broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Unsubscribed>> {
        self.unsubscribed_rx.resubscribe()
    }

    pub fn published_rx(
        &self,
    ) -> broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Published>> {
        self.published_rx.resubscribe()
    }

    pub fn registered_rx(
        &self,
    ) -> broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Registered>> {
        self.registered_rx.resubscribe()
    }

    pub fn unregistered_rx(
        &self,
    ) -> broadcast::Receiver<ChannelTransmittableResult<peer_session_message::Unregistered>> {
        self.unregistered_rx.resubscribe()
    }

    pub fn rpc_result_rx(
        &self,
    ) -> broadcast::Receiver<ChannelTransmittableResult<peer_session_message::RpcResult>> {
        self.rpc_result_rx.resubscribe()
    }
}

/// The client side of a WAMP session.
///
/// Tracks every outstanding request by ID; a reply that does not match an
/// outstanding request is a protocol violation and closes the session. All
/// outstanding requests are resolved with a session-closed error when the
/// session finishes, so no waiter is left pending.
pub struct Session {
    name: String,
    service_message_tx: UnboundedSender<Message>,
    state: SessionState,

    id_allocator: Arc<SequentialIdAllocator>,
    outstanding_requests: HashMap<Id, RequestKind>,
    credentials: Option<ClientCredentials>,
    subscriptions: HashMap<Id, broadcast::Sender<ReceivedEvent>>,
    procedures: HashMap<Id, broadcast::Sender<Invocation>>,

    established_session_tx:
        broadcast::Sender<ChannelTransmittableResult<peer_session_message::EstablishedSession>>,
    closed_session_tx: broadcast::Sender<()>,
    subscribed_tx: broadcast::Sender<ChannelTransmittableResult<peer_session_message::Subscribed>>,
    unsubscribed_tx:
        broadcast::Sender<ChannelTransmittableResult<peer_session_message::Unsubscribed>>,
    published_tx: broadcast::Sender<ChannelTransmittableResult<peer_session_message::Published>>,
    registered_tx: broadcast::Sender<ChannelTransmittableResult<peer_session_message::Registered>>,
    unregistered_tx:
        broadcast::Sender<ChannelTransmittableResult<peer_session_message::Unregistered>>,
    rpc_result_tx: broadcast::Sender<ChannelTransmittableResult<peer_session_message::RpcResult>>,
}

impl Session {
    pub fn new(name: String, service_message_tx: UnboundedSender<Message>) -> Self {
        let (established_session_tx, _) = broadcast::channel(16);
        let (closed_session_tx, _) = broadcast::channel(16);
        let (subscribed_tx, _) = broadcast::channel(16);
        let (unsubscribed_tx, _) = broadcast::channel(16);
        let (published_tx, _) = broadcast::channel(16);
        let (registered_tx, _) = broadcast::channel(16);
        let (unregistered_tx, _) = broadcast::channel(16);
        let (rpc_result_tx, _) = broadcast::channel(16);
        Self {
            name,
            service_message_tx,
            state: SessionState::default(),
            id_allocator: Arc::new(SequentialIdAllocator::default()),
            outstanding_requests: HashMap::default(),
            credentials: None,
            subscriptions: HashMap::default(),
            procedures: HashMap::default(),
            established_session_tx,
            closed_session_tx,
            subscribed_tx,
            unsubscribed_tx,
            published_tx,
            registered_tx,
            unregistered_tx,
            rpc_result_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            id_allocator: self.id_allocator.clone(),
            established_session_rx: self.established_session_tx.subscribe(),
            closed_session_rx: self.closed_session_tx.subscribe(),
            subscribed_rx: self.subscribed_tx.subscribe(),
            unsubscribed_rx: self.unsubscribed_tx.subscribe(),
            published_rx: self.published_tx.subscribe(),
            registered_rx: self.registered_tx.subscribe(),
            unregistered_rx: self.unregistered_tx.subscribe(),
            rpc_result_rx: self.rpc_result_tx.subscribe(),
        }
    }

    /// Handles a command from the peer object.
    pub async fn handle_command(&mut self, command: PeerCommand) -> Result<()> {
        match command {
            PeerCommand::Send(message) => self.send_message(message),
            PeerCommand::Hello(message, credentials) => {
                self.credentials = credentials;
                self.send_message(Message::Hello(message))
            }
        }
    }

    /// Sends a message to the router, tracking requests and session state.
    pub fn send_message(&mut self, message: Message) -> Result<()> {
        self.record_outstanding_request(&message);
        self.transition_state_from_sending_message(&message)?;
        self.service_message_tx.send(message).map_err(Error::new)
    }

    fn record_outstanding_request(&mut self, message: &Message) {
        let (request_id, kind) = match message {
            Message::Subscribe(message) => (
                message.request,
                RequestKind::Subscribe {
                    topic: message.topic.clone(),
                },
            ),
            Message::Unsubscribe(message) => (
                message.request,
                RequestKind::Unsubscribe {
                    subscription_id: message.subscribed_subscription,
                },
            ),
            Message::Publish(message) => {
                // Only an acknowledged publish elicits a PUBLISHED reply.
                match message.options.get("acknowledge") {
                    Some(Value::Bool(true)) => (message.request, RequestKind::Publish),
                    _ => return,
                }
            }
            Message::Register(message) => (message.request, RequestKind::Register),
            Message::Unregister(message) => (
                message.request,
                RequestKind::Unregister {
                    registration_id: message.registered_registration,
                },
            ),
            Message::Call(message) => (message.request, RequestKind::Call),
            _ => return,
        };
        self.outstanding_requests.insert(request_id, kind);
    }

    fn transition_state_from_sending_message(&mut self, message: &Message) -> Result<()> {
        let next_state = match message {
            Message::Hello(message) => SessionState::SentHello(EstablishingState {
                realm: message.realm.clone(),
            }),
            Message::Authenticate(_) => match &self.state {
                SessionState::SentHello(state) => SessionState::SentAuthenticate(state.clone()),
                _ => return Err(Error::msg("AUTHENTICATE is only valid after HELLO")),
            },
            Message::Abort(_) => SessionState::Closed,
            Message::Goodbye(_) => match self.state {
                SessionState::Closing => SessionState::Closed,
                _ => SessionState::Closing,
            },
            _ => return Ok(()),
        };
        self.transition_state(next_state)
    }

    /// Handles a message from the router.
    pub async fn handle_message(&mut self, message: Message) -> Result<()> {
        trace!("Peer {} received message: {message:?}", self.name);
        if let Err(err) = self.handle_message_on_state_machine(message).await {
            self.send_message(abort_message_for_error(&err))?;
            return Err(err);
        }
        Ok(())
    }

    async fn handle_message_on_state_machine(&mut self, message: Message) -> Result<()> {
        match &self.state {
            SessionState::Closed => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on a closed session",
                message.message_name()
            ))
            .into()),
            SessionState::SentHello(_) => self.handle_sent_hello(message).await,
            SessionState::SentAuthenticate(_) => self.handle_sent_authenticate(message).await,
            SessionState::Established(_) => self.handle_established(message).await,
            SessionState::Closing => self.handle_closing(message).await,
        }
    }

    fn establishing_realm(&self) -> Result<Uri> {
        match &self.state {
            SessionState::SentHello(state) | SessionState::SentAuthenticate(state) => {
                Ok(state.realm.clone())
            }
            _ => Err(Error::msg("session is not in an establishing state")),
        }
    }

    fn establish(&mut self, session_id: Id) -> Result<()> {
        let realm = self.establishing_realm()?;
        self.transition_state(SessionState::Established(EstablishedState {
            realm: realm.clone(),
            session_id,
        }))?;
        info!(
            "Peer {} started session {session_id} on realm {realm}",
            self.name
        );
        self.established_session_tx
            .send(Ok(peer_session_message::EstablishedSession {
                realm,
                session_id,
            }))?;
        Ok(())
    }

    async fn handle_sent_hello(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Welcome(message) => self.establish(message.session),
            Message::Challenge(message) => {
                let authenticate = match self.answer_challenge(&message) {
                    Ok(authenticate) => authenticate,
                    Err(err) => {
                        self.established_session_tx
                            .send(Err(ChannelTransmittableError::from(&err)))
                            .ok();
                        return Err(err);
                    }
                };
                self.send_message(Message::Authenticate(authenticate))
            }
            message @ Message::Abort(_) => {
                self.transition_state(SessionState::Closed)?;
                self.established_session_tx
                    .send(Err((&message).try_into()?))?;
                Ok(())
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message after HELLO",
                message.message_name()
            ))
            .into()),
        }
    }

    fn answer_challenge(&self, message: &ChallengeMessage) -> Result<AuthenticateMessage> {
        if message.auth_method != "wampcra" {
            return Err(AuthenticationError::UnsupportedMethod(message.auth_method.clone()).into());
        }
        let credentials = match &self.credentials {
            Some(credentials) => credentials,
            None => return Err(AuthenticationError::MissingCredentials.into()),
        };
        let (challenge, key_params) = wampcra::challenge_params(message)?;
        // The secret is provided on demand, only now that it is needed.
        let secret = (credentials.secret)()?;
        let key = wampcra::derive_key(&secret, key_params.as_ref());
        let signature = wampcra::compute_signature(&key, &challenge)?;
        Ok(AuthenticateMessage {
            signature,
            extra: Dictionary::default(),
        })
    }

    async fn handle_sent_authenticate(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Welcome(message) => self.establish(message.session),
            message @ Message::Abort(_) => {
                self.transition_state(SessionState::Closed)?;
                self.established_session_tx
                    .send(Err((&message).try_into()?))?;
                Ok(())
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message after AUTHENTICATE",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_established(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Abort(_) => {
                warn!("Peer session for {} aborted by router: {message:?}", self.name);
                self.transition_state(SessionState::Closed)
            }
            Message::Goodbye(_) => {
                self.send_message(goodbye_and_out())?;
                self.transition_state(SessionState::Closed)
            }
            Message::Event(message) => {
                match self.subscriptions.get(&message.subscribed_subscription) {
                    Some(event_tx) => {
                        event_tx
                            .send(ReceivedEvent {
                                publication_id: message.published_publication,
                                arguments: message.publish_arguments,
                                arguments_keyword: message.publish_arguments_keyword,
                            })
                            .ok();
                    }
                    None => {
                        // An event can legitimately race an unsubscription.
                        debug!(
                            "Peer {} dropped event for unknown subscription {}",
                            self.name, message.subscribed_subscription
                        );
                    }
                }
                Ok(())
            }
            Message::Invocation(invocation) => {
                let invocation_tx = self
                    .procedures
                    .get(&invocation.registered_registration)
                    .cloned();
                match invocation_tx {
                    Some(invocation_tx) => {
                        invocation_tx
                            .send(Invocation {
                                request_id: invocation.request,
                                registration_id: invocation.registered_registration,
                                arguments: invocation.call_arguments,
                                arguments_keyword: invocation.call_arguments_keyword,
                            })
                            .ok();
                        Ok(())
                    }
                    None => self.send_message(error_for_request(
                        &Message::Invocation(invocation),
                        &InteractionError::NoSuchRegistration.into(),
                    )),
                }
            }
            Message::Subscribed(_)
            | Message::Unsubscribed(_)
            | Message::Published(_)
            | Message::Registered(_)
            | Message::Unregistered(_)
            | Message::Result(_)
            | Message::Error(_) => self.resolve_reply(message),
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an established session",
                message.message_name()
            ))
            .into()),
        }
    }

    /// Resolves a reply against the outstanding-request table.
    fn resolve_reply(&mut self, message: Message) -> Result<()> {
        let request_id = match message.request_id() {
            Some(request_id) => request_id,
            None => {
                return Err(InteractionError::ProtocolViolation(format!(
                    "{} reply carries no request id",
                    message.message_name()
                ))
                .into());
            }
        };
        let kind = match self.outstanding_requests.remove(&request_id) {
            Some(kind) => kind,
            None => {
                return Err(InteractionError::ProtocolViolation(format!(
                    "{} reply does not match any outstanding request",
                    message.message_name()
                ))
                .into());
            }
        };

        match (kind, message) {
            (RequestKind::Subscribe { topic }, Message::Subscribed(message)) => {
                debug!(
                    "Peer {} subscribed to {topic} as {}",
                    self.name, message.subscription
                );
                let (event_tx, _) = broadcast::channel(16);
                self.subscriptions
                    .insert(message.subscription, event_tx.clone());
                self.subscribed_tx
                    .send(Ok(peer_session_message::Subscribed {
                        request_id,
                        subscription_id: message.subscription,
                        event_rx: event_tx.subscribe(),
                    }))
                    .ok();
                Ok(())
            }
            (RequestKind::Unsubscribe { subscription_id }, Message::Unsubscribed(_)) => {
                self.subscriptions.remove(&subscription_id);
                self.unsubscribed_tx
                    .send(Ok(peer_session_message::Unsubscribed { request_id }))
                    .ok();
                Ok(())
            }
            (RequestKind::Publish, Message::Published(message)) => {
                self.published_tx
                    .send(Ok(peer_session_message::Published {
                        request_id,
                        publication_id: message.publication,
                    }))
                    .ok();
                Ok(())
            }
            (RequestKind::Register, Message::Registered(message)) => {
                let (invocation_tx, _) = broadcast::channel(16);
                self.procedures
                    .insert(message.registration, invocation_tx.clone());
                self.registered_tx
                    .send(Ok(peer_session_message::Registered {
                        request_id,
                        registration_id: message.registration,
                        invocation_rx: invocation_tx.subscribe(),
                    }))
                    .ok();
                Ok(())
            }
            (RequestKind::Unregister { registration_id }, Message::Unregistered(_)) => {
                self.procedures.remove(&registration_id);
                self.unregistered_tx
                    .send(Ok(peer_session_message::Unregistered { request_id }))
                    .ok();
                Ok(())
            }
            (RequestKind::Call, Message::Result(message)) => {
                self.rpc_result_tx
                    .send(Ok(peer_session_message::RpcResult {
                        request_id,
                        arguments: message.yield_arguments,
                        arguments_keyword: message.yield_arguments_keyword,
                    }))
                    .ok();
                Ok(())
            }
            (kind, message @ Message::Error(_)) => {
                let error = ChannelTransmittableError::try_from(&message)?;
                match kind {
                    RequestKind::Subscribe { .. } => {
                        self.subscribed_tx.send(Err(error)).ok();
                    }
                    RequestKind::Unsubscribe { .. } => {
                        self.unsubscribed_tx.send(Err(error)).ok();
                    }
                    RequestKind::Publish => {
                        self.published_tx.send(Err(error)).ok();
                    }
                    RequestKind::Register => {
                        self.registered_tx.send(Err(error)).ok();
                    }
                    RequestKind::Unregister { .. } => {
                        self.unregistered_tx.send(Err(error)).ok();
                    }
                    RequestKind::Call => {
                        self.rpc_result_tx.send(Err(error)).ok();
                    }
                }
                Ok(())
            }
            (_, message) => Err(InteractionError::ProtocolViolation(format!(
                "{} reply does not match the kind of its outstanding request",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_closing(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(_) => self.transition_state(SessionState::Closed),
            // Stray traffic can still arrive while the GOODBYE exchange is in
            // flight.
            _ => Ok(()),
        }
    }

    /// Forcibly finishes the session, if it is not already closed.
    ///
    /// Used when the transport dies without a GOODBYE exchange.
    pub fn finish(&mut self) {
        if !self.closed() {
            self.state = SessionState::Closed;
            self.on_closed();
        }
    }

    fn transition_state(&mut self, state: SessionState) -> Result<()> {
        if !self.state.allowed_state_transition(&state) {
            return Err(InteractionError::ProtocolViolation(format!(
                "invalid state transition from {} to {}",
                self.state.name(),
                state.name()
            ))
            .into());
        }

        trace!(
            "Peer {} transitioned from {} to {}",
            self.name,
            self.state.name(),
            state.name()
        );
        self.state = state;

        if self.closed() {
            self.on_closed();
        }

        Ok(())
    }

    fn on_closed(&mut self) {
        self.fail_outstanding_requests();
        self.subscriptions.clear();
        self.procedures.clear();
        self.credentials = None;
        self.closed_session_tx.send(()).ok();
    }

    /// Resolves every outstanding request with a session-closed error, so
    /// that no waiter is left pending forever.
    fn fail_outstanding_requests(&mut self) {
        let outstanding = std::mem::take(&mut self.outstanding_requests);
        for (request_id, kind) in outstanding {
            let error = ChannelTransmittableError {
                reason: Uri::for_error(&SessionClosedError.into()),
                message: SessionClosedError.to_string(),
                request_id: Some(request_id),
            };
            match kind {
                RequestKind::Subscribe { .. } => {
                    self.subscribed_tx.send(Err(error)).ok();
                }
                RequestKind::Unsubscribe { .. } => {
                    self.unsubscribed_tx.send(Err(error)).ok();
                }
                RequestKind::Publish => {
                    self.published_tx.send(Err(error)).ok();
                }
                RequestKind::Register => {
                    self.registered_tx.send(Err(error)).ok();
                }
                RequestKind::Unregister { .. } => {
                    self.unregistered_tx.send(Err(error)).ok();
                }
                RequestKind::Call => {
                    self.rpc_result_tx.send(Err(error)).ok();
                }
            }
        }
    }
}

/// Builds the YIELD message answering an invocation.
pub fn yield_for_invocation(invocation: &Invocation, rpc_yield: RpcYield) -> Message {
    Message::Yield(YieldMessage {
        invocation_request: invocation.request_id,
        options: Dictionary::default(),
        arguments: rpc_yield.arguments,
        arguments_keyword: rpc_yield.arguments_keyword,
    })
}

/// Builds the ERROR message answering an invocation whose handler failed.
pub fn error_for_invocation(invocation: &Invocation, error: &Error) -> Message {
    error_for_request(
        &Message::Invocation(InvocationMessage {
            request: invocation.request_id,
            registered_registration: invocation.registration_id,
            ..Default::default()
        }),
        error,
    )
}

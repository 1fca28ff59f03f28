use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use async_trait::async_trait;
use futures_util::lock::Mutex;
use log::{
    error,
    info,
    warn,
};
use thiserror::Error;
use tokio::sync::{
    broadcast::{
        self,
        error::RecvError,
    },
    mpsc::{
        UnboundedReceiver,
        UnboundedSender,
        unbounded_channel,
    },
};

use crate::{
    auth::ClientCredentials,
    core::{
        close::CloseReason,
        error::TimeoutError,
        hash::HashSet,
        id::{
            Id,
            IdAllocator,
        },
        kernel::Kernel,
        roles::PeerRole,
        service::{
            Service,
            ServiceHandle,
        },
        stream::{
            MessageStream,
            TransportMessageStream,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::goodbye_with_close_reason,
        message::{
            CallMessage,
            HelloMessage,
            Message,
            PublishMessage,
            RegisterMessage,
            SubscribeMessage,
            UnregisterMessage,
            UnsubscribeMessage,
        },
    },
    peer::{
        connector::connector::ConnectorFactory,
        session::{
            Event,
            Invocation,
            PeerCommand,
            ReceivedEvent,
            RpcYield,
            Session,
            SessionHandle,
            error_for_invocation,
            peer_session_message,
            yield_for_invocation,
        },
    },
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
    transport::{
        frame::{
            DEFAULT_MAX_MESSAGE_SIZE_EXP,
            FrameLimits,
        },
        transport::TransportFactory,
    },
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

const GOODBYE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`Peer`].
#[derive(Debug)]
pub struct PeerConfig {
    /// Name of the peer, mostly for logging.
    pub name: String,
    /// Agent name, communicated to the router.
    pub agent: String,
    /// Roles implemented by the peer.
    pub roles: HashSet<PeerRole>,
    /// Allowed serializers.
    ///
    /// The actual serializer is settled in the rawsocket handshake.
    pub serializers: HashSet<SerializerType>,
    /// The maximum-message-size exponent advertised in the handshake.
    pub max_message_size_exp: u8,
}

impl PeerConfig {
    fn validate(&self) -> Result<()> {
        if self.serializers.is_empty() {
            return Err(Error::msg("at least one serializer is required"));
        }
        Ok(())
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT.to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            roles: HashSet::from_iter([
                PeerRole::Callee,
                PeerRole::Caller,
                PeerRole::Publisher,
                PeerRole::Subscriber,
            ]),
            serializers: HashSet::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            max_message_size_exp: DEFAULT_MAX_MESSAGE_SIZE_EXP,
        }
    }
}

struct PeerState {
    service: ServiceHandle,
    session: SessionHandle,

    command_tx: UnboundedSender<PeerCommand>,
}

/// A subscription to a topic.
#[derive(Debug)]
pub struct Subscription {
    /// The subscription ID.
    pub id: Id,
    /// The event receiver channel.
    pub event_rx: broadcast::Receiver<ReceivedEvent>,
}

/// A procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A result of a procedure call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

/// A handler for invocations of a procedure registered by this peer.
///
/// The result, or error, is yielded back to the caller through the router.
#[async_trait]
pub trait ProcedureHandler: Send + Sync {
    async fn invoke(&self, call: RpcCall) -> Result<RpcYield>;
}

#[derive(Debug, Error)]
#[error("peer is not connected")]
pub struct PeerNotConnectedError;

/// A WAMP peer (a.k.a., client) that connects to a WAMP router, establishes
/// sessions in a realm, and interacts with resources in the realm.
pub struct Peer<S> {
    kernel: Arc<Kernel>,
    config: PeerConfig,
    connector_factory: Box<dyn ConnectorFactory<S>>,
    transport_factory: Box<dyn TransportFactory<S>>,

    session_finished_tx: broadcast::Sender<()>,
    drop_tx: broadcast::Sender<()>,

    peer_state: Arc<Mutex<Option<PeerState>>>,
}

impl<S> Peer<S>
where
    S: Send + 'static,
{
    /// Creates a new peer.
    pub fn new(
        kernel: Arc<Kernel>,
        config: PeerConfig,
        connector_factory: Box<dyn ConnectorFactory<S>>,
        transport_factory: Box<dyn TransportFactory<S>>,
    ) -> Result<Self> {
        config.validate()?;
        let (session_finished_tx, _) = broadcast::channel(16);
        let (drop_tx, _) = broadcast::channel(1);
        Ok(Self {
            kernel,
            config,
            connector_factory,
            transport_factory,
            session_finished_tx,
            drop_tx,
            peer_state: Arc::new(Mutex::new(None)),
        })
    }

    /// Receiver channel for a single session finishing, for reconnection
    /// logic.
    pub fn session_finished_rx(&self) -> broadcast::Receiver<()> {
        self.session_finished_tx.subscribe()
    }

    /// Connects to a router.
    ///
    /// This method establishes the network connection and completes the
    /// rawsocket handshake. It does not establish any WAMP session, so the
    /// connection can host consecutive sessions if the router allows.
    ///
    /// The connection and message service is maintained asynchronously. If
    /// the peer loses connection to the router, the connection is dropped in
    /// the background and methods depending on the connection will fail. The
    /// peer can reconnect to the router by calling this method again.
    pub async fn connect(&self, addr: &str) -> Result<()> {
        let connector = self.connector_factory.new_connector();
        let connection = connector.connect(&self.kernel, &self.config, addr).await?;
        info!(
            "WAMP connection established with {addr} for peer {}",
            self.config.name
        );

        let serializer = new_serializer(connection.serializer);
        let limits = FrameLimits {
            max_incoming_payload: connection.max_incoming_payload,
            max_outgoing_payload: connection.max_outgoing_payload,
            max_pending_write_bytes: self.kernel.config().socket_max_pending_write_bytes,
        };
        let transport = self
            .transport_factory
            .new_transport(connection.stream, limits);
        self.start_session(Box::new(TransportMessageStream::new(transport, serializer)))
            .await
    }

    async fn start_session(&self, stream: Box<dyn MessageStream>) -> Result<()> {
        let service = Service::new(self.config.name.clone(), stream);
        let (command_tx, command_rx) = unbounded_channel();
        let service_message_rx = service.message_rx();
        let end_rx = service.end_rx();
        let drop_rx = self.drop_tx.subscribe();

        let service_handle = service.start();

        let session = Session::new(self.config.name.clone(), service_handle.message_tx());
        let session_handle = session.session_handle();

        let mut peer_state = self.peer_state.lock().await;
        *peer_state = Some(PeerState {
            service: service_handle,
            session: session_handle,
            command_tx,
        });

        tokio::spawn(Self::message_handler(
            session,
            self.peer_state.clone(),
            self.session_finished_tx.clone(),
            command_rx,
            service_message_rx,
            end_rx,
            drop_rx,
        ));

        Ok(())
    }

    async fn message_handler(
        mut session: Session,
        peer_state: Arc<Mutex<Option<PeerState>>>,
        session_finished_tx: broadcast::Sender<()>,
        mut command_rx: UnboundedReceiver<PeerCommand>,
        service_message_rx: broadcast::Receiver<Message>,
        end_rx: broadcast::Receiver<()>,
        drop_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let result = Self::session_loop_with_errors(
                &mut session,
                &mut command_rx,
                service_message_rx.resubscribe(),
                end_rx.resubscribe(),
                drop_rx.resubscribe(),
            )
            .await;

            // Notify the outside world that a session finished, for
            // reconnection logic and for waiters that must not hang.
            session_finished_tx.send(()).ok();

            match result {
                Ok(done) => {
                    info!("Peer session {} finished", session.name());
                    if !done {
                        continue;
                    }
                }
                Err(err) => {
                    error!("Peer session {} failed: {err:#}", session.name());
                }
            }

            info!(
                "Peer session {} is disconnecting from the router",
                session.name()
            );
            break;
        }

        // Resolve anything still pending before the session object goes away.
        session.finish();
        peer_state.lock().await.take();
    }

    async fn session_loop_with_errors(
        session: &mut Session,
        command_rx: &mut UnboundedReceiver<PeerCommand>,
        mut service_message_rx: broadcast::Receiver<Message>,
        mut end_rx: broadcast::Receiver<()>,
        mut drop_rx: broadcast::Receiver<()>,
    ) -> Result<bool> {
        let mut finish_on_close = false;
        loop {
            tokio::select! {
                // Received a command from this peer object.
                command = command_rx.recv() => {
                    let command = match command {
                        Some(command) => command,
                        None => return Err(Error::msg("failed to receive command from peer channel (channel unexpectedly closed)")),
                    };
                    if let Err(err) = session.handle_command(command).await {
                        return Err(err.context("failed to send message"));
                    }
                }
                // Received a message from the service.
                message = service_message_rx.recv() => {
                    let message = match message {
                        Ok(message) => message,
                        Err(RecvError::Closed) => return Ok(true),
                        Err(err) => return Err(Error::new(err).context("failed to receive message")),
                    };
                    let message_name = message.message_name();
                    if let Err(err) = session.handle_message(message).await {
                        return Err(err.context(format!("failed to handle {message_name} message")));
                    }
                }
                // Service ended, which is unexpected.
                //
                // The service is intended to wrap the session's entire lifecycle.
                _ = end_rx.recv() => return Err(Error::msg("service ended abruptly")),
                // Peer was dropped, which is unexpected.
                _ = drop_rx.recv() => return Err(Error::msg("peer dropped unexpectedly")),
            }

            if session.closed() {
                if finish_on_close {
                    break;
                }
            } else {
                finish_on_close = true;
            }
        }
        Ok(false)
    }

    async fn get_from_peer_state<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: Fn(&PeerState) -> T,
    {
        match self.peer_state.lock().await.as_ref() {
            Some(peer_state) => Ok(f(peer_state)),
            None => Err(PeerNotConnectedError.into()),
        }
    }

    fn hello_details(&self, credentials: Option<&ClientCredentials>) -> Dictionary {
        let mut details = Dictionary::default();
        details.insert("agent".to_owned(), Value::String(self.config.agent.clone()));
        details.insert(
            "roles".to_owned(),
            Value::Dictionary(
                self.config
                    .roles
                    .iter()
                    .map(|role| {
                        (
                            role.key_for_details().to_owned(),
                            Value::Dictionary(Dictionary::default()),
                        )
                    })
                    .collect(),
            ),
        );
        if let Some(credentials) = credentials {
            details.insert(
                "authid".to_owned(),
                Value::String(credentials.auth_id.clone()),
            );
            details.insert(
                "authmethods".to_owned(),
                Value::List(
                    credentials
                        .auth_methods
                        .iter()
                        .map(|method| Value::String(method.name().to_owned()))
                        .collect(),
                ),
            );
        }
        details
    }

    /// Joins the realm, establishing a WAMP session.
    ///
    /// The session exists for as long as the router allows it to. The session
    /// will be lost in the following scenarios:
    /// 1. [`Self::leave_realm`] is called.
    /// 1. The router terminates the session due to an error.
    /// 1. The underlying connection to the router is lost.
    ///
    /// To join a different realm, [`Self::leave_realm`] should be called
    /// first.
    pub async fn join_realm(
        &self,
        realm: &str,
    ) -> Result<peer_session_message::EstablishedSession> {
        self.join_realm_internal(realm, None).await
    }

    /// Joins the realm, authenticating with the given credentials.
    ///
    /// The router's CHALLENGE is answered with a signature derived from the
    /// credentials' secret; the secret provider is invoked only when the
    /// challenge arrives.
    pub async fn join_realm_with_credentials(
        &self,
        realm: &str,
        credentials: ClientCredentials,
    ) -> Result<peer_session_message::EstablishedSession> {
        self.join_realm_internal(realm, Some(credentials)).await
    }

    async fn join_realm_internal(
        &self,
        realm: &str,
        credentials: Option<ClientCredentials>,
    ) -> Result<peer_session_message::EstablishedSession> {
        let (command_tx, mut established_session_rx) = self
            .get_from_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.established_session_rx(),
                )
            })
            .await?;

        let details = self.hello_details(credentials.as_ref());
        command_tx.send(PeerCommand::Hello(
            HelloMessage {
                realm: Uri::try_from(realm)?,
                details,
            },
            credentials,
        ))?;

        let mut session_finished_rx = self.session_finished_rx();
        let wait_for_welcome = async {
            tokio::select! {
                // Prefer the reply channel so a request resolved at close
                // time surfaces its own error.
                biased;
                result = established_session_rx.recv() => {
                    result
                        .map_err(Error::new)?
                        .map_err(|err| Into::<Error>::into(err))
                }
                _ = session_finished_rx.recv() => {
                    Err(PeerNotConnectedError.into())
                }
            }
        };
        let result =
            match tokio::time::timeout(self.kernel.config().session_open_timeout, wait_for_welcome)
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(TimeoutError.into()),
            };

        if result.realm.as_ref() != realm {
            return Err(Error::msg(format!(
                "joined realm {}, expected {realm}",
                result.realm
            )));
        }

        Ok(result)
    }

    /// Leaves the realm, closing the WAMP session.
    ///
    /// The GOODBYE exchange is bounded: if the router does not answer within
    /// the grace period, the connection is dropped.
    pub async fn leave_realm(&self) -> Result<()> {
        let (command_tx, mut closed_session_rx) = self
            .get_from_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.closed_session_rx(),
                )
            })
            .await?;

        command_tx.send(PeerCommand::Send(goodbye_with_close_reason(
            CloseReason::Normal,
        )))?;
        match tokio::time::timeout(GOODBYE_TIMEOUT, closed_session_rx.recv()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(
                    "Peer {} timed out waiting for the router's GOODBYE; disconnecting",
                    self.config.name
                );
                self.disconnect().await
            }
        }
    }

    /// Disconnects from the router.
    pub async fn disconnect(&self) -> Result<()> {
        let mut peer_state = self.peer_state.lock().await;

        if let Some(peer_state) = peer_state.take() {
            info!(
                "Peer {} was instructed to disconnect from the router",
                self.config.name
            );
            peer_state.service.cancel()?;
            peer_state.service.join().await?;
        }
        Ok(())
    }

    /// Subscribes to a topic in the realm.
    ///
    /// The resulting subscription contains an event receiver stream for
    /// published events. The stream automatically closes when the peer
    /// unsubscribes from the topic or when the session ends.
    pub async fn subscribe(&self, topic: Uri) -> Result<Subscription> {
        let (command_tx, id_allocator, mut subscribed_rx) = self
            .get_from_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.id_allocator(),
                    peer_state.session.subscribed_rx(),
                )
            })
            .await?;
        let request_id = id_allocator.generate_id().await;

        command_tx.send(PeerCommand::Send(Message::Subscribe(SubscribeMessage {
            request: request_id,
            options: Dictionary::default(),
            topic,
        })))?;

        let mut session_finished_rx = self.session_finished_rx();
        loop {
            tokio::select! {
                // Prefer the reply channel so a request resolved at close
                // time surfaces its own error.
                biased;
                subscription = subscribed_rx.recv() => {
                    match subscription.map_err(Error::new)? {
                        Ok(subscription) => {
                            if subscription.request_id == request_id {
                                return Ok(Subscription {
                                    id: subscription.subscription_id,
                                    event_rx: subscription.event_rx,
                                });
                            }
                        }
                        Err(err) => {
                            if err.request_id.is_some_and(|id| id == request_id) {
                                return Err(err.into());
                            }
                        }
                    }
                }
                _ = session_finished_rx.recv() => {
                    return Err(PeerNotConnectedError.into());
                }
            }
        }
    }

    /// Removes a subscription.
    ///
    /// The subscription ID is received after subscribing to the topic.
    pub async fn unsubscribe(&self, id: Id) -> Result<()> {
        let (command_tx, id_allocator, mut unsubscribed_rx) = self
            .get_from_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.id_allocator(),
                    peer_state.session.unsubscribed_rx(),
                )
            })
            .await?;
        let request_id = id_allocator.generate_id().await;

        command_tx.send(PeerCommand::Send(Message::Unsubscribe(UnsubscribeMessage {
            request: request_id,
            subscribed_subscription: id,
        })))?;

        let mut session_finished_rx = self.session_finished_rx();
        loop {
            tokio::select! {
                // Prefer the reply channel so a request resolved at close
                // time surfaces its own error.
                biased;
                unsubscription = unsubscribed_rx.recv() => {
                    match unsubscription.map_err(Error::new)? {
                        Ok(unsubscription) => {
                            if unsubscription.request_id == request_id {
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            if err.request_id.is_some_and(|id| id == request_id) {
                                return Err(err.into());
                            }
                        }
                    }
                }
                _ = session_finished_rx.recv() => {
                    return Err(PeerNotConnectedError.into());
                }
            }
        }
    }

    /// Publishes an event to a topic, waiting for the router's
    /// acknowledgement.
    ///
    /// Returns the publication ID assigned by the router.
    pub async fn publish(&self, topic: Uri, event: Event) -> Result<Id> {
        let (command_tx, id_allocator, mut published_rx) = self
            .get_from_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.id_allocator(),
                    peer_state.session.published_rx(),
                )
            })
            .await?;
        let request_id = id_allocator.generate_id().await;

        command_tx.send(PeerCommand::Send(Message::Publish(PublishMessage {
            request: request_id,
            options: Dictionary::from_iter([("acknowledge".to_owned(), Value::Bool(true))]),
            topic,
            arguments: event.arguments,
            arguments_keyword: event.arguments_keyword,
        })))?;

        let mut session_finished_rx = self.session_finished_rx();
        loop {
            tokio::select! {
                // Prefer the reply channel so a request resolved at close
                // time surfaces its own error.
                biased;
                publication = published_rx.recv() => {
                    match publication.map_err(Error::new)? {
                        Ok(publication) => {
                            if publication.request_id == request_id {
                                return Ok(publication.publication_id);
                            }
                        }
                        Err(err) => {
                            if err.request_id.is_some_and(|id| id == request_id) {
                                return Err(err.into());
                            }
                        }
                    }
                }
                _ = session_finished_rx.recv() => {
                    return Err(PeerNotConnectedError.into());
                }
            }
        }
    }

    /// Publishes an event to a topic without waiting for an acknowledgement.
    pub async fn publish_unacknowledged(&self, topic: Uri, event: Event) -> Result<()> {
        let (command_tx, id_allocator) = self
            .get_from_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.id_allocator(),
                )
            })
            .await?;
        let request_id = id_allocator.generate_id().await;

        command_tx.send(PeerCommand::Send(Message::Publish(PublishMessage {
            request: request_id,
            options: Dictionary::default(),
            topic,
            arguments: event.arguments,
            arguments_keyword: event.arguments_keyword,
        })))?;
        Ok(())
    }

    /// Registers a procedure to an endpoint.
    ///
    /// The handler is invoked for every INVOCATION of the procedure; its
    /// result (or error) is yielded back to the caller. The handler stops
    /// being invoked when the peer unregisters the procedure or when the
    /// session ends.
    pub async fn register(&self, procedure: Uri, handler: Box<dyn ProcedureHandler>) -> Result<Id> {
        let (command_tx, id_allocator, mut registered_rx) = self
            .get_from_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.id_allocator(),
                    peer_state.session.registered_rx(),
                )
            })
            .await?;
        let request_id = id_allocator.generate_id().await;

        command_tx.send(PeerCommand::Send(Message::Register(RegisterMessage {
            request: request_id,
            options: Dictionary::default(),
            procedure,
        })))?;

        let mut session_finished_rx = self.session_finished_rx();
        let registration = loop {
            tokio::select! {
                // Prefer the reply channel so a request resolved at close
                // time surfaces its own error.
                biased;
                registration = registered_rx.recv() => {
                    match registration.map_err(Error::new)? {
                        Ok(registration) => {
                            if registration.request_id == request_id {
                                break registration;
                            }
                        }
                        Err(err) => {
                            if err.request_id.is_some_and(|id| id == request_id) {
                                return Err(err.into());
                            }
                        }
                    }
                }
                _ = session_finished_rx.recv() => {
                    return Err(PeerNotConnectedError.into());
                }
            }
        };

        tokio::spawn(Self::serve_procedure(
            handler,
            registration.invocation_rx,
            command_tx,
        ));
        Ok(registration.registration_id)
    }

    async fn serve_procedure(
        handler: Box<dyn ProcedureHandler>,
        mut invocation_rx: broadcast::Receiver<Invocation>,
        command_tx: UnboundedSender<PeerCommand>,
    ) {
        loop {
            let invocation = match invocation_rx.recv().await {
                Ok(invocation) => invocation,
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Procedure handler fell behind; {missed} invocations were dropped");
                    continue;
                }
            };
            let call = RpcCall {
                arguments: invocation.arguments.clone(),
                arguments_keyword: invocation.arguments_keyword.clone(),
            };
            let message = match handler.invoke(call).await {
                Ok(rpc_yield) => yield_for_invocation(&invocation, rpc_yield),
                Err(err) => error_for_invocation(&invocation, &err),
            };
            if command_tx.send(PeerCommand::Send(message)).is_err() {
                break;
            }
        }
    }

    /// Removes a procedure.
    ///
    /// The registration ID is received after registering the procedure.
    pub async fn unregister(&self, id: Id) -> Result<()> {
        let (command_tx, id_allocator, mut unregistered_rx) = self
            .get_from_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.id_allocator(),
                    peer_state.session.unregistered_rx(),
                )
            })
            .await?;
        let request_id = id_allocator.generate_id().await;

        command_tx.send(PeerCommand::Send(Message::Unregister(UnregisterMessage {
            request: request_id,
            registered_registration: id,
        })))?;

        let mut session_finished_rx = self.session_finished_rx();
        loop {
            tokio::select! {
                // Prefer the reply channel so a request resolved at close
                // time surfaces its own error.
                biased;
                unregistration = unregistered_rx.recv() => {
                    match unregistration.map_err(Error::new)? {
                        Ok(unregistration) => {
                            if unregistration.request_id == request_id {
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            if err.request_id.is_some_and(|id| id == request_id) {
                                return Err(err.into());
                            }
                        }
                    }
                }
                _ = session_finished_rx.recv() => {
                    return Err(PeerNotConnectedError.into());
                }
            }
        }
    }

    /// Calls a procedure and waits for its result.
    pub async fn call(&self, procedure: Uri, rpc_call: RpcCall) -> Result<RpcResult> {
        let (command_tx, id_allocator, mut rpc_result_rx) = self
            .get_from_peer_state(|peer_state| {
                (
                    peer_state.command_tx.clone(),
                    peer_state.session.id_allocator(),
                    peer_state.session.rpc_result_rx(),
                )
            })
            .await?;
        let request_id = id_allocator.generate_id().await;

        command_tx.send(PeerCommand::Send(Message::Call(CallMessage {
            request: request_id,
            options: Dictionary::default(),
            procedure,
            arguments: rpc_call.arguments,
            arguments_keyword: rpc_call.arguments_keyword,
        })))?;

        let mut session_finished_rx = self.session_finished_rx();
        loop {
            tokio::select! {
                // Prefer the reply channel so a request resolved at close
                // time surfaces its own error.
                biased;
                rpc_result = rpc_result_rx.recv() => {
                    match rpc_result.map_err(Error::new)? {
                        Ok(rpc_result) => {
                            if rpc_result.request_id == request_id {
                                return Ok(RpcResult {
                                    arguments: rpc_result.arguments,
                                    arguments_keyword: rpc_result.arguments_keyword,
                                });
                            }
                        }
                        Err(err) => {
                            if err.request_id.is_some_and(|id| id == request_id) {
                                return Err(err.into());
                            }
                        }
                    }
                }
                _ = session_finished_rx.recv() => {
                    return Err(PeerNotConnectedError.into());
                }
            }
        }
    }
}

impl<S> Drop for Peer<S> {
    fn drop(&mut self) {
        self.drop_tx.send(()).ok();
    }
}

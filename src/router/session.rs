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
        CraUser,
        Identity,
        wampcra,
    },
    core::{
        close::CloseReason,
        error::{
            AuthenticationError,
            BasicError,
            InteractionError,
        },
        id::Id,
        roles::RouterRole,
        types::{
            Dictionary,
            Value,
        },
        uri::Uri,
    },
    message::{
        common::{
            abort_message_for_error,
            error_for_request,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            AuthenticateMessage,
            CallMessage,
            ChallengeMessage,
            ErrorMessage,
            HelloMessage,
            InvocationMessage,
            Message,
            PublishMessage,
            PublishedMessage,
            RegisterMessage,
            RegisteredMessage,
            ResultMessage,
            SubscribeMessage,
            SubscribedMessage,
            UnregisterMessage,
            UnregisteredMessage,
            UnsubscribeMessage,
            UnsubscribedMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
    router::{
        context::RouterContext,
        rpc::{
            InternalRpcCall,
            RpcEndpoint,
        },
        topic::PubSubManager,
    },
};

const CALL_MESSAGE_TAG: u64 = 48;
const INVOCATION_MESSAGE_TAG: u64 = 68;

#[derive(Debug, Clone)]
struct ChallengedState {
    realm: Uri,
    auth_id: String,
    user: CraUser,
    challenge: String,
}

#[derive(Debug, Clone)]
struct EstablishedState {
    realm: Uri,
    identity: Identity,
}

/// The router-side session state machine.
#[derive(Debug, Default, Clone)]
enum SessionState {
    #[default]
    Closed,
    Challenged(ChallengedState),
    Established(EstablishedState),
    Closing,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Challenged(_) => "Challenged",
            Self::Established(_) => "Established",
            Self::Closing => "Closing",
        }
    }

    fn allowed_state_transition(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Closed, Self::Challenged(_))
                | (Self::Closed, Self::Established(_))
                | (Self::Challenged(_), Self::Established(_))
                | (Self::Challenged(_), Self::Closed)
                | (Self::Established(_), Self::Closing)
                | (Self::Established(_), Self::Closed)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// A handle to a router session, usable as a registry value.
pub struct SessionHandle {
    message_tx: UnboundedSender<Message>,
    closed_session_rx: broadcast::Receiver<()>,
}

impl SessionHandle {
    pub fn close(&self, close_reason: CloseReason) -> Result<()> {
        self.message_tx
            .send(goodbye_with_close_reason(close_reason))
            .map_err(Error::new)
    }

    pub fn closed_session_rx_mut(&mut self) -> &mut broadcast::Receiver<()> {
        &mut self.closed_session_rx
    }
}

/// A single session on the router side of a connection.
///
/// The session owns the WAMP state machine for its connection and mediates
/// between the wire and the router's registries. EVENT, INVOCATION, and
/// RESULT messages destined for this session arrive on its message channel
/// and leave through the connection's service.
pub struct Session {
    id: Id,
    message_tx: UnboundedSender<Message>,
    service_message_tx: UnboundedSender<Message>,
    state: SessionState,
    // The realm joined at WELCOME, remembered past the session's close so
    // clean-up can find it.
    joined_realm: Option<Uri>,

    closed_session_tx: broadcast::Sender<()>,
}

impl Session {
    pub fn new(
        id: Id,
        message_tx: UnboundedSender<Message>,
        service_message_tx: UnboundedSender<Message>,
    ) -> Self {
        let (closed_session_tx, _) = broadcast::channel(16);
        Self {
            id,
            message_tx,
            service_message_tx,
            state: SessionState::default(),
            joined_realm: None,
            closed_session_tx,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            message_tx: self.message_tx.clone(),
            closed_session_rx: self.closed_session_tx.subscribe(),
        }
    }

    fn established_state(&self) -> Result<&EstablishedState> {
        match &self.state {
            SessionState::Established(state) => Ok(state),
            _ => Err(Error::msg("session is not in the established state")),
        }
    }

    /// Sends a message to the peer, tracking session state.
    pub fn send_message(&mut self, message: Message) -> Result<()> {
        self.transition_state_from_sending_message(&message)?;
        self.service_message_tx.send(message).map_err(Error::new)
    }

    fn transition_state_from_sending_message(&mut self, message: &Message) -> Result<()> {
        let next_state = match message {
            Message::Abort(_) => SessionState::Closed,
            Message::Goodbye(_) => match self.state {
                SessionState::Closing => SessionState::Closed,
                _ => SessionState::Closing,
            },
            _ => return Ok(()),
        };
        self.transition_state(next_state)
    }

    /// Handles a message from the peer.
    ///
    /// Errors that escape this method are protocol-fatal: an ABORT has been
    /// sent and the session is finished. Request-scoped failures are
    /// answered with ERROR messages instead.
    pub async fn handle_message<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        trace!("Received message for session {}: {message:?}", self.id);
        if let Err(err) = self.handle_message_on_state_machine(context, message).await {
            self.send_message(abort_message_for_error(&err))?;
            return Err(err);
        }
        Ok(())
    }

    async fn handle_message_on_state_machine<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        match &self.state {
            SessionState::Closed => self.handle_closed(context, message).await,
            SessionState::Challenged(_) => self.handle_challenged(context, message).await,
            SessionState::Established(_) => self.handle_established(context, message).await,
            SessionState::Closing => self.handle_closing(message).await,
        }
    }

    async fn handle_closed<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::Hello(message) => self.handle_hello(context, message).await,
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message before session establishment",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_hello<S>(
        &mut self,
        context: &RouterContext<S>,
        message: HelloMessage,
    ) -> Result<()> {
        if context
            .router()
            .realm_manager
            .get(&message.realm)
            .is_none()
        {
            return Err(InteractionError::NoSuchRealm.into());
        }

        let user_database = match &context.router().config.user_database {
            Some(user_database) => user_database,
            None => {
                // Open access: no challenge, straight to WELCOME.
                return self
                    .establish(context, message.realm.clone(), Identity::default())
                    .await;
            }
        };

        let auth_id = match message.details.get("authid").and_then(Value::string) {
            Some(auth_id) => auth_id.to_owned(),
            None => return Err(AuthenticationError::MissingCredentials.into()),
        };
        let offers_wampcra = message
            .details
            .get("authmethods")
            .and_then(Value::list)
            .map(|methods| {
                methods
                    .iter()
                    .any(|method| method.string() == Some("wampcra"))
            })
            .unwrap_or(false);
        if !offers_wampcra {
            return Err(AuthenticationError::UnsupportedMethod(
                "peer offered no authentication method the router supports".to_owned(),
            )
            .into());
        }

        let user = user_database.user(&message.realm, &auth_id).await?;
        let challenge = serde_json::to_string(&wampcra::ChallengeString::new(
            &auth_id, &user.role, self.id,
        ))?;

        self.send_message(Message::Challenge(ChallengeMessage {
            auth_method: "wampcra".to_owned(),
            extra: wampcra::challenge_extra(&challenge, user.key_derivation.as_ref()),
        }))?;
        self.transition_state(SessionState::Challenged(ChallengedState {
            realm: message.realm,
            auth_id,
            user,
            challenge,
        }))
    }

    async fn handle_challenged<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::Authenticate(message) => self.handle_authenticate(context, message).await,
            Message::Abort(_) => {
                warn!("Session {} aborted by peer during authentication", self.id);
                self.transition_state(SessionState::Closed)
            }
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message while awaiting AUTHENTICATE",
                message.message_name()
            ))
            .into()),
        }
    }

    async fn handle_authenticate<S>(
        &mut self,
        context: &RouterContext<S>,
        message: AuthenticateMessage,
    ) -> Result<()> {
        let state = match &self.state {
            SessionState::Challenged(state) => state.clone(),
            _ => return Err(Error::msg("session is not in the challenged state")),
        };

        let key = wampcra::derive_key(&state.user.secret, state.user.key_derivation.as_ref());
        let expected = wampcra::compute_signature(&key, &state.challenge)?;
        if message.signature != expected {
            info!("Session {} failed wampcra for {}", self.id, state.auth_id);
            return Err(AuthenticationError::BadSignature.into());
        }

        info!(
            "Session {} authenticated as {} ({})",
            self.id, state.auth_id, state.user.role
        );
        self.establish(
            context,
            state.realm.clone(),
            Identity {
                id: state.auth_id.clone(),
                role: state.user.role.clone(),
            },
        )
        .await
    }

    async fn establish<S>(
        &mut self,
        context: &RouterContext<S>,
        realm: Uri,
        identity: Identity,
    ) -> Result<()> {
        let realm_entry = match context.router().realm_manager.get(&realm) {
            Some(realm_entry) => realm_entry,
            None => return Err(InteractionError::NoSuchRealm.into()),
        };
        realm_entry
            .sessions
            .lock()
            .await
            .insert(self.id, self.session_handle());
        info!("Session {} joined realm {realm}", self.id);

        let mut details = Dictionary::default();
        details.insert(
            "agent".to_owned(),
            Value::String(context.router().config.agent.clone()),
        );
        details.insert(
            "roles".to_owned(),
            Value::Dictionary(
                context
                    .router()
                    .config
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
        if !identity.id.is_empty() {
            details.insert("authid".to_owned(), Value::String(identity.id.clone()));
            details.insert("authrole".to_owned(), Value::String(identity.role.clone()));
            details.insert("authmethod".to_owned(), Value::String("wampcra".to_owned()));
        }

        self.send_message(Message::Welcome(WelcomeMessage {
            session: self.id,
            details,
        }))?;
        self.joined_realm = Some(realm.clone());
        self.transition_state(SessionState::Established(EstablishedState {
            realm,
            identity,
        }))
    }

    async fn handle_established<S>(
        &mut self,
        context: &RouterContext<S>,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::Abort(_) => {
                warn!("Router session {} aborted by peer: {message:?}", self.id);
                self.transition_state(SessionState::Closed)
            }
            Message::Goodbye(_) => {
                self.send_message(goodbye_and_out())?;
                self.transition_state(SessionState::Closed)
            }
            Message::Subscribe(message) => self.handle_subscribe(context, message).await,
            Message::Unsubscribe(message) => self.handle_unsubscribe(context, message).await,
            Message::Publish(message) => self.handle_publish(context, message).await,
            Message::Register(message) => self.handle_register(context, message).await,
            Message::Unregister(message) => self.handle_unregister(context, message).await,
            Message::Call(message) => self.handle_call(context, message).await,
            Message::Yield(message) => self.handle_yield(context, message).await,
            Message::Error(message) => self.handle_error(context, message).await,
            _ => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on an established session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn require_role<S>(&self, context: &RouterContext<S>, role: RouterRole) -> Result<()> {
        if !context.router().config.roles.contains(&role) {
            return Err(BasicError::NotAllowed(format!(
                "router is not a {}",
                role.key_for_details()
            ))
            .into());
        }
        Ok(())
    }

    async fn handle_subscribe<S>(
        &mut self,
        context: &RouterContext<S>,
        message: SubscribeMessage,
    ) -> Result<()> {
        let realm = self.established_state()?.realm.clone();
        let result = async {
            self.require_role(context, RouterRole::Broker)?;
            context
                .router()
                .pub_sub_manager
                .subscribe(&realm, self.id, self.message_tx.clone(), message.topic.clone())
                .await
        }
        .await;
        match result {
            Ok((subscription_id, cached)) => {
                self.send_message(Message::Subscribed(SubscribedMessage {
                    subscribe_request: message.request,
                    subscription: subscription_id,
                }))?;
                // A late subscriber sees the retained payload as its first
                // event, right behind the subscription confirmation.
                if let Some(cached) = cached {
                    self.send_message(PubSubManager::replay_event(subscription_id, cached))?;
                }
                Ok(())
            }
            Err(err) => self.send_message(error_for_request(&Message::Subscribe(message), &err)),
        }
    }

    async fn handle_unsubscribe<S>(
        &mut self,
        context: &RouterContext<S>,
        message: UnsubscribeMessage,
    ) -> Result<()> {
        let realm = self.established_state()?.realm.clone();
        let result = context
            .router()
            .pub_sub_manager
            .unsubscribe(&realm, self.id, message.subscribed_subscription)
            .await;
        match result {
            Ok(()) => self.send_message(Message::Unsubscribed(UnsubscribedMessage {
                unsubscribe_request: message.request,
            })),
            Err(err) => self.send_message(error_for_request(&Message::Unsubscribe(message), &err)),
        }
    }

    async fn handle_publish<S>(
        &mut self,
        context: &RouterContext<S>,
        message: PublishMessage,
    ) -> Result<()> {
        let realm = self.established_state()?.realm.clone();
        let acknowledge = matches!(
            message.options.get("acknowledge"),
            Some(Value::Bool(true))
        );
        let result = async {
            self.require_role(context, RouterRole::Broker)?;
            context
                .router()
                .pub_sub_manager
                .publish(
                    &realm,
                    self.id,
                    message.topic.clone(),
                    message.arguments.clone(),
                    message.arguments_keyword.clone(),
                )
                .await
        }
        .await;
        match result {
            Ok(publication_id) => {
                if acknowledge {
                    self.send_message(Message::Published(PublishedMessage {
                        publish_request: message.request,
                        publication: publication_id,
                    }))?;
                }
                Ok(())
            }
            Err(err) => {
                if acknowledge {
                    self.send_message(error_for_request(&Message::Publish(message), &err))
                } else {
                    debug!(
                        "Dropped unacknowledged publish from session {}: {err:#}",
                        self.id
                    );
                    Ok(())
                }
            }
        }
    }

    async fn handle_register<S>(
        &mut self,
        context: &RouterContext<S>,
        message: RegisterMessage,
    ) -> Result<()> {
        let realm = self.established_state()?.realm.clone();
        let result = async {
            self.require_role(context, RouterRole::Dealer)?;
            context
                .router()
                .rpc_manager
                .register(
                    &realm,
                    self.id,
                    self.message_tx.clone(),
                    message.procedure.clone(),
                )
                .await
        }
        .await;
        match result {
            Ok(registration_id) => self.send_message(Message::Registered(RegisteredMessage {
                register_request: message.request,
                registration: registration_id,
            })),
            Err(err) => self.send_message(error_for_request(&Message::Register(message), &err)),
        }
    }

    async fn handle_unregister<S>(
        &mut self,
        context: &RouterContext<S>,
        message: UnregisterMessage,
    ) -> Result<()> {
        let realm = self.established_state()?.realm.clone();
        let result = context
            .router()
            .rpc_manager
            .unregister(&realm, self.id, message.registered_registration)
            .await;
        match result {
            Ok(()) => self.send_message(Message::Unregistered(UnregisteredMessage {
                unregister_request: message.request,
            })),
            Err(err) => self.send_message(error_for_request(&Message::Unregister(message), &err)),
        }
    }

    async fn handle_call<S>(
        &mut self,
        context: &RouterContext<S>,
        message: CallMessage,
    ) -> Result<()> {
        let realm = self.established_state()?.realm.clone();
        if let Err(err) = self.require_role(context, RouterRole::Dealer) {
            return self.send_message(error_for_request(&Message::Call(message), &err));
        }
        let registration = context
            .router()
            .rpc_manager
            .lookup(&realm, &message.procedure)
            .await;
        let registration = match registration {
            Some(registration) => registration,
            None => {
                return self.send_message(error_for_request(
                    &Message::Call(message),
                    &InteractionError::NoSuchProcedure.into(),
                ));
            }
        };

        match registration.endpoint {
            RpcEndpoint::Internal { handler } => {
                let result = handler
                    .invoke(InternalRpcCall {
                        arguments: message.arguments.clone(),
                        arguments_keyword: message.arguments_keyword.clone(),
                    })
                    .await;
                match result {
                    Ok(rpc_yield) => self.send_message(Message::Result(ResultMessage {
                        call_request: message.request,
                        details: Dictionary::default(),
                        yield_arguments: rpc_yield.arguments,
                        yield_arguments_keyword: rpc_yield.arguments_keyword,
                    })),
                    Err(err) => {
                        self.send_message(error_for_request(&Message::Call(message), &err))
                    }
                }
            }
            RpcEndpoint::Callee {
                session: callee,
                invocation_tx,
            } => {
                let invocation_id = context
                    .router()
                    .rpc_manager
                    .begin_invocation(self.id, self.message_tx.clone(), message.request)
                    .await;
                let invocation = Message::Invocation(InvocationMessage {
                    request: invocation_id,
                    registered_registration: registration.registration_id,
                    details: Dictionary::default(),
                    call_arguments: message.arguments.clone(),
                    call_arguments_keyword: message.arguments_keyword.clone(),
                });
                if invocation_tx.send(invocation).is_err() {
                    debug!(
                        "Callee session {callee} is gone; failing call {} from session {}",
                        message.request, self.id
                    );
                    context
                        .router()
                        .rpc_manager
                        .complete_invocation(invocation_id)
                        .await;
                    return self.send_message(error_for_request(
                        &Message::Call(message),
                        &InteractionError::NoSuchProcedure.into(),
                    ));
                }
                Ok(())
            }
        }
    }

    async fn handle_yield<S>(
        &mut self,
        context: &RouterContext<S>,
        message: YieldMessage,
    ) -> Result<()> {
        let pending = context
            .router()
            .rpc_manager
            .complete_invocation(message.invocation_request)
            .await;
        match pending {
            Some(pending) => {
                // The caller may have closed concurrently; its loss.
                pending
                    .caller_tx
                    .send(Message::Result(ResultMessage {
                        call_request: pending.call_request,
                        details: Dictionary::default(),
                        yield_arguments: message.arguments,
                        yield_arguments_keyword: message.arguments_keyword,
                    }))
                    .ok();
            }
            None => {
                debug!(
                    "Session {} yielded for unknown invocation {}",
                    self.id, message.invocation_request
                );
            }
        }
        Ok(())
    }

    async fn handle_error<S>(
        &mut self,
        context: &RouterContext<S>,
        message: ErrorMessage,
    ) -> Result<()> {
        if message.request_type != INVOCATION_MESSAGE_TAG {
            return Err(InteractionError::ProtocolViolation(format!(
                "received ERROR for unexpected request type {}",
                message.request_type
            ))
            .into());
        }
        let pending = context
            .router()
            .rpc_manager
            .complete_invocation(message.request)
            .await;
        match pending {
            Some(pending) => {
                pending
                    .caller_tx
                    .send(Message::Error(ErrorMessage {
                        request_type: CALL_MESSAGE_TAG,
                        request: pending.call_request,
                        details: message.details,
                        error: message.error,
                        arguments: message.arguments,
                        arguments_keyword: message.arguments_keyword,
                    }))
                    .ok();
            }
            None => {
                debug!(
                    "Session {} sent an error for unknown invocation {}",
                    self.id, message.request
                );
            }
        }
        Ok(())
    }

    async fn handle_closing(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(_) => self.transition_state(SessionState::Closed),
            // Traffic already in flight when we sent GOODBYE is dropped.
            _ => Ok(()),
        }
    }

    fn transition_state(&mut self, state: SessionState) -> Result<()> {
        if !self.state.allowed_state_transition(&state) {
            return Err(BasicError::Internal(format!(
                "invalid state transition from {} to {}",
                self.state.name(),
                state.name()
            ))
            .into());
        }

        trace!(
            "Router session {} transitioned from {} to {}",
            self.id,
            self.state.name(),
            state.name()
        );
        self.state = state;

        if self.closed() {
            self.closed_session_tx.send(()).ok();
        }

        Ok(())
    }

    /// Cleans up everything the router holds for this session: its realm
    /// membership, its registrations, and its subscriptions.
    pub async fn clean_up<S>(self, context: &RouterContext<S>) {
        if let Some(realm) = &self.joined_realm {
            if let Some(realm) = context.router().realm_manager.get(realm) {
                realm.sessions.lock().await.remove(&self.id);
            }
        }
        context.router().rpc_manager.session_closed(self.id).await;
        context.router().pub_sub_manager.session_closed(self.id).await;
    }
}

use std::{
    net::{
        IpAddr,
        Ipv4Addr,
        SocketAddr,
    },
    sync::Arc,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::lock::Mutex;
use log::{
    debug,
    error,
    info,
};
use tokio::{
    net::{
        TcpListener,
        TcpStream,
    },
    sync::broadcast,
    task::JoinHandle,
};

use crate::{
    auth::CraUserDatabase,
    core::{
        close::CloseReason,
        error::InteractionError,
        hash::HashSet,
        id::{
            Id,
            IdAllocator,
            RandomIdAllocator,
        },
        kernel::Kernel,
        roles::RouterRole,
        service::Service,
        stream::TransportMessageStream,
        uri::Uri,
    },
    router::{
        acceptor::acceptor::AcceptorFactory,
        connection::Connection,
        context::RouterContext,
        realm::{
            Realm,
            RealmConfig,
            RealmManager,
        },
        rpc::{
            InternalRpcHandler,
            RpcManager,
        },
        topic::PubSubManager,
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

/// Configuration for a [`Router`].
pub struct RouterConfig {
    /// IP address the router starts on.
    pub address: IpAddr,
    /// Network port the router starts on.
    pub port: u16,
    /// Agent name, communicated to peers.
    pub agent: String,
    /// Roles implemented by the router.
    pub roles: HashSet<RouterRole>,
    /// Allowed serializers.
    ///
    /// The actual serializer is settled per connection in the rawsocket
    /// handshake.
    pub serializers: HashSet<SerializerType>,
    /// Realms available on the router.
    pub realms: Vec<RealmConfig>,
    /// The maximum-message-size exponent advertised in the handshake.
    pub max_message_size_exp: u8,
    /// User database for wampcra.
    ///
    /// When present, every session must authenticate; when absent, sessions
    /// are established anonymously.
    pub user_database: Option<Arc<dyn CraUserDatabase>>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 0,
            agent: DEFAULT_AGENT.to_owned(),
            roles: HashSet::from_iter([RouterRole::Broker, RouterRole::Dealer]),
            serializers: HashSet::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            realms: Vec::default(),
            max_message_size_exp: DEFAULT_MAX_MESSAGE_SIZE_EXP,
            user_database: None,
        }
    }
}

/// A handle to an asynchronously-running [`Router`].
///
/// The router's ownership is transferred away when it starts. This handle
/// allows interaction with the router as it is running asynchronously.
pub struct RouterHandle {
    start_handle: JoinHandle<()>,
    local_addr: SocketAddr,
    cancel_tx: broadcast::Sender<()>,
    rpc_manager: Arc<RpcManager>,
    realm_uris: Vec<Uri>,
}

impl RouterHandle {
    /// Joins the router task, effectively waiting for the router to stop
    /// altogether.
    pub async fn join(self) -> Result<()> {
        self.start_handle.await.map_err(Error::new)
    }

    /// Cancels the router.
    ///
    /// Cancellation is asynchronous. Use [`Self::join`] to wait for the
    /// router to stop.
    pub fn cancel(&self) -> Result<()> {
        self.cancel_tx.send(()).map(|_| ()).map_err(Error::new)
    }

    /// The local address of the router.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers a procedure hosted by the router itself.
    ///
    /// The procedure is callable by any session in the realm, exactly like a
    /// procedure registered by a peer.
    pub async fn register_rpc(
        &self,
        realm: &Uri,
        procedure: Uri,
        handler: Arc<dyn InternalRpcHandler>,
    ) -> Result<Id> {
        if !self.realm_uris.contains(realm) {
            return Err(InteractionError::NoSuchRealm.into());
        }
        self.rpc_manager
            .register_internal(realm, procedure, handler)
            .await
    }
}

/// A WAMP router (a.k.a., server) that accepts incoming connections and
/// handles sessions.
pub struct Router<S> {
    pub(crate) kernel: Arc<Kernel>,
    /// The router configuration when created.
    pub(crate) config: RouterConfig,

    /// Realms hosted by this router.
    pub(crate) realm_manager: RealmManager,

    /// The RPC registry.
    pub(crate) rpc_manager: Arc<RpcManager>,

    /// The Pub/Sub registry.
    pub(crate) pub_sub_manager: Arc<PubSubManager>,

    /// The factory for acceptors.
    pub(crate) acceptor_factory: Mutex<Box<dyn AcceptorFactory<S>>>,

    /// The factory for transports.
    pub(crate) transport_factory: Mutex<Box<dyn TransportFactory<S>>>,

    // Allocator for session IDs.
    pub(crate) id_allocator: Box<dyn IdAllocator>,

    cancel_tx: broadcast::Sender<()>,
    end_tx: broadcast::Sender<()>,
    _end_rx: broadcast::Receiver<()>,
}

impl<S> Router<S> {
    /// Receiver channel for determining when the router ends.
    pub(crate) fn end_rx(&self) -> broadcast::Receiver<()> {
        self.end_tx.subscribe()
    }
}

impl<S> Router<S>
where
    S: Send + 'static,
{
    /// Creates a new [`Router`].
    pub fn new(
        kernel: Arc<Kernel>,
        config: RouterConfig,
        acceptor_factory: Box<dyn AcceptorFactory<S>>,
        transport_factory: Box<dyn TransportFactory<S>>,
    ) -> Result<Self> {
        let mut realm_manager = RealmManager::default();
        for realm_config in &config.realms {
            realm_manager.insert(Realm::new(realm_config.clone()));
        }
        let (cancel_tx, _) = broadcast::channel(1);
        let (end_tx, end_rx) = broadcast::channel(1);
        Ok(Self {
            kernel,
            config,
            realm_manager,
            rpc_manager: Arc::new(RpcManager::default()),
            pub_sub_manager: Arc::new(PubSubManager::default()),
            acceptor_factory: Mutex::new(acceptor_factory),
            transport_factory: Mutex::new(transport_factory),
            id_allocator: Box::new(RandomIdAllocator::default()),
            cancel_tx,
            end_tx,
            _end_rx: end_rx,
        })
    }

    /// Starts the router asynchronously.
    ///
    /// The returned handle can be used to interact with the router since its
    /// ownership is transferred away.
    pub async fn start(self) -> Result<RouterHandle, Error> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        info!("Starting router {} at {addr}", self.config.agent);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let cancel_tx = self.cancel_tx.clone();
        let rpc_manager = self.rpc_manager.clone();
        let realm_uris = self.realm_manager.uris().cloned().collect();
        let context = RouterContext::new(self);
        let start_handle = tokio::spawn(Self::handle_connections(context, listener));

        Ok(RouterHandle {
            start_handle,
            local_addr,
            cancel_tx,
            rpc_manager,
            realm_uris,
        })
    }

    async fn handle_connections(context: RouterContext<S>, listener: TcpListener) {
        Self::connection_loop(&context, listener).await;
        Self::shut_down(&context).await;
        if let Err(err) = context.router().end_tx.send(()) {
            error!("Failed to write to end_tx channel after router connection loop ended: {err}");
        }
    }

    async fn connection_loop(context: &RouterContext<S>, listener: TcpListener) {
        let mut cancel_rx = context.router().cancel_tx.subscribe();

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    let (stream, addr) = match accept {
                        Ok((stream, addr)) => (stream, addr),
                        Err(_) => break,
                    };
                    tokio::spawn(Self::handle_connection(context.clone(), addr, stream));
                }
                _ = cancel_rx.recv() => {
                    break;
                }
            }
        }
    }

    async fn handle_connection(context: RouterContext<S>, addr: SocketAddr, stream: TcpStream) {
        if let Err(err) = Self::start_connection(&context, addr, stream).await {
            error!("Failed to start handling connection from {addr}: {err:#}");
        }
    }

    async fn start_connection(
        context: &RouterContext<S>,
        addr: SocketAddr,
        stream: TcpStream,
    ) -> Result<()> {
        debug!("Incoming TCP connection from {addr}");
        let acceptor = context
            .router()
            .acceptor_factory
            .lock()
            .await
            .new_acceptor();
        let acceptance = acceptor.accept(&context.router().config, stream).await?;
        debug!("WAMP connection established with {addr}");

        let serializer = new_serializer(acceptance.serializer);
        let limits = FrameLimits {
            max_incoming_payload: acceptance.max_incoming_payload,
            max_outgoing_payload: acceptance.max_outgoing_payload,
            max_pending_write_bytes: context
                .router()
                .kernel
                .config()
                .socket_max_pending_write_bytes,
        };
        let transport = context
            .router()
            .transport_factory
            .lock()
            .await
            .new_transport(acceptance.stream, limits);

        let connection = Connection::new();
        info!("Created connection {} for {addr}", connection.uuid());

        let service = Service::new(
            connection.uuid().to_string(),
            Box::new(TransportMessageStream::new(transport, serializer)),
        );
        connection.start(context.clone(), service);
        Ok(())
    }

    async fn shut_down(context: &RouterContext<S>) {
        let realms = context
            .router()
            .realm_manager
            .uris()
            .cloned()
            .collect::<Vec<_>>();
        for uri in realms {
            if let Err(err) =
                Self::shut_down_realm(context, &uri, CloseReason::SystemShutdown).await
            {
                error!("Failed to shut down realm {uri}: {err:#}");
            }
        }
    }

    async fn shut_down_realm(
        context: &RouterContext<S>,
        realm: &Uri,
        close_reason: CloseReason,
    ) -> Result<()> {
        let realm = match context.router().realm_manager.get(realm) {
            Some(realm) => realm,
            None => return Ok(()),
        };
        realm.shut_down(close_reason).await
    }
}

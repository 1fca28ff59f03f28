mod acceptor;
mod connection;
mod context;
mod raw_socket_router;
mod realm;
mod router;
mod rpc;
mod session;
mod topic;

pub use raw_socket_router::{
    RawSocketRouter,
    new_raw_socket_router,
};
pub use realm::RealmConfig;
pub use router::{
    Router,
    RouterConfig,
    RouterHandle,
};
pub use rpc::{
    InternalRpcCall,
    InternalRpcHandler,
    InternalRpcYield,
};

mod connector;
mod peer;
mod raw_socket_peer;
mod session;

pub use peer::{
    Peer,
    PeerConfig,
    PeerNotConnectedError,
    ProcedureHandler,
    RpcCall,
    RpcResult,
    Subscription,
};
pub use raw_socket_peer::{
    RawSocketPeer,
    new_raw_socket_peer,
};
pub use session::{
    Event,
    Invocation,
    ReceivedEvent,
    RpcYield,
    peer_session_message,
};

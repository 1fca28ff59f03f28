pub mod acceptor;
pub mod raw_socket_acceptor;

pub use raw_socket_acceptor::RawSocketAcceptorFactory;

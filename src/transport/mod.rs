pub mod frame;
pub mod raw_socket_transport;
pub mod transport;

//! Socket.IO connection to the chat relay.

pub mod connection;
pub mod packet;

pub use connection::{spawn_socket, SocketCommand, SocketHandle, SocketNotification};

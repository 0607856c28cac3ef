//! Listening endpoint and accepted connections

pub mod acceptor;
pub mod address;
pub mod connection;

pub use acceptor::{Acceptor, DEFAULT_BACKLOG};
pub use address::ListenAddress;
pub use connection::Connection;

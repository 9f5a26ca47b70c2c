//! Unix-domain control socket: listener and per-client connection
//! Pollables.

pub mod connection;
pub mod listener;

pub use connection::Connection;
pub use listener::Listener;

//! simpledb: a minimal text query server and client connector.
//!
//! - [`server::Server`] binds a TCP address and serves each connection on
//!   its own task, up to a configured limit.
//! - [`connection::Connection`] drives one connection's request/response
//!   loop against a shared [`resolver::Resolver`].
//! - [`connector::Connector`] owns one outbound connection, with
//!   [`connector::Session`] guaranteeing it is closed on every exit path.
//!
//! Requests and responses are length-prefixed UTF-8 frames, see
//! [`protocol`].

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod protocol;
pub mod resolver;
pub mod server;

pub use config::{ClientConfig, ServerConfig};
pub use connector::{ConnectorState, Connector, Session};
pub use error::{ConnectError, ConnectionError, ExecuteError, FrameError, ServerError};
pub use resolver::{Resolver, ResolverTable};
pub use server::Server;

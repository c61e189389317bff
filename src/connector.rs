//! Client-side connector owning one outbound connection.
//!
//! State transitions:
//!
//! ```text
//! Disconnected --connect ok--> Connected
//! Disconnected --connect err-> Disconnected
//! Connected --execute err----> Closed
//! any --close----------------> Closed
//! Closed --connect ok--------> Connected
//! ```
//!
//! [`Connector::scope`] wraps the lifecycle in a guard: entering connects,
//! dropping the guard closes, whichever way the scope is left.

use crate::config::ClientConfig;
use crate::error::{ConnectError, ExecuteError};
use crate::protocol;
use bytes::BytesMut;
use std::io;
use std::ops::{Deref, DerefMut};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Connector lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connected,
    Closed,
}

/// Manages one outbound connection to a query server.
#[derive(Debug)]
pub struct Connector {
    config: ClientConfig,
    stream: Option<TcpStream>,
    state: ConnectorState,
    buffer: BytesMut,
}

impl Connector {
    pub fn new(config: ClientConfig) -> Self {
        debug!(address = %config.address(), user = %config.user, "Connector initialized");
        Self {
            config,
            stream: None,
            state: ConnectorState::Disconnected,
            buffer: BytesMut::new(),
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectorState::Connected
    }

    /// Open the connection.
    ///
    /// On failure the connector stays `Disconnected` and the error is
    /// returned for the caller to inspect. Connecting while already
    /// connected does nothing.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }

        let addr = self.config.address();
        let attempt = TcpStream::connect((self.config.host.as_str(), self.config.port));
        let result = match self.config.timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result.map_err(|source| classify(&addr, source)),
                Err(_) => Err(ConnectError::Timeout { addr: addr.clone() }),
            },
            None => attempt.await.map_err(|source| classify(&addr, source)),
        };

        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                self.stream = Some(stream);
                self.buffer.clear();
                self.state = ConnectorState::Connected;
                info!(address = %addr, "Connected");
                Ok(())
            }
            Err(e) => {
                self.stream = None;
                self.state = ConnectorState::Disconnected;
                warn!(address = %addr, kind = e.kind(), error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    /// Send one query and wait for its response.
    ///
    /// Fails with [`ExecuteError::NotConnected`] without touching the network
    /// unless the connector is `Connected`. Any other failure closes the
    /// connection before returning.
    pub async fn execute(&mut self, query: &str) -> Result<String, ExecuteError> {
        let stream = match (self.state, self.stream.as_mut()) {
            (ConnectorState::Connected, Some(stream)) => stream,
            _ => {
                warn!(state = ?self.state, "Execute called without an open connection");
                return Err(ExecuteError::NotConnected);
            }
        };

        debug!(query, "Sending query");
        let max_response_size = self.config.max_response_size;
        let exchange = round_trip(stream, &mut self.buffer, query, max_response_size);
        let result = match self.config.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or(Err(ExecuteError::Timeout(timeout))),
            None => exchange.await,
        };

        match result {
            Ok(response) => {
                debug!(response = %response, "Received response");
                Ok(response)
            }
            Err(e) => {
                warn!(error = %e, "Execute failed, closing connection");
                self.close();
                Err(e)
            }
        }
    }

    /// Release the connection if open. Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!(address = %self.config.address(), "Connection closed");
        }
        self.state = ConnectorState::Closed;
    }

    /// Connect and return a guard that closes the connector when dropped.
    ///
    /// A failed connect still yields a guard; check
    /// [`Session::connect_error`] or [`Connector::is_connected`] before
    /// executing.
    pub async fn scope(&mut self) -> Session<'_> {
        let connect_error = self.connect().await.err();
        Session {
            connector: self,
            connect_error,
        }
    }
}

/// Scoped connection. Closes its connector exactly once, on drop.
#[derive(Debug)]
pub struct Session<'a> {
    connector: &'a mut Connector,
    connect_error: Option<ConnectError>,
}

impl Session<'_> {
    /// Why entering the scope failed to connect, if it did.
    pub fn connect_error(&self) -> Option<&ConnectError> {
        self.connect_error.as_ref()
    }
}

impl Deref for Session<'_> {
    type Target = Connector;

    fn deref(&self) -> &Connector {
        &*self.connector
    }
}

impl DerefMut for Session<'_> {
    fn deref_mut(&mut self) -> &mut Connector {
        &mut *self.connector
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.connector.close();
    }
}

fn classify(addr: &str, source: io::Error) -> ConnectError {
    if source.kind() == io::ErrorKind::ConnectionRefused {
        ConnectError::Refused {
            addr: addr.to_string(),
            source,
        }
    } else {
        ConnectError::Other {
            addr: addr.to_string(),
            source,
        }
    }
}

async fn round_trip(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    query: &str,
    max_response_size: usize,
) -> Result<String, ExecuteError> {
    protocol::write_frame(stream, query.as_bytes())
        .await
        .map_err(ExecuteError::Send)?;

    let frame = protocol::read_frame(stream, buffer, max_response_size)
        .await
        .map_err(ExecuteError::Receive)?
        .ok_or(ExecuteError::Closed)?;

    let response = std::str::from_utf8(&frame).map_err(ExecuteError::Decode)?;
    Ok(response.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Port with nothing listening on it.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_execute_before_connect() {
        let mut conn = Connector::new(ClientConfig::new("127.0.0.1", 9));
        let err = conn.execute("SELECT version();").await.unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(conn.state(), ConnectorState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut conn = Connector::new(ClientConfig::new("127.0.0.1", 9));
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectorState::Closed);

        let err = conn.execute("SELECT version();").await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = closed_port().await;
        let mut conn = Connector::new(ClientConfig::new("127.0.0.1", port));

        let err = conn.connect().await.unwrap_err();
        assert!(err.is_refused());
        assert_eq!(err.kind(), "refused");
        assert_eq!(conn.state(), ConnectorState::Disconnected);
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = BytesMut::new();
            let request = protocol::read_frame(&mut stream, &mut buffer, 1024)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&request[..], b"PING");
            protocol::write_frame(&mut stream, b"PONG").await.unwrap();
        });

        let mut conn = Connector::new(ClientConfig::new("127.0.0.1", port));
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.execute("PING").await.unwrap(), "PONG");
        server.await.unwrap();

        conn.close();
        assert_eq!(conn.state(), ConnectorState::Closed);
    }

    #[tokio::test]
    async fn test_execute_failure_forces_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // Accept, read the request, hang up without answering.
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
        });

        let mut conn = Connector::new(ClientConfig::new("127.0.0.1", port));
        conn.connect().await.unwrap();
        let err = conn.execute("SELECT version();").await.unwrap_err();
        assert!(!err.is_not_connected());
        assert_ne!(conn.state(), ConnectorState::Connected);
        assert_eq!(conn.state(), ConnectorState::Closed);
        server.await.unwrap();

        let err = conn.execute("SELECT version();").await.unwrap_err();
        assert!(err.is_not_connected());
    }

    #[tokio::test]
    async fn test_invalid_response_frame_forces_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = BytesMut::new();
            protocol::read_frame(&mut stream, &mut buffer, 1024).await.unwrap();
            stream.write_all(b"not a frame\r\n").await.unwrap();
            stream
        });

        let mut conn = Connector::new(ClientConfig::new("127.0.0.1", port));
        conn.connect().await.unwrap();
        let err = conn.execute("SELECT version();").await.unwrap_err();
        assert!(matches!(err, ExecuteError::Receive(FrameError::InvalidLength)));
        assert_eq!(conn.state(), ConnectorState::Closed);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_execute_timeout_forces_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // Never answer.
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(stream);
        });

        let config = ClientConfig::new("127.0.0.1", port).with_timeout(Duration::from_millis(50));
        let mut conn = Connector::new(config);
        conn.connect().await.unwrap();
        let err = conn.execute("SELECT version();").await.unwrap_err();
        assert!(matches!(err, ExecuteError::Timeout(_)));
        assert_eq!(conn.state(), ConnectorState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_closes_on_exit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            // Returns once the connector closes its end.
            stream.read_to_end(&mut buf).await.unwrap();
        });

        let mut conn = Connector::new(ClientConfig::new("127.0.0.1", port));
        {
            let session = conn.scope().await;
            assert!(session.connect_error().is_none());
            assert!(session.is_connected());
        }
        assert_eq!(conn.state(), ConnectorState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_with_failed_connect() {
        let port = closed_port().await;
        let mut conn = Connector::new(ClientConfig::new("127.0.0.1", port));
        {
            let mut session = conn.scope().await;
            assert!(session.connect_error().is_some_and(ConnectError::is_refused));
            assert!(!session.is_connected());
            let err = session.execute("SELECT version();").await.unwrap_err();
            assert!(err.is_not_connected());
        }
        assert_eq!(conn.state(), ConnectorState::Closed);
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                drop(stream);
            }
        });

        let mut conn = Connector::new(ClientConfig::new("127.0.0.1", port));
        conn.connect().await.unwrap();
        conn.close();
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        conn.close();
        server.await.unwrap();
    }
}

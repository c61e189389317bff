//! Per-connection request/response loop.
//!
//! Each accepted stream is driven through
//! `AwaitingRequest -> Resolving -> SendingResponse -> AwaitingRequest`
//! until the peer hangs up or an error occurs, at which point the
//! connection moves to `Closed` and the stream is dropped.

use crate::error::ConnectionError;
use crate::protocol::{self, DEFAULT_MAX_REQUEST_SIZE};
use crate::resolver::Resolver;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next request frame.
    AwaitingRequest,
    /// Request decoded, resolver running.
    Resolving,
    /// Writing the response frame.
    SendingResponse,
    /// Terminal.
    Closed,
}

/// A single client connection.
///
/// Owns its stream exclusively. Requests are strictly half-duplex: a
/// response is fully written before the next request is read.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    buffer: BytesMut,
    max_request_size: usize,
    resolver: Arc<dyn Resolver>,
    requests: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection in the awaiting-request state.
    pub fn new(stream: S, peer: SocketAddr, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::AwaitingRequest,
            buffer: BytesMut::with_capacity(DEFAULT_MAX_REQUEST_SIZE),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            resolver,
            requests: 0,
        }
    }

    /// Set the largest accepted request payload.
    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Requests answered so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Drive the connection until the peer disconnects or an error occurs.
    ///
    /// An orderly peer shutdown returns `Ok(())`. Any error also leaves the
    /// connection `Closed`; the stream is released when `self` is dropped.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;
        self.state = ConnState::Closed;
        match &result {
            Ok(()) => debug!(peer = %self.peer, requests = self.requests, "Connection closed by client"),
            Err(e) => debug!(peer = %self.peer, requests = self.requests, error = %e, "Connection closed on error"),
        }
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.state = ConnState::AwaitingRequest;
            let frame = protocol::read_frame(&mut self.stream, &mut self.buffer, self.max_request_size)
                .await
                .map_err(ConnectionError::Receive)?;
            let Some(frame) = frame else {
                return Ok(());
            };

            self.state = ConnState::Resolving;
            let request = std::str::from_utf8(&frame).map_err(ConnectionError::Decode)?;
            debug!(peer = %self.peer, request, "Request received");
            let response = self.resolver.resolve(request);

            self.state = ConnState::SendingResponse;
            protocol::write_frame(&mut self.stream, response.as_bytes())
                .await
                .map_err(ConnectionError::Send)?;
            self.requests += 1;
            trace!(peer = %self.peer, response = %response, "Response sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::resolver::{ResolverTable, DEFAULT_RESPONSE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn resolver() -> Arc<dyn Resolver> {
        Arc::new(ResolverTable::builtin())
    }

    #[tokio::test]
    async fn test_sequential_requests_answered_in_order() {
        let stream = tokio_test::io::Builder::new()
            .read(b"17\r\nSELECT version();")
            .write(b"12\r\nSimpleDB 1.0")
            .read(b"36\r\nSELECT name FROM users WHERE id = 1;")
            .write(b"8\r\nJohn Doe")
            .read(b"31\r\nUPDATE users SET name = 'test';")
            .write(format!("{}\r\n{}", DEFAULT_RESPONSE.len(), DEFAULT_RESPONSE).as_bytes())
            .build();

        let mut conn = Connection::new(stream, peer(), resolver());
        conn.run().await.unwrap();
        assert_eq!(conn.requests(), 3);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_fragmented_request() {
        let stream = tokio_test::io::Builder::new()
            .read(b"17\r\nSELECT")
            .read(b" version();")
            .write(b"12\r\nSimpleDB 1.0")
            .build();

        let mut conn = Connection::new(stream, peer(), resolver());
        conn.run().await.unwrap();
        assert_eq!(conn.requests(), 1);
    }

    #[tokio::test]
    async fn test_zero_length_read_closes_cleanly() {
        let stream = tokio_test::io::Builder::new().build();

        let mut conn = Connection::new(stream, peer(), resolver());
        assert_eq!(conn.state(), ConnState::AwaitingRequest);
        conn.run().await.unwrap();
        assert_eq!(conn.requests(), 0);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_fatal() {
        let stream = tokio_test::io::Builder::new()
            .read(b"2\r\n\xff\xfe")
            .build();

        let mut conn = Connection::new(stream, peer(), resolver());
        let err = conn.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(_)));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_request_is_fatal() {
        let stream = tokio_test::io::Builder::new().read(b"100\r\n").build();

        let mut conn = Connection::new(stream, peer(), resolver()).with_max_request_size(16);
        let err = conn.run().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Receive(FrameError::TooLarge { length: 100, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_read_error_is_fatal() {
        let stream = tokio_test::io::Builder::new()
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();

        let mut conn = Connection::new(stream, peer(), resolver());
        let err = conn.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Receive(FrameError::Io(_))));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_write_error_is_fatal() {
        let stream = tokio_test::io::Builder::new()
            .read(b"17\r\nSELECT version();")
            .write_error(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .build();

        let mut conn = Connection::new(stream, peer(), resolver());
        let err = conn.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Send(_)));
        assert_eq!(conn.requests(), 0);
    }

    #[tokio::test]
    async fn test_duplex_round_trip() {
        let (client, server) = tokio::io::duplex(64);
        let handle = tokio::spawn(async move {
            let mut conn = Connection::new(server, peer(), resolver());
            conn.run().await.map(|_| conn.requests())
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        protocol::write_frame(&mut wr, b"SELECT version();").await.unwrap();
        let mut buffer = BytesMut::new();
        let response = protocol::read_frame(&mut rd, &mut buffer, 1024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&response[..], b"SimpleDB 1.0");

        wr.shutdown().await.unwrap();
        let mut rest = Vec::new();
        rd.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }
}

//! One HTTP transaction over one accepted stream.
//!
//! A [`Connection`] reads a request head, resolves it against the
//! [`Router`], streams exactly `Content-Length` body bytes into the matched
//! request variant, runs the processing function, writes the response and
//! closes. There is no keep-alive: every response carries `Connection: close`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::config::ServerConfig;
use crate::http::request::{Request, RequestError};
use crate::http::stream::{BodyError, ByteSink, ByteSource};
use crate::http::{Response, StatusCode};
use crate::router::{Resolution, Resolved, Router};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Errors that abort a connection without (or partway through) a response.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed request head: {0}")]
    MalformedHead(#[from] RequestError),

    #[error("request head exceeds {max} bytes")]
    HeadTooLarge { max: usize },

    #[error("peer closed the connection after {received} of {expected} body bytes")]
    PrematureEof { expected: u64, received: u64 },

    #[error("request body rejected: {0}")]
    Body(#[from] BodyError),

    #[error("response body failed: {0}")]
    ResponseBody(#[source] io::Error),
}

/// Where a [`Connection`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    ReadingHead,
    Resolving,
    ReceivingBody,
    Processing,
    SendingHead,
    SendingBody,
    Closed,
    Error,
}

/// Drives a single request/response exchange over `S`.
///
/// `S` is normally a [`tokio::net::TcpStream`], but any bidirectional async
/// stream works.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    router: Arc<Router>,
    state: ConnectionState,
    buffer: BytesMut,
    bytes_read: u64,
    bytes_written: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: SocketAddr, config: Arc<ServerConfig>, router: Arc<Router>) -> Self {
        Self {
            stream,
            peer,
            config,
            router,
            state: ConnectionState::Idle,
            buffer: BytesMut::new(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Total bytes received from the peer so far.
    pub fn total_bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Total bytes sent to the peer so far.
    pub fn total_bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Serves one transaction, then shuts the stream down.
    ///
    /// On error the state becomes [`ConnectionState::Error`]; the stream is
    /// shut down either way.
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;

        self.state = match result {
            Ok(()) => ConnectionState::Closed,
            Err(_) => ConnectionState::Error,
        };
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "shutdown failed");
        }

        debug!(
            peer = %self.peer,
            bytes_read = self.bytes_read,
            bytes_written = self.bytes_written,
            "connection closed"
        );
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        self.state = ConnectionState::ReadingHead;
        let Some(request) = self.read_head().await? else {
            debug!(peer = %self.peer, "connection closed before a request was sent");
            return Ok(());
        };

        self.state = ConnectionState::Resolving;
        debug!(
            peer = %self.peer,
            method = %request.method(),
            path = %request.path(),
            "request received"
        );

        let response = match self.resolve(&request) {
            Ok(mut resolved) => {
                if request.has_body() {
                    if self.config.send_continue && request.expects_continue() {
                        self.write_all(CONTINUE_RESPONSE).await?;
                    }
                    self.state = ConnectionState::ReceivingBody;
                    self.receive_body(&mut resolved, request.content_length())
                        .await?;
                }
                self.state = ConnectionState::Processing;
                process(self.peer, resolved).await
            }
            Err(response) => response,
        };

        self.send_response(response).await
    }

    // Reads until a complete head is buffered. Bytes after the head stay in
    // `self.buffer`. `None` means the peer closed without sending anything.
    async fn read_head(&mut self) -> Result<Option<Request>, ConnectionError> {
        let max = self.config.max_head_size;

        loop {
            match Request::parse(&self.buffer) {
                Ok((request, offset)) => {
                    if offset > max {
                        return Err(ConnectionError::HeadTooLarge { max });
                    }
                    self.buffer.advance(offset);
                    return Ok(Some(request));
                }
                Err(RequestError::Incomplete) => {
                    if self.buffer.len() > max {
                        return Err(ConnectionError::HeadTooLarge { max });
                    }
                }
                Err(e) => return Err(e.into()),
            }

            self.buffer.reserve(self.config.io_buffer_size);
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(RequestError::Incomplete.into());
            }
            self.bytes_read += n as u64;
        }
    }

    // Picks the exchange for `request`, or the response to send instead.
    fn resolve(&self, request: &Request) -> Result<Resolved, Response> {
        if let Some(coding) = request.transfer_coding() {
            debug!(peer = %self.peer, coding, "unsupported transfer coding");
            return Err(Response::new(StatusCode::NotImplemented));
        }

        if let Some(max) = self.config.max_body_size {
            if request.content_length() > max {
                debug!(
                    peer = %self.peer,
                    content_length = request.content_length(),
                    max,
                    "request body too large"
                );
                return Err(Response::new(StatusCode::PayloadTooLarge));
            }
        }

        match self.router.resolve(request) {
            Resolution::Matched(resolved) => Ok(resolved),
            Resolution::MethodNotAllowed => Err(Response::new(StatusCode::MethodNotAllowed)),
            Resolution::NotFound => Err(Response::new(StatusCode::NotFound)),
        }
    }

    // Feeds exactly `expected` bytes into the sink. Anything the peer sends
    // beyond that is never handed to the request.
    async fn receive_body(
        &mut self,
        sink: &mut Resolved,
        expected: u64,
    ) -> Result<(), ConnectionError> {
        let mut remaining = expected;
        sink.open()?;

        if !self.buffer.is_empty() {
            let take = (self.buffer.len() as u64).min(remaining) as usize;
            sink.write(&self.buffer[..take])?;
            remaining -= take as u64;
            self.buffer.clear();
        }

        let mut chunk = vec![0u8; self.config.io_buffer_size];
        while remaining > 0 {
            let want = (chunk.len() as u64).min(remaining) as usize;
            let n = self.stream.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(ConnectionError::PrematureEof {
                    expected,
                    received: expected - remaining,
                });
            }
            self.bytes_read += n as u64;
            sink.write(&chunk[..n])?;
            remaining -= n as u64;
        }

        sink.close()?;
        Ok(())
    }

    async fn send_response(&mut self, mut response: Response) -> Result<(), ConnectionError> {
        self.state = ConnectionState::SendingHead;
        if let Err(e) = response.open() {
            warn!(peer = %self.peer, error = %e, "response body failed to open");
            response = Response::new(StatusCode::InternalServerError);
        }

        let head = response.head_bytes(&self.config.server_name);
        self.write_all(&head).await?;

        self.state = ConnectionState::SendingBody;
        let sent = self.send_body(&mut response).await;
        let closed = response.close();
        sent?;
        closed.map_err(ConnectionError::ResponseBody)?;
        self.stream.flush().await?;

        debug!(
            peer = %self.peer,
            status = response.status_code().as_u16(),
            "response sent"
        );
        Ok(())
    }

    // Sends exactly the advertised `Content-Length`. Extra source bytes are
    // never read; a source that runs dry early aborts the connection.
    async fn send_body(&mut self, response: &mut Response) -> Result<(), ConnectionError> {
        let expected = response.content_length();
        let mut remaining = expected;
        let mut buf = vec![0u8; self.config.io_buffer_size];
        while remaining > 0 {
            let want = (buf.len() as u64).min(remaining) as usize;
            let n = response
                .read(&mut buf[..want])
                .map_err(ConnectionError::ResponseBody)?;
            if n == 0 {
                return Err(ConnectionError::ResponseBody(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body ended after {} of {expected} bytes", expected - remaining),
                )));
            }
            self.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

// Runs the processing function on the blocking pool. A missing response or a
// panic both become a 500.
async fn process(peer: SocketAddr, resolved: Resolved) -> Response {
    let path = resolved.request().path().to_owned();

    match tokio::task::spawn_blocking(move || resolved.process()).await {
        Ok(Some(response)) => response,
        Ok(None) => {
            warn!(peer = %peer, path = %path, "processing function returned no response");
            Response::new(StatusCode::InternalServerError)
        }
        Err(e) => {
            error!(peer = %peer, path = %path, error = %e, "processing function panicked");
            Response::new(StatusCode::InternalServerError)
        }
    }
}

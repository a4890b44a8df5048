//! Streaming contracts shared by request bodies and response bodies.
//!
//! A connection feeds request bytes into a [`ByteSink`] and pulls response
//! bytes out of a [`ByteSource`]. Both follow the same lifecycle: opened once,
//! then written to (or read from) any number of times, then closed once.

use std::io;

use thiserror::Error;

use super::multipart::MultipartError;

/// Errors raised while a request body is being stored.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("I/O error while storing body: {0}")]
    Io(#[from] io::Error),

    #[error("multipart body is invalid: {0}")]
    Multipart(#[from] MultipartError),

    #[error("body sink is not open")]
    NotOpen,
}

/// Receives the bytes of a request body.
///
/// The connection calls [`open`](Self::open) before the first chunk and
/// [`close`](Self::close) after exactly `Content-Length` bytes were written.
/// An error from any call aborts the connection and the processing function
/// is never invoked.
pub trait ByteSink {
    /// Prepares the sink to receive bytes.
    fn open(&mut self) -> Result<(), BodyError>;

    /// Consumes the next chunk of the body. Chunks arrive strictly in order.
    fn write(&mut self, chunk: &[u8]) -> Result<(), BodyError>;

    /// Finalizes the body. After a successful close the request is read-only.
    fn close(&mut self) -> Result<(), BodyError>;
}

/// Produces the bytes of a response body.
///
/// [`read`](Self::read) returns `Ok(0)` once the body is exhausted.
pub trait ByteSource: Send {
    fn open(&mut self) -> io::Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()>;
}

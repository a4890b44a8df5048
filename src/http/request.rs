//! HTTP/1.1 request heads, parsed with the [`httparse`] crate, and the
//! [`RequestBody`] contract implemented by every request variant.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use super::query::{decode_path, parse_url_encoded};
use super::stream::{BodyError, ByteSink};
use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete; more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request path is not valid percent-encoded UTF-8: {path}")]
    InvalidPath { path: String },

    #[error("invalid Content-Length header: {value}")]
    InvalidContentLength { value: String },
}

/// A parsed HTTP/1.1 request head.
///
/// Created by [`Request::parse`] from a raw byte buffer. The head carries no
/// body: request variants such as [`DataRequest`](super::DataRequest) wrap a
/// `Request` and decide where body bytes go. Used on its own, `Request` is the
/// variant for requests whose body (if any) is of no interest; body bytes are
/// drained and dropped.
///
/// # Examples
///
/// ```
/// use portico::http::request::Request;
///
/// let raw = b"GET /hello%20there?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello there");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// assert_eq!(request.content_length(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: String,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    params: HashMap<String, String>,
    content_type: Option<String>,
    content_length: u64,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse a raw HTTP/1.1 request head from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    /// - [`RequestError::InvalidPath`]: the path does not percent-decode to UTF-8.
    /// - [`RequestError::InvalidContentLength`]: `Content-Length` is not a number.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = Method::from(
            raw_req
                .method
                .ok_or(RequestError::MissingField { field: "method" })?,
        );

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (encoded_path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path, Some(query.to_owned())),
            None => (raw_path, None),
        };
        let path = decode_path(encoded_path).ok_or_else(|| RequestError::InvalidPath {
            path: encoded_path.to_owned(),
        })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value.trim());
            }
        }

        let content_length = match header_map.get("content-length") {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| RequestError::InvalidContentLength {
                    value: value.to_owned(),
                })?,
            None => 0,
        };
        let content_type = header_map.get("content-type").map(str::to_owned);
        let params = query.as_deref().map(parse_url_encoded).unwrap_or_default();

        Ok((
            Self {
                method,
                url: raw_path.to_owned(),
                path,
                version,
                headers: header_map,
                query,
                params,
                content_type,
                content_length,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request target exactly as sent (path and query, still encoded).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the percent-decoded request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a decoded query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns all decoded query parameters.
    pub fn query(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Returns the `Content-Type` header, if present.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Returns the declared `Content-Length`, or 0 when absent.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Returns `true` when the request declares a non-empty body.
    pub fn has_body(&self) -> bool {
        self.content_length > 0
    }

    /// Returns `true` if the client asked for an interim `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }

    /// Returns the `Transfer-Encoding` header when it names a coding other
    /// than `identity`. Such bodies cannot be framed by this server.
    pub fn transfer_coding(&self) -> Option<&str> {
        self.headers
            .get("transfer-encoding")
            .filter(|v| !v.eq_ignore_ascii_case("identity"))
    }
}

/// A request variant: a parsed head plus a place to store the body.
///
/// Handlers name the variant they want and the registry builds it from the
/// parsed head with [`from_request`](Self::from_request). Returning `None`
/// declines the request, and resolution moves on to the next handler.
pub trait RequestBody: ByteSink + Send + Sized + 'static {
    /// Builds the variant for `request`, or declines it.
    fn from_request(request: Request) -> Option<Self>;

    /// Returns the parsed request head.
    fn request(&self) -> &Request;
}

impl ByteSink for Request {
    fn open(&mut self) -> Result<(), BodyError> {
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        debug!(path = %self.path, len = chunk.len(), "discarding request body bytes");
        Ok(())
    }

    fn close(&mut self) -> Result<(), BodyError> {
        Ok(())
    }
}

impl RequestBody for Request {
    fn from_request(request: Request) -> Option<Self> {
        Some(request)
    }

    fn request(&self) -> &Request {
        self
    }
}

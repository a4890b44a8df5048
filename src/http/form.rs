//! `application/x-www-form-urlencoded` request bodies.

use std::collections::HashMap;

use super::data::DataRequest;
use super::mime_essence;
use super::query::parse_url_encoded;
use super::request::{Request, RequestBody};
use super::stream::{BodyError, ByteSink};

/// A request whose body is an url-encoded form.
///
/// Requests without an `application/x-www-form-urlencoded` content type are
/// declined.
///
/// The body is collected like a [`DataRequest`] and decoded into
/// [`arguments`](Self::arguments) when it is closed. A control name sent more
/// than once keeps its last value.
#[derive(Debug)]
pub struct UrlEncodedFormRequest {
    inner: DataRequest,
    arguments: HashMap<String, String>,
}

impl UrlEncodedFormRequest {
    /// MIME type of the bodies this variant decodes.
    pub const MIME_TYPE: &'static str = "application/x-www-form-urlencoded";

    /// Returns the decoded form fields.
    pub fn arguments(&self) -> &HashMap<String, String> {
        &self.arguments
    }

    /// Returns one decoded form field.
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).map(String::as_str)
    }

    /// Returns the raw, undecoded body.
    pub fn data(&self) -> &[u8] {
        self.inner.data()
    }
}

impl ByteSink for UrlEncodedFormRequest {
    fn open(&mut self) -> Result<(), BodyError> {
        self.inner.open()
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        self.inner.write(chunk)
    }

    fn close(&mut self) -> Result<(), BodyError> {
        self.inner.close()?;
        let body = String::from_utf8_lossy(self.inner.data());
        self.arguments = parse_url_encoded(&body);
        Ok(())
    }
}

impl RequestBody for UrlEncodedFormRequest {
    fn from_request(request: Request) -> Option<Self> {
        let essence = mime_essence(request.content_type()?);
        if !essence.eq_ignore_ascii_case(Self::MIME_TYPE) {
            return None;
        }
        Some(Self {
            inner: DataRequest::from_request(request)?,
            arguments: HashMap::new(),
        })
    }

    fn request(&self) -> &Request {
        self.inner.request()
    }
}

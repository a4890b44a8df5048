//! Incremental `multipart/form-data` parsing.
//!
//! [`MultipartFormRequest`] consumes the body in whatever chunks the socket
//! delivers. The parser keeps an unconsumed tail between writes so that a
//! boundary split across two chunks is still recognized, and it never commits
//! bytes to a part until it is certain they are not the start of the next
//! delimiter.
//!
//! Parts without a `filename` land in [`arguments`](MultipartFormRequest::arguments)
//! (in memory); parts with one are streamed to temporary files and land in
//! [`files`](MultipartFormRequest::files). A control name that appears more
//! than once keeps the last part. Temporary files of completed parts are never
//! deleted by the parser: the processing function owns them.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;
use thiserror::Error;
use tracing::{debug, warn};

use super::data::create_temp_file;
use super::request::{Request, RequestBody};
use super::stream::{BodyError, ByteSink};
use super::{header_parameter, mime_essence};

/// Largest header block accepted for a single part.
const MAX_PART_HEADERS_SIZE: usize = 16 * 1024;

/// MIME type assumed for parts that carry no `Content-Type`.
const DEFAULT_PART_MIME_TYPE: &str = "text/plain";

/// Errors raised by the multipart parser. Any of them aborts the request.
#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("Content-Type has no boundary parameter")]
    MissingBoundary,

    #[error("part is missing a Content-Disposition name")]
    MissingControlName,

    #[error("part headers exceed {max} bytes")]
    HeadersTooLarge { max: usize },

    #[error("malformed part header line: {line}")]
    MalformedHeader { line: String },

    #[error("body ended before the closing boundary")]
    Truncated,

    #[error("parser already failed on an earlier chunk")]
    Aborted,
}

/// A form field submitted without a filename.
#[derive(Debug, Clone)]
pub struct MultipartArgument {
    content_type: Option<String>,
    mime_type: String,
    data: Bytes,
}

impl MultipartArgument {
    /// The part's `Content-Type` header, if it had one.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The part's media type; `text/plain` when the part declared none.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The value as text. Only available for `text/*` parts holding valid UTF-8.
    pub fn string(&self) -> Option<&str> {
        if self.mime_type.starts_with("text/") {
            std::str::from_utf8(&self.data).ok()
        } else {
            None
        }
    }
}

/// A form field submitted with a filename, stored in a temporary file.
#[derive(Debug, Clone)]
pub struct MultipartFile {
    content_type: Option<String>,
    mime_type: String,
    file_name: String,
    temporary_path: PathBuf,
}

impl MultipartFile {
    /// The part's `Content-Type` header, if it had one.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The part's media type; `text/plain` when the part declared none.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// The client-side file name. May be empty when the field was left blank.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Where the part's content was stored. The caller owns this file.
    pub fn temporary_path(&self) -> &Path {
        &self.temporary_path
    }
}

#[derive(Debug)]
enum PartSink {
    Memory(BytesMut),
    File { file: File, path: PathBuf },
}

#[derive(Debug)]
struct Part {
    name: String,
    file_name: Option<String>,
    content_type: Option<String>,
    sink: PartSink,
}

impl Part {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BodyError> {
        match &mut self.sink {
            PartSink::Memory(buf) => buf.extend_from_slice(bytes),
            PartSink::File { file, .. } => file.write_all(bytes)?,
        }
        Ok(())
    }

    fn mime_type(&self) -> String {
        self.content_type
            .as_deref()
            .map(mime_essence)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_PART_MIME_TYPE)
            .to_ascii_lowercase()
    }
}

#[derive(Debug)]
enum State {
    /// Looking for `--boundary`; anything before it is ignored.
    SeekBoundary,
    /// Collecting a part's header block up to the blank line.
    PartHeaders,
    /// Streaming a part's content until `CRLF--boundary`.
    PartBody(Part),
    /// The closing `--boundary--` was seen; further bytes are ignored.
    Done,
}

/// The incremental parser behind [`MultipartFormRequest`].
#[derive(Debug)]
struct MultipartParser {
    /// `--boundary`
    delimiter: Vec<u8>,
    /// `\r\n--boundary`
    part_delimiter: Vec<u8>,
    state: State,
    pending: BytesMut,
    arguments: HashMap<String, MultipartArgument>,
    files: HashMap<String, MultipartFile>,
    failed: bool,
}

impl MultipartParser {
    fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());

        let mut part_delimiter = Vec::with_capacity(delimiter.len() + 2);
        part_delimiter.extend_from_slice(b"\r\n");
        part_delimiter.extend_from_slice(&delimiter);

        Self {
            delimiter,
            part_delimiter,
            state: State::SeekBoundary,
            pending: BytesMut::new(),
            arguments: HashMap::new(),
            files: HashMap::new(),
            failed: false,
        }
    }

    fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    fn feed(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        if self.failed {
            return Err(MultipartError::Aborted.into());
        }
        if self.is_done() {
            return Ok(());
        }
        self.pending.extend_from_slice(chunk);

        let result = self.drain();
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// Runs the state machine until it needs more input.
    fn drain(&mut self) -> Result<(), BodyError> {
        loop {
            let progressed = match self.state {
                State::SeekBoundary => self.seek_boundary()?,
                State::PartHeaders => self.read_part_headers()?,
                State::PartBody(_) => self.read_part_body()?,
                State::Done => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn seek_boundary(&mut self) -> Result<bool, BodyError> {
        let Some(start) = memmem::find(&self.pending, &self.delimiter) else {
            // Keep just enough of the tail to complete a delimiter next time.
            let keep = self.delimiter.len() - 1;
            if self.pending.len() > keep {
                self.pending.advance(self.pending.len() - keep);
            }
            return Ok(false);
        };
        self.pending.advance(start);

        let after = self.delimiter.len();
        if self.pending.len() < after + 2 {
            return Ok(false);
        }
        if &self.pending[after..after + 2] == b"--" {
            debug!("multipart closing boundary reached");
            self.pending.clear();
            self.state = State::Done;
            return Ok(false);
        }

        // Transport padding may sit between the delimiter and its CRLF.
        match memmem::find(&self.pending[after..], b"\r\n") {
            Some(offset) => {
                self.pending.advance(after + offset + 2);
                self.state = State::PartHeaders;
                Ok(true)
            }
            None if self.pending.len() - after > MAX_PART_HEADERS_SIZE => {
                Err(MultipartError::HeadersTooLarge {
                    max: MAX_PART_HEADERS_SIZE,
                }
                .into())
            }
            None => Ok(false),
        }
    }

    fn read_part_headers(&mut self) -> Result<bool, BodyError> {
        let block = if self.pending.starts_with(b"\r\n") {
            self.pending.advance(2);
            BytesMut::new()
        } else {
            match memmem::find(&self.pending, b"\r\n\r\n") {
                Some(end) => {
                    let block = self.pending.split_to(end);
                    self.pending.advance(4);
                    block
                }
                None if self.pending.len() > MAX_PART_HEADERS_SIZE => {
                    return Err(MultipartError::HeadersTooLarge {
                        max: MAX_PART_HEADERS_SIZE,
                    }
                    .into());
                }
                None => return Ok(false),
            }
        };

        let part = open_part(&String::from_utf8_lossy(&block))?;
        debug!(
            name = %part.name,
            file_name = ?part.file_name,
            "multipart part started"
        );
        self.state = State::PartBody(part);
        Ok(true)
    }

    fn read_part_body(&mut self) -> Result<bool, BodyError> {
        let State::PartBody(part) = &mut self.state else {
            return Ok(false);
        };

        match memmem::find(&self.pending, &self.part_delimiter) {
            Some(end) => {
                let content = self.pending.split_to(end);
                part.write(&content)?;
                // Drop the CRLF, leaving `--boundary` for the next state.
                self.pending.advance(2);
                self.finish_part()?;
                Ok(true)
            }
            None => {
                // Withhold a possible partial delimiter at the tail.
                let keep = self.part_delimiter.len();
                if self.pending.len() > keep {
                    let content = self.pending.split_to(self.pending.len() - keep);
                    part.write(&content)?;
                }
                Ok(false)
            }
        }
    }

    fn finish_part(&mut self) -> Result<(), BodyError> {
        let State::PartBody(part) = std::mem::replace(&mut self.state, State::SeekBoundary)
        else {
            return Ok(());
        };
        let mime_type = part.mime_type();

        match part.sink {
            PartSink::Memory(data) => {
                let argument = MultipartArgument {
                    content_type: part.content_type,
                    mime_type,
                    data: data.freeze(),
                };
                self.arguments.insert(part.name, argument);
            }
            PartSink::File { mut file, path } => {
                file.flush()?;
                let entry = MultipartFile {
                    content_type: part.content_type,
                    mime_type,
                    file_name: part.file_name.unwrap_or_default(),
                    temporary_path: path,
                };
                if let Some(previous) = self.files.insert(part.name, entry) {
                    warn!(
                        path = %previous.temporary_path.display(),
                        "multipart control name repeated; earlier file part replaced"
                    );
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), BodyError> {
        if self.failed {
            return Err(MultipartError::Aborted.into());
        }
        if self.is_done() {
            return Ok(());
        }
        self.abort();
        Err(MultipartError::Truncated.into())
    }

    /// Drops the part in progress, removing its incomplete temporary file.
    fn abort(&mut self) {
        self.failed = true;
        if let State::PartBody(Part {
            sink: PartSink::File { path, .. },
            ..
        }) = std::mem::replace(&mut self.state, State::Done)
        {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove incomplete upload");
            }
        }
        self.pending.clear();
    }
}

// A request dropped mid-body (connection aborted) must not leave the
// half-written upload behind.
impl Drop for MultipartParser {
    fn drop(&mut self) {
        if let State::PartBody(Part {
            sink: PartSink::File { path, .. },
            ..
        }) = &self.state
        {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Parses a part's header block and opens the sink its content goes to.
fn open_part(block: &str) -> Result<Part, BodyError> {
    let mut name = None;
    let mut file_name = None;
    let mut content_type = None;

    for line in block.split("\r\n").filter(|l| !l.is_empty()) {
        let (header, value) = line
            .split_once(':')
            .ok_or_else(|| MultipartError::MalformedHeader {
                line: line.to_owned(),
            })?;
        let value = value.trim();

        if header.trim().eq_ignore_ascii_case("content-disposition") {
            name = header_parameter(value, "name");
            file_name = header_parameter(value, "filename");
        } else if header.trim().eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_owned());
        }
    }

    let name = name.ok_or(MultipartError::MissingControlName)?;
    let sink = if file_name.is_some() {
        let (file, path) = create_temp_file()?;
        PartSink::File { file, path }
    } else {
        PartSink::Memory(BytesMut::new())
    };

    Ok(Part {
        name,
        file_name,
        content_type,
        sink,
    })
}

/// A `multipart/form-data` request, parsed incrementally as it arrives.
///
/// The variant declines requests whose `Content-Type` is not
/// `multipart/form-data` or carries no `boundary` parameter.
#[derive(Debug)]
pub struct MultipartFormRequest {
    request: Request,
    boundary: String,
    parser: Option<MultipartParser>,
    arguments: HashMap<String, MultipartArgument>,
    files: HashMap<String, MultipartFile>,
}

impl MultipartFormRequest {
    /// MIME type of the bodies this variant parses.
    pub const MIME_TYPE: &'static str = "multipart/form-data";

    /// Returns the boundary taken from the `Content-Type` header.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Fields submitted without a filename, by control name.
    pub fn arguments(&self) -> &HashMap<String, MultipartArgument> {
        &self.arguments
    }

    /// Fields submitted with a filename, by control name.
    pub fn files(&self) -> &HashMap<String, MultipartFile> {
        &self.files
    }

    /// Shorthand for the text value of a field.
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(MultipartArgument::string)
    }

    pub fn file(&self, name: &str) -> Option<&MultipartFile> {
        self.files.get(name)
    }
}

impl ByteSink for MultipartFormRequest {
    fn open(&mut self) -> Result<(), BodyError> {
        self.parser = Some(MultipartParser::new(&self.boundary));
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        self.parser
            .as_mut()
            .ok_or(BodyError::NotOpen)?
            .feed(chunk)
    }

    fn close(&mut self) -> Result<(), BodyError> {
        // A second close finds the parser already taken.
        let Some(mut parser) = self.parser.take() else {
            return Ok(());
        };
        parser.finish()?;
        self.arguments = std::mem::take(&mut parser.arguments);
        self.files = std::mem::take(&mut parser.files);
        Ok(())
    }
}

impl RequestBody for MultipartFormRequest {
    fn from_request(request: Request) -> Option<Self> {
        let content_type = request.content_type()?;
        if !mime_essence(content_type).eq_ignore_ascii_case(Self::MIME_TYPE) {
            return None;
        }
        let boundary = match header_parameter(content_type, "boundary") {
            Some(b) if !b.is_empty() => b,
            _ => {
                warn!(content_type, "{}", MultipartError::MissingBoundary);
                return None;
            }
        };
        Some(Self {
            request,
            boundary,
            parser: None,
            arguments: HashMap::new(),
            files: HashMap::new(),
        })
    }

    fn request(&self) -> &Request {
        &self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "----PorticoBoundary7MA4YWxk";

    fn form_request(boundary: &str, len: usize) -> MultipartFormRequest {
        let raw = format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary={boundary}\r\n\
             Content-Length: {len}\r\n\r\n"
        );
        let (head, _) = Request::parse(raw.as_bytes()).unwrap();
        MultipartFormRequest::from_request(head).unwrap()
    }

    fn sample_body() -> Vec<u8> {
        format!(
            "preamble to be ignored\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"name\"\r\n\
             \r\n\
             bar\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
             Content-Type: application/octet-stream\r\n\
             \r\n\
             XYZ\r\n--not-the-boundary\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"empty\"\r\n\
             \r\n\
             \r\n\
             --{BOUNDARY}--\r\n\
             epilogue"
        )
        .into_bytes()
    }

    fn parse_in_chunks(body: &[u8], split: impl Fn(&[u8]) -> Vec<&[u8]>) -> MultipartFormRequest {
        let mut req = form_request(BOUNDARY, body.len());
        req.open().unwrap();
        for chunk in split(body) {
            req.write(chunk).unwrap();
        }
        req.close().unwrap();
        req
    }

    fn assert_sample(req: &MultipartFormRequest) {
        assert_eq!(req.arguments().len(), 2);
        assert_eq!(req.files().len(), 1);
        assert_eq!(req.argument("name"), Some("bar"));
        assert_eq!(req.argument("empty"), Some(""));

        let upload = req.file("upload").unwrap();
        assert_eq!(upload.file_name(), "a.txt");
        assert_eq!(upload.mime_type(), "application/octet-stream");
        assert_eq!(
            std::fs::read(upload.temporary_path()).unwrap(),
            b"XYZ\r\n--not-the-boundary"
        );
    }

    fn cleanup(req: &MultipartFormRequest) {
        for file in req.files().values() {
            let _ = std::fs::remove_file(file.temporary_path());
        }
    }

    #[test]
    fn single_write() {
        let body = sample_body();
        let req = parse_in_chunks(&body, |b| vec![b]);
        assert_sample(&req);
        cleanup(&req);
    }

    #[test]
    fn every_two_way_split() {
        let body = sample_body();
        for at in 0..=body.len() {
            let req = parse_in_chunks(&body, |b| {
                let (a, c) = b.split_at(at);
                vec![a, c]
            });
            assert_sample(&req);
            cleanup(&req);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let body = sample_body();
        let req = parse_in_chunks(&body, |b| b.chunks(1).collect());
        assert_sample(&req);
        cleanup(&req);
    }

    #[test]
    fn split_in_middle_of_boundary_marker() {
        let body = sample_body();
        let marker = format!("\r\n--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"upload\"");
        let start = memmem::find(&body, marker.as_bytes()).unwrap();
        let mid = start + marker.len() / 4;
        let req = parse_in_chunks(&body, |b| vec![&b[..mid], &b[mid..]]);
        assert_sample(&req);
        cleanup(&req);
    }

    #[test]
    fn default_mime_type_is_text_plain() {
        let body = sample_body();
        let req = parse_in_chunks(&body, |b| vec![b]);
        let arg = &req.arguments()["name"];
        assert_eq!(arg.content_type(), None);
        assert_eq!(arg.mime_type(), "text/plain");
        cleanup(&req);
    }

    #[test]
    fn repeated_control_name_keeps_last() {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\nfirst\r\n\
             --{BOUNDARY}\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\nsecond\r\n\
             --{BOUNDARY}--"
        );
        let req = parse_in_chunks(body.as_bytes(), |b| vec![b]);
        assert_eq!(req.arguments().len(), 1);
        assert_eq!(req.argument("x"), Some("second"));
    }

    #[test]
    fn quoted_file_name_may_contain_semicolon() {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"up\"; filename=\"a;b.txt\"\r\n\
             \r\nabc\r\n--{BOUNDARY}--"
        );
        let req = parse_in_chunks(body.as_bytes(), |b| vec![b]);
        let upload = req.file("up").unwrap();
        assert_eq!(upload.file_name(), "a;b.txt");
        assert_eq!(std::fs::read(upload.temporary_path()).unwrap(), b"abc");
        cleanup(&req);
    }

    #[test]
    fn binary_argument_has_no_string() {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"blob\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\x00\x01\r\n--{BOUNDARY}--"
        );
        let req = parse_in_chunks(body.as_bytes(), |b| vec![b]);
        let blob = &req.arguments()["blob"];
        assert_eq!(blob.data().as_ref(), b"\x00\x01");
        assert_eq!(blob.string(), None);
    }

    #[test]
    fn missing_name_is_an_error() {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data\r\n\r\nvalue\r\n--{BOUNDARY}--"
        );
        let mut req = form_request(BOUNDARY, body.len());
        req.open().unwrap();
        let err = req.write(body.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            BodyError::Multipart(MultipartError::MissingControlName)
        ));
        assert!(matches!(
            req.write(b"more"),
            Err(BodyError::Multipart(MultipartError::Aborted))
        ));
        assert!(req.close().is_err());
    }

    #[test]
    fn truncated_body_fails_on_close() {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"f\"; filename=\"f.bin\"\r\n\r\npartial"
        );
        let mut req = form_request(BOUNDARY, body.len());
        req.open().unwrap();
        req.write(body.as_bytes()).unwrap();
        let err = req.close().unwrap_err();
        assert!(matches!(err, BodyError::Multipart(MultipartError::Truncated)));
        assert!(req.files().is_empty());
    }

    #[test]
    fn dropping_mid_upload_removes_partial_file() {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"f\"; filename=\"f.bin\"\r\n\r\npartial data"
        );
        let mut req = form_request(BOUNDARY, body.len() + 100);
        req.open().unwrap();
        req.write(body.as_bytes()).unwrap();
        let path = match &req.parser.as_ref().unwrap().state {
            State::PartBody(Part {
                sink: PartSink::File { path, .. },
                ..
            }) => path.clone(),
            other => panic!("unexpected state {other:?}"),
        };
        assert!(path.exists());
        drop(req);
        assert!(!path.exists());
    }

    #[test]
    fn close_is_idempotent_and_ignores_epilogue() {
        let body = format!("--{BOUNDARY}--\r\n");
        let mut req = form_request(BOUNDARY, body.len());
        req.open().unwrap();
        req.write(body.as_bytes()).unwrap();
        req.write(b"trailing junk --").unwrap();
        req.close().unwrap();
        req.close().unwrap();
        assert!(req.arguments().is_empty());
    }

    #[test]
    fn declines_without_boundary() {
        let raw = "POST / HTTP/1.1\r\nContent-Type: multipart/form-data\r\n\r\n";
        let (head, _) = Request::parse(raw.as_bytes()).unwrap();
        assert!(MultipartFormRequest::from_request(head).is_none());

        let raw = "POST / HTTP/1.1\r\nContent-Type: text/plain; boundary=x\r\n\r\n";
        let (head, _) = Request::parse(raw.as_bytes()).unwrap();
        assert!(MultipartFormRequest::from_request(head).is_none());
    }

    #[test]
    fn quoted_boundary() {
        let raw = "POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=\"a b\"\r\n\r\n";
        let (head, _) = Request::parse(raw.as_bytes()).unwrap();
        let req = MultipartFormRequest::from_request(head).unwrap();
        assert_eq!(req.boundary(), "a b");
    }
}

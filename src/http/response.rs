//! HTTP/1.1 responses and the byte sources that produce their bodies.
//!
//! A [`Response`] knows its status, content type, content length, cache
//! lifetime and extra headers before the first byte is sent. The body is
//! pulled from a [`ByteSource`]: an in-memory buffer, a file, or nothing for
//! status-only responses and redirects.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};

use super::stream::ByteSource;
use super::{DEFAULT_MIME_TYPE, Headers, StatusCode};

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const JSON_CONTENT_TYPE: &str = "application/json";

/// An HTTP/1.1 response, produced by a processing function and streamed out
/// by the connection.
///
/// # Examples
///
/// ```
/// use portico::http::{Response, StatusCode};
///
/// let response = Response::text("Hello")
///     .cache_max_age(60)
///     .header("X-Request-Id", "abc-123");
///
/// let head = response.head_bytes("Portico");
/// let text = std::str::from_utf8(&head).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 5\r\n"));
/// assert!(text.contains("Cache-Control: public, max-age=60\r\n"));
/// ```
pub struct Response {
    status: StatusCode,
    content_type: Option<String>,
    content_length: u64,
    max_age: u32,
    headers: Headers,
    body: Option<Box<dyn ByteSource>>,
}

impl Response {
    /// Creates a response with the given status and no body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            content_length: 0,
            max_age: 0,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Creates a response whose body is pulled from `source`.
    ///
    /// `content_length` must be the exact number of bytes `source` yields.
    pub fn from_source(
        source: Box<dyn ByteSource>,
        content_type: impl Into<String>,
        content_length: u64,
    ) -> Self {
        Self {
            content_type: Some(content_type.into()),
            content_length,
            body: Some(source),
            ..Self::new(StatusCode::Ok)
        }
    }

    /// Creates a `302 Found` (or `301 Moved Permanently`) redirect to `location`.
    pub fn redirect(location: impl Into<String>, permanent: bool) -> Self {
        let status = if permanent {
            StatusCode::MovedPermanently
        } else {
            StatusCode::Found
        };
        Self::new(status).header("Location", location)
    }

    /// Creates a response that sends `data` with the given content type.
    pub fn data(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        let data = data.into();
        let length = data.len() as u64;
        Self::from_source(Box::new(DataSource::new(data)), content_type, length)
    }

    /// Creates a `text/plain` response encoded as UTF-8.
    pub fn text(text: impl Into<String>) -> Self {
        Self::data(text.into(), TEXT_CONTENT_TYPE)
    }

    /// Creates a `text/html` response encoded as UTF-8.
    pub fn html(html: impl Into<String>) -> Self {
        Self::data(html.into(), HTML_CONTENT_TYPE)
    }

    /// Creates an `application/json` response from any serializable value.
    pub fn json<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: serde::Serialize + ?Sized,
    {
        Ok(Self::data(serde_json::to_vec(value)?, JSON_CONTENT_TYPE))
    }

    /// Loads an HTML template and replaces every `%name%` with `variables["name"]`.
    ///
    /// Substitution is a single left-to-right pass, so inserted values are never
    /// scanned again. Placeholders with no matching variable are left as-is.
    ///
    /// # Errors
    ///
    /// Fails if the template cannot be read or is not valid UTF-8.
    pub fn html_template(
        path: impl AsRef<Path>,
        variables: &HashMap<String, String>,
    ) -> io::Result<Self> {
        let template = std::fs::read_to_string(path)?;
        Ok(Self::html(render_template(&template, variables)))
    }

    /// Creates a response streaming the file at `path`.
    ///
    /// The content type is guessed from the extension and falls back to
    /// `application/octet-stream`.
    ///
    /// # Errors
    ///
    /// Fails if `path` does not exist or is not a regular file.
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let content_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or(DEFAULT_MIME_TYPE);
        Ok(Self::from_source(
            Box::new(FileSource::new(path.to_path_buf(), metadata.len())),
            content_type,
            metadata.len(),
        ))
    }

    /// Like [`file`](Self::file), but asks the client to download the file
    /// instead of displaying it.
    pub fn file_attachment(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let response = Self::file(path)?;
        let disposition = match path.file_name() {
            Some(name) => format!(
                "attachment; filename=\"{}\"",
                name.to_string_lossy().replace('"', "")
            ),
            None => "attachment".to_owned(),
        };
        Ok(response.header("Content-Disposition", disposition))
    }

    /// Sets the status code.
    #[must_use]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Sets how long clients may cache the response, in seconds. 0 means `no-cache`.
    #[must_use]
    pub fn cache_max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self
    }

    /// Sets an additional header. Setting the same name again replaces the value.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Returns the status code of this response.
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Returns the content type; `None` means the response has no body.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_length(&self) -> u64 {
        if self.has_body() { self.content_length } else { 0 }
    }

    pub fn max_age(&self) -> u32 {
        self.max_age
    }

    /// Returns the additional headers in the order they were first set.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` if a body will be sent.
    pub fn has_body(&self) -> bool {
        self.content_type.is_some()
    }

    /// Serializes the status line and headers, including the blank line.
    ///
    /// Headers are written in a fixed order: `Content-Type` (only when there is
    /// a body), `Content-Length`, `Cache-Control`, `Connection: close`,
    /// `Server`, then the additional headers.
    pub fn head_bytes(&self, server_name: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(192 + self.headers.len() * 64);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        if let Some(content_type) = self.content_type.as_deref() {
            buf.put(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        buf.put(format!("Content-Length: {}\r\n", self.content_length()).as_bytes());
        buf.put(format!("Cache-Control: {}\r\n", self.cache_control()).as_bytes());
        buf.put(&b"Connection: close\r\n"[..]);
        buf.put(format!("Server: {server_name}\r\n").as_bytes());
        buf.put(self.headers.to_string().as_bytes());

        // Header/body separator
        buf.put(&b"\r\n"[..]);
        buf
    }

    fn cache_control(&self) -> String {
        if self.max_age == 0 {
            "no-cache".to_owned()
        } else {
            format!("public, max-age={}", self.max_age)
        }
    }
}

impl ByteSource for Response {
    fn open(&mut self) -> io::Result<()> {
        match self.body.as_mut() {
            Some(body) if self.content_type.is_some() => body.open(),
            _ => Ok(()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.body.as_mut() {
            Some(body) if self.content_type.is_some() => body.read(buf),
            _ => Ok(0),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.body.as_mut() {
            Some(body) if self.content_type.is_some() => body.close(),
            _ => Ok(()),
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("max_age", &self.max_age)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Serves a fixed in-memory buffer.
#[derive(Debug)]
pub struct DataSource {
    data: Bytes,
    offset: usize,
}

impl DataSource {
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }
}

impl ByteSource for DataSource {
    fn open(&mut self) -> io::Result<()> {
        self.offset = 0;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Streams a file sequentially.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    expected_len: u64,
    file: Option<File>,
}

impl FileSource {
    pub fn new(path: PathBuf, expected_len: u64) -> Self {
        Self {
            path,
            expected_len,
            file: None,
        }
    }
}

impl ByteSource for FileSource {
    fn open(&mut self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len != self.expected_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{} changed size from {} to {len} bytes",
                    self.path.display(),
                    self.expected_len
                ),
            ));
        }
        self.file = Some(file);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "file source not open")),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}

/// Replaces `%name%` placeholders in a single pass.
fn render_template(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) => match variables.get(&after[..end]) {
                Some(value) => {
                    out.push_str(value);
                    rest = &after[end + 1..];
                }
                None => {
                    // The closing '%' may open the next placeholder.
                    out.push('%');
                    rest = after;
                }
            },
            None => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_string(r: &Response) -> String {
        String::from_utf8(r.head_bytes("Portico").to_vec()).unwrap()
    }

    fn read_all(r: &mut Response) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        r.open().unwrap();
        loop {
            let n = r.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        r.close().unwrap();
        out
    }

    #[test]
    fn data_response_reproduces_bytes() {
        let payload = b"\x00binary\xffpayload".to_vec();
        let mut r = Response::data(payload.clone(), "application/x-thing");
        let head = head_string(&r);
        assert!(head.contains("Content-Type: application/x-thing\r\n"));
        assert!(head.contains(&format!("Content-Length: {}\r\n", payload.len())));
        assert_eq!(read_all(&mut r), payload);
    }

    #[test]
    fn status_only_has_no_content_type() {
        let mut r = Response::new(StatusCode::NoContent);
        let s = head_string(&r);
        assert!(s.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
        assert!(s.contains("Cache-Control: no-cache\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
        assert!(read_all(&mut r).is_empty());
    }

    #[test]
    fn header_order() {
        let r = Response::text("ok")
            .header("X-B", "2")
            .header("X-A", "1")
            .header("x-b", "3");
        let s = head_string(&r);
        let ct = s.find("Content-Type").unwrap();
        let cl = s.find("Content-Length").unwrap();
        let cc = s.find("Cache-Control").unwrap();
        let xb = s.find("X-B: 3").unwrap();
        let xa = s.find("X-A: 1").unwrap();
        assert!(ct < cl && cl < cc && cc < xb && xb < xa);
        assert!(s.contains("Server: Portico\r\n"));
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn redirect() {
        let r = Response::redirect("/elsewhere", false);
        assert_eq!(r.status_code(), StatusCode::Found);
        assert_eq!(r.content_length(), 0);
        assert!(head_string(&r).contains("Location: /elsewhere\r\n"));

        let r = Response::redirect("https://example.com/", true);
        assert!(head_string(&r).starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
    }

    #[test]
    fn json_response() {
        let mut r = Response::json(&serde_json::json!({"ok": true})).unwrap();
        assert_eq!(r.content_type(), Some("application/json"));
        assert_eq!(read_all(&mut r), br#"{"ok":true}"#);
    }

    #[test]
    fn template_substitution() {
        let vars: HashMap<String, String> = [
            ("name".to_owned(), "World".to_owned()),
            ("loop".to_owned(), "%name%".to_owned()),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            render_template("Hello %name%! 100% %unknown% %loop% %", &vars),
            "Hello World! 100% %unknown% %name% %"
        );
    }

    #[test]
    fn template_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<h1>%title%</h1>").unwrap();
        let vars = HashMap::from([("title".to_owned(), "Hi".to_owned())]);

        let mut r = Response::html_template(&path, &vars).unwrap();
        assert_eq!(r.content_type(), Some("text/html; charset=utf-8"));
        assert_eq!(read_all(&mut r), b"<h1>Hi</h1>");

        assert!(Response::html_template(dir.path().join("missing.html"), &vars).is_err());
    }

    #[test]
    fn file_response_and_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "0123456789").unwrap();

        let mut r = Response::file(&path).unwrap();
        assert_eq!(r.content_length(), 10);
        assert_eq!(r.content_type(), Some("text/plain"));
        assert_eq!(read_all(&mut r), b"0123456789");

        let r = Response::file_attachment(&path).unwrap();
        assert_eq!(
            r.headers().get("content-disposition"),
            Some("attachment; filename=\"notes.txt\"")
        );

        assert!(Response::file(dir.path()).is_err());
    }

    #[test]
    fn unknown_extension_is_octet_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.zzqx");
        std::fs::write(&path, "x").unwrap();
        let r = Response::file(&path).unwrap();
        assert_eq!(r.content_type(), Some(DEFAULT_MIME_TYPE));
    }

    #[test]
    fn file_changed_after_construction_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.bin");
        std::fs::write(&path, "ab").unwrap();
        let mut r = Response::file(&path).unwrap();
        std::fs::write(&path, "abcd").unwrap();
        assert!(r.open().is_err());
    }
}

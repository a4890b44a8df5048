//! Request variants that store the raw body: in memory or in a temporary file.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tracing::warn;

use super::request::{Request, RequestBody};
use super::stream::{BodyError, ByteSink};

/// Upper bound on the buffer reserved up front from `Content-Length`.
const MAX_PREALLOCATION: u64 = 1024 * 1024;

/// Creates a persisted temporary file for body storage.
///
/// The file survives the request: whoever handles the request owns it and is
/// responsible for moving or deleting it.
pub(crate) fn create_temp_file() -> std::io::Result<(File, PathBuf)> {
    tempfile::Builder::new()
        .prefix("portico-")
        .tempfile()?
        .keep()
        .map_err(|e| e.error)
}

/// A request whose body is collected into memory.
///
/// [`data`](Self::data) is only meaningful after the open / write / close
/// sequence has completed, which is always the case inside a processing
/// function.
#[derive(Debug)]
pub struct DataRequest {
    request: Request,
    buffer: BytesMut,
    data: Bytes,
}

impl DataRequest {
    /// Returns the complete body.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns the body as UTF-8 text, or `None` if it is not valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Deserializes the body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.data)
    }

    /// Consumes the request, returning the head and the body.
    pub fn into_parts(self) -> (Request, Bytes) {
        (self.request, self.data)
    }
}

impl ByteSink for DataRequest {
    fn open(&mut self) -> Result<(), BodyError> {
        let reserve = self.request.content_length().min(MAX_PREALLOCATION) as usize;
        self.buffer = BytesMut::with_capacity(reserve);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BodyError> {
        self.data = std::mem::take(&mut self.buffer).freeze();
        Ok(())
    }
}

impl RequestBody for DataRequest {
    fn from_request(request: Request) -> Option<Self> {
        Some(Self {
            request,
            buffer: BytesMut::new(),
            data: Bytes::new(),
        })
    }

    fn request(&self) -> &Request {
        &self.request
    }
}

/// A request whose body is streamed to a temporary file on disk.
///
/// Once the body is complete the processing function owns
/// [`file_path`](Self::file_path) and the file outlives the request. A body
/// that never completes has its file removed when the request is dropped.
#[derive(Debug)]
pub struct FileRequest {
    request: Request,
    file: Option<File>,
    path: Option<PathBuf>,
    complete: bool,
}

impl FileRequest {
    /// Returns the path of the stored body, once the body has been opened.
    pub fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl ByteSink for FileRequest {
    fn open(&mut self) -> Result<(), BodyError> {
        let (file, path) = create_temp_file()?;
        self.file = Some(file);
        self.path = Some(path);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        let file = self.file.as_mut().ok_or(BodyError::NotOpen)?;
        file.write_all(chunk)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), BodyError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        self.complete = self.path.is_some();
        Ok(())
    }
}

impl Drop for FileRequest {
    fn drop(&mut self) {
        if self.complete {
            return;
        }
        self.file = None;
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove unfinished body file");
            }
        }
    }
}

impl RequestBody for FileRequest {
    fn from_request(request: Request) -> Option<Self> {
        Some(Self {
            request,
            file: None,
            path: None,
            complete: false,
        })
    }

    fn request(&self) -> &Request {
        &self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    #[test]
    fn data_request_collects_chunks() {
        let mut req = DataRequest::from_request(head(
            "POST /echo HTTP/1.1\r\nContent-Length: 11\r\n\r\n",
        ))
        .unwrap();
        req.open().unwrap();
        req.write(b"hello ").unwrap();
        req.write(b"world").unwrap();
        req.close().unwrap();
        assert_eq!(req.data().as_ref(), b"hello world");
        assert_eq!(req.text(), Some("hello world"));

        let (head, data) = req.into_parts();
        assert_eq!(head.path(), "/echo");
        assert_eq!(data.as_ref(), b"hello world");
    }

    #[test]
    fn data_request_json() {
        let mut req = DataRequest::from_request(head("POST / HTTP/1.1\r\n\r\n")).unwrap();
        req.open().unwrap();
        req.write(br#"{"n": 3}"#).unwrap();
        req.close().unwrap();
        let value: serde_json::Value = req.json().unwrap();
        assert_eq!(value["n"], 3);
    }

    #[test]
    fn file_request_persists_body() {
        let mut req = FileRequest::from_request(head(
            "PUT /upload HTTP/1.1\r\nContent-Length: 6\r\n\r\n",
        ))
        .unwrap();
        req.open().unwrap();
        req.write(b"abc").unwrap();
        req.write(b"def").unwrap();
        req.close().unwrap();

        let path = req.file_path().unwrap().to_path_buf();
        drop(req);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn unfinished_file_request_removes_its_file() {
        let mut req = FileRequest::from_request(head(
            "PUT /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\n",
        ))
        .unwrap();
        req.open().unwrap();
        req.write(b"partial").unwrap();

        let path = req.file_path().unwrap().to_path_buf();
        assert!(path.exists());
        drop(req);
        assert!(!path.exists());
    }

    #[test]
    fn file_request_write_before_open_fails() {
        let mut req = FileRequest::from_request(head("PUT / HTTP/1.1\r\n\r\n")).unwrap();
        assert!(matches!(req.write(b"x"), Err(BodyError::NotOpen)));
    }
}

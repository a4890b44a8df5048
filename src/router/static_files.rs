use std::path::PathBuf;

use tracing::debug;

use crate::http::{Request, Response, StatusCode};

/// Serves a local directory tree below a URL base path.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    base_path: String,
    root: PathBuf,
    index_filename: Option<String>,
    cache_age: u32,
}

impl StaticFiles {
    /// Creates a file server mapping `base_path` onto `root`.
    ///
    /// `base_path` is normalized to start with `/`.
    pub fn new(
        base_path: &str,
        root: impl Into<PathBuf>,
        index_filename: Option<&str>,
        cache_age: u32,
    ) -> Self {
        let base_path = if base_path.starts_with('/') {
            base_path.to_owned()
        } else {
            format!("/{base_path}")
        };
        Self {
            base_path,
            root: root.into(),
            index_filename: index_filename.map(str::to_owned),
            cache_age,
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Maps a request path onto the local tree.
    ///
    /// Returns `None` when the path escapes the root through a `..` segment.
    pub fn local_path(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path
            .strip_prefix(self.base_path.as_str())
            .unwrap_or(request_path);

        let mut local = self.root.clone();
        for segment in relative.split('/') {
            match segment {
                "" | "." => {}
                ".." => return None,
                s if s.contains('\\') || s.contains('\0') => return None,
                s => local.push(s),
            }
        }
        Some(local)
    }

    /// Produces the response for a `GET` below the base path.
    pub fn serve(&self, request: &Request) -> Response {
        let Some(mut local) = self.local_path(request.path()) else {
            debug!(path = request.path(), "rejected path outside of root");
            return Response::new(StatusCode::Forbidden);
        };

        if local.is_dir() {
            match &self.index_filename {
                Some(index) => local.push(index),
                None => return Response::new(StatusCode::NotFound),
            }
        }

        match Response::file(&local) {
            Ok(response) => response.cache_max_age(self.cache_age),
            Err(e) => {
                debug!(path = %local.display(), error = %e, "static file unavailable");
                Response::new(StatusCode::NotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ByteSource;
    use crate::router::{Resolution, Router};

    fn make_request(path: &str) -> Request {
        let raw = format!("GET {path} HTTP/1.1\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/guide.txt"), "read me").unwrap();
        dir
    }

    fn body_of(mut response: Response) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        response.open().unwrap();
        loop {
            let n = response.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        response.close().unwrap();
        out
    }

    #[test]
    fn local_path_rejects_traversal() {
        let files = StaticFiles::new("/static", "/srv/www", None, 0);
        assert_eq!(
            files.local_path("/static/css/site.css"),
            Some(PathBuf::from("/srv/www/css/site.css"))
        );
        assert_eq!(files.local_path("/static/../etc/passwd"), None);
        assert_eq!(files.local_path("/static/a/../../b"), None);
        assert_eq!(
            files.local_path("/static/./a//b"),
            Some(PathBuf::from("/srv/www/a/b"))
        );
    }

    #[test]
    fn base_path_is_normalized() {
        let files = StaticFiles::new("assets", "/srv", None, 0);
        assert_eq!(files.base_path(), "/assets");
    }

    #[test]
    fn serves_file_with_cache_age() {
        let dir = fixture();
        let files = StaticFiles::new("/", dir.path(), None, 3600);
        let response = files.serve(&make_request("/docs/guide.txt"));
        assert_eq!(response.status_code(), StatusCode::Ok);
        assert_eq!(response.max_age(), 3600);
        assert_eq!(response.content_type(), Some("text/plain"));
        assert_eq!(body_of(response), b"read me");
    }

    #[test]
    fn directory_falls_back_to_index() {
        let dir = fixture();
        let files = StaticFiles::new("/", dir.path(), Some("index.html"), 0);
        let response = files.serve(&make_request("/"));
        assert_eq!(response.status_code(), StatusCode::Ok);
        assert_eq!(body_of(response), b"<h1>home</h1>");

        let response = files.serve(&make_request("/index.html"));
        assert_eq!(body_of(response), b"<h1>home</h1>");
    }

    #[test]
    fn directory_without_index_is_not_found() {
        let dir = fixture();
        let files = StaticFiles::new("/", dir.path(), None, 0);
        let response = files.serve(&make_request("/docs"));
        assert_eq!(response.status_code(), StatusCode::NotFound);
    }

    #[test]
    fn missing_file_is_not_found_and_traversal_forbidden() {
        let dir = fixture();
        let files = StaticFiles::new("/", dir.path(), None, 0);
        assert_eq!(
            files.serve(&make_request("/nope.txt")).status_code(),
            StatusCode::NotFound
        );
        assert_eq!(
            files.serve(&make_request("/docs/../../secret")).status_code(),
            StatusCode::Forbidden
        );
    }

    #[test]
    fn router_serves_only_get_below_base() {
        let dir = fixture();
        let mut router = Router::new();
        router.add_handler_for_base_path("/files/", dir.path(), Some("index.html"), 60);

        match router.resolve(&make_request("/files/docs/guide.txt")) {
            Resolution::Matched(resolved) => {
                let response = resolved.process().unwrap();
                assert_eq!(response.max_age(), 60);
            }
            other => panic!("expected a match, got {other:?}"),
        }

        assert!(matches!(
            router.resolve(&make_request("/other/guide.txt")),
            Resolution::NotFound
        ));

        let (post, _) = Request::parse(b"POST /files/docs/guide.txt HTTP/1.1\r\n\r\n").unwrap();
        assert!(matches!(router.resolve(&post), Resolution::MethodNotAllowed));
    }
}

//! Handler registry: resolves a parsed request head to a request variant and
//! the processing function that will consume it.
//!
//! A handler is a *match predicate* paired with a *processing function*. The
//! predicate looks at the request head and either declines (`None`) or builds
//! the request variant that will receive the body. Once the body has been
//! stored, the connection hands the finished request to the processing
//! function, which returns the [`Response`].
//!
//! | Registration                                   | Matches                                     |
//! |------------------------------------------------|---------------------------------------------|
//! | [`Router::add_handler`]                        | whatever the predicate accepts              |
//! | [`Router::add_handler_for_path`]               | method + path, path compared ignoring case  |
//! | [`Router::add_handler_for_path_regex`]         | method + case-insensitive regex on the path |
//! | [`Router::add_handler_for_base_path`]          | `GET` for files under a base path           |
//! | [`Router::add_default_handler`]                | method only, any path                       |
//!
//! Handlers are tried **newest first**: a handler registered later overrides
//! any earlier one that would also match, so specific routes can be layered
//! on top of a catch-all.

use std::fmt;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::http::stream::{BodyError, ByteSink};
use crate::http::{Method, Request, RequestBody, Response};

mod static_files;

pub use static_files::StaticFiles;

/// Type-erased processing function for request variant `R`.
///
/// Returning `None` is reported to the client as `500 Internal Server Error`.
pub type ProcessFn<R> = dyn Fn(R) -> Option<Response> + Send + Sync + 'static;

/// Type-erased match predicate for request variant `R`.
pub type MatchFn<R> = dyn Fn(&Request) -> Option<R> + Send + Sync + 'static;

/// A matched request variant together with its processing function.
trait Exchange: Send {
    fn request(&self) -> &Request;

    fn sink(&mut self) -> &mut dyn ByteSink;

    fn process(self: Box<Self>) -> Option<Response>;
}

struct Bound<R> {
    request: R,
    process: Arc<ProcessFn<R>>,
}

impl<R: RequestBody> Exchange for Bound<R> {
    fn request(&self) -> &Request {
        self.request.request()
    }

    fn sink(&mut self) -> &mut dyn ByteSink {
        &mut self.request
    }

    fn process(self: Box<Self>) -> Option<Response> {
        (self.process)(self.request)
    }
}

// What a single handler says about a request head.
enum Candidate {
    Accept(Box<dyn Exchange>),
    // The path belongs to this handler but the method does not.
    WrongMethod,
    Decline,
}

trait Handler: Send + Sync {
    fn offer(&self, request: &Request) -> Candidate;
}

// A handler driven by an arbitrary predicate.
struct PredicateHandler<R> {
    matcher: Box<MatchFn<R>>,
    process: Arc<ProcessFn<R>>,
}

impl<R: RequestBody> Handler for PredicateHandler<R> {
    fn offer(&self, request: &Request) -> Candidate {
        match (self.matcher)(request) {
            Some(matched) => Candidate::Accept(Box::new(Bound {
                request: matched,
                process: Arc::clone(&self.process),
            })),
            None => Candidate::Decline,
        }
    }
}

// How a method-bound handler selects paths.
enum PathRule {
    Any,
    // Stored lowercased.
    Exact(String),
    Regex(Regex),
    // Case-sensitive prefix ending on a segment boundary.
    Base(String),
}

impl PathRule {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathRule::Any => true,
            PathRule::Exact(expected) => path.to_lowercase() == *expected,
            PathRule::Regex(regex) => regex.is_match(path),
            PathRule::Base(base) => match path.strip_prefix(base.as_str()) {
                Some(rest) => base.ends_with('/') || rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }
}

// A handler bound to one method and a path rule.
struct RouteHandler<R> {
    method: Method,
    rule: PathRule,
    process: Arc<ProcessFn<R>>,
}

impl<R: RequestBody> Handler for RouteHandler<R> {
    fn offer(&self, request: &Request) -> Candidate {
        if !self.rule.matches(request.path()) {
            return Candidate::Decline;
        }
        if request.method() != &self.method {
            return match self.rule {
                PathRule::Any => Candidate::Decline,
                _ => Candidate::WrongMethod,
            };
        }
        match R::from_request(request.clone()) {
            Some(matched) => Candidate::Accept(Box::new(Bound {
                request: matched,
                process: Arc::clone(&self.process),
            })),
            None => Candidate::Decline,
        }
    }
}

/// A request paired with the processing function that will handle it.
///
/// Body bytes are written through the [`ByteSink`] implementation; once the
/// body is closed, [`process`](Self::process) runs the processing function.
pub struct Resolved {
    exchange: Box<dyn Exchange>,
}

impl Resolved {
    /// Returns the parsed head of the matched request.
    pub fn request(&self) -> &Request {
        self.exchange.request()
    }

    /// Runs the processing function with the completed request.
    pub fn process(self) -> Option<Response> {
        self.exchange.process()
    }
}

impl ByteSink for Resolved {
    fn open(&mut self) -> Result<(), BodyError> {
        self.exchange.sink().open()
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), BodyError> {
        self.exchange.sink().write(chunk)
    }

    fn close(&mut self) -> Result<(), BodyError> {
        self.exchange.sink().close()
    }
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("method", self.request().method())
            .field("path", &self.request().path())
            .finish_non_exhaustive()
    }
}

/// Result of [`Router::resolve`].
#[derive(Debug)]
pub enum Resolution {
    Matched(Resolved),
    /// No handler accepted the request, but one owns its path under another method.
    MethodNotAllowed,
    NotFound,
}

/// The ordered handler registry.
///
/// Cloning is cheap: handlers are shared behind [`Arc`].
///
/// # Examples
///
/// ```rust
/// use portico::Router;
/// use portico::http::{DataRequest, Request, Response};
///
/// let mut router = Router::new();
/// router.add_handler_for_path("GET", "/ping", |_req: Request| Response::text("pong"));
/// router.add_handler_for_path("POST", "/echo", |req: DataRequest| {
///     Response::data(req.data().clone(), "application/octet-stream")
/// });
/// assert_eq!(router.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct Router {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Router {
    /// Create a new, empty `Router` with no registered handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler with an arbitrary match predicate.
    ///
    /// `matcher` sees every request head that no newer handler accepted and
    /// returns the request variant to use, or `None` to let older handlers try.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use portico::Router;
    /// use portico::http::{Request, RequestBody, Response};
    ///
    /// let mut router = Router::new();
    /// router.add_handler(
    ///     |req: &Request| {
    ///         req.headers()
    ///             .contains("x-api-key")
    ///             .then(|| Request::from_request(req.clone()))
    ///             .flatten()
    ///     },
    ///     |req: Request| Response::text(format!("hello {}", req.path())),
    /// );
    /// ```
    pub fn add_handler<R, M, P, O>(&mut self, matcher: M, process: P)
    where
        R: RequestBody,
        M: Fn(&Request) -> Option<R> + Send + Sync + 'static,
        P: Fn(R) -> O + Send + Sync + 'static,
        O: Into<Option<Response>>,
    {
        self.handlers.push(Arc::new(PredicateHandler {
            matcher: Box::new(matcher),
            process: erase(process),
        }));
    }

    /// Registers a handler for `method` on any path. Useful as the oldest,
    /// lowest-priority fallback.
    pub fn add_default_handler<R, P, O>(&mut self, method: impl Into<Method>, process: P)
    where
        R: RequestBody,
        P: Fn(R) -> O + Send + Sync + 'static,
        O: Into<Option<Response>>,
    {
        self.add_route(method.into(), PathRule::Any, process);
    }

    /// Registers a handler for `method` on exactly `path`, compared ignoring case.
    pub fn add_handler_for_path<R, P, O>(
        &mut self,
        method: impl Into<Method>,
        path: &str,
        process: P,
    ) where
        R: RequestBody,
        P: Fn(R) -> O + Send + Sync + 'static,
        O: Into<Option<Response>>,
    {
        self.add_route(method.into(), PathRule::Exact(path.to_lowercase()), process);
    }

    /// Registers a handler for `method` on paths matching `pattern`.
    ///
    /// The expression is case-insensitive and unanchored; use `^…$` to match
    /// whole paths.
    ///
    /// # Errors
    ///
    /// Returns the [`regex::Error`] if `pattern` does not compile.
    pub fn add_handler_for_path_regex<R, P, O>(
        &mut self,
        method: impl Into<Method>,
        pattern: &str,
        process: P,
    ) -> Result<(), regex::Error>
    where
        R: RequestBody,
        P: Fn(R) -> O + Send + Sync + 'static,
        O: Into<Option<Response>>,
    {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        self.add_route(method.into(), PathRule::Regex(regex), process);
        Ok(())
    }

    /// Serves files under `local_path` for `GET` requests below `base_path`.
    ///
    /// The base path is matched recursively and case-sensitively. Directory
    /// requests fall back to `index_filename` when given; every file response
    /// carries `Cache-Control: public, max-age=<cache_age>` (or `no-cache` for 0).
    pub fn add_handler_for_base_path(
        &mut self,
        base_path: &str,
        local_path: impl Into<std::path::PathBuf>,
        index_filename: Option<&str>,
        cache_age: u32,
    ) {
        let files = Arc::new(StaticFiles::new(
            base_path,
            local_path,
            index_filename,
            cache_age,
        ));
        let rule = PathRule::Base(files.base_path().to_owned());
        self.add_route(Method::Get, rule, move |req: Request| files.serve(&req));
    }

    fn add_route<R, P, O>(&mut self, method: Method, rule: PathRule, process: P)
    where
        R: RequestBody,
        P: Fn(R) -> O + Send + Sync + 'static,
        O: Into<Option<Response>>,
    {
        self.handlers.push(Arc::new(RouteHandler {
            method,
            rule,
            process: erase(process),
        }));
    }

    /// Removes every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Return the number of handlers registered in this router.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Return `true` if no handlers have been registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Finds the handler for `request`, newest registration first.
    ///
    /// The first handler that accepts wins. When none accepts, the result is
    /// [`Resolution::MethodNotAllowed`] if some path-bound handler owns the
    /// path under a different method, and [`Resolution::NotFound`] otherwise.
    pub fn resolve(&self, request: &Request) -> Resolution {
        let mut wrong_method = false;

        for handler in self.handlers.iter().rev() {
            match handler.offer(request) {
                Candidate::Accept(exchange) => return Resolution::Matched(Resolved { exchange }),
                Candidate::WrongMethod => wrong_method = true,
                Candidate::Decline => {}
            }
        }

        if wrong_method {
            Resolution::MethodNotAllowed
        } else {
            Resolution::NotFound
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

// Erase the concrete processing function, normalizing its return type.
fn erase<R, P, O>(process: P) -> Arc<ProcessFn<R>>
where
    R: RequestBody,
    P: Fn(R) -> O + Send + Sync + 'static,
    O: Into<Option<Response>>,
{
    Arc::new(move |req: R| process(req).into())
}

//! Async TCP server using Tokio.
//!
//! Owns the listening socket and a snapshot of the handler registry. Every
//! accepted connection gets its own task running a [`Connection`], which
//! serves exactly one request and closes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::http::{Method, Request, RequestBody, Response};
use crate::router::Router;

pub mod connection;
pub mod discovery;

pub use connection::{Connection, ConnectionError, ConnectionState};
pub use discovery::ServiceAdvertiser;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("failed to advertise service {name:?}: {source}")]
    Advertise {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

// Live listener state between `start` and `stop`.
struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
    advertised: bool,
}

// Keeps the in-flight connection count accurate even if a task panics.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The portico HTTP server.
///
/// Handlers are registered before [`start`](Self::start). The running
/// listener works from a snapshot of the registry, so changes made while it
/// runs only take effect after the next restart.
///
/// # Examples
///
/// ```rust,no_run
/// use portico::{Server, ServerConfig};
/// use portico::http::{Request, Response};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut server = Server::new(ServerConfig::default());
///     server.add_handler_for_path("GET", "/", |_req: Request| Response::text("Hello!"));
///     server.run().await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    config: Arc<ServerConfig>,
    router: Arc<Router>,
    advertiser: Option<Arc<dyn ServiceAdvertiser>>,
    connections: Arc<AtomicUsize>,
    running: Option<Running>,
}

impl Server {
    /// Creates a stopped server with an empty handler registry.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_router(config, Router::new())
    }

    /// Creates a stopped server using an already populated registry.
    pub fn with_router(config: ServerConfig, router: Router) -> Self {
        Self {
            config: Arc::new(config),
            router: Arc::new(router),
            advertiser: None,
            connections: Arc::new(AtomicUsize::new(0)),
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Replaces the configuration used by the next [`start`](Self::start).
    pub fn set_config(&mut self, config: ServerConfig) {
        self.config = Arc::new(config);
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Mutable access to the handler registry.
    pub fn router_mut(&mut self) -> &mut Router {
        if self.is_running() {
            warn!("handler registry modified while running; changes apply after restart");
        }
        Arc::make_mut(&mut self.router)
    }

    /// Sets the collaborator used to advertise the server when
    /// [`ServerConfig::advertise_name`] is set.
    pub fn set_advertiser(&mut self, advertiser: Arc<dyn ServiceAdvertiser>) {
        self.advertiser = Some(advertiser);
    }

    /// See [`Router::add_handler`].
    pub fn add_handler<R, M, P, O>(&mut self, matcher: M, process: P)
    where
        R: RequestBody,
        M: Fn(&Request) -> Option<R> + Send + Sync + 'static,
        P: Fn(R) -> O + Send + Sync + 'static,
        O: Into<Option<Response>>,
    {
        self.router_mut().add_handler(matcher, process);
    }

    /// See [`Router::add_default_handler`].
    pub fn add_default_handler<R, P, O>(&mut self, method: impl Into<Method>, process: P)
    where
        R: RequestBody,
        P: Fn(R) -> O + Send + Sync + 'static,
        O: Into<Option<Response>>,
    {
        self.router_mut().add_default_handler(method, process);
    }

    /// See [`Router::add_handler_for_path`].
    pub fn add_handler_for_path<R, P, O>(&mut self, method: impl Into<Method>, path: &str, process: P)
    where
        R: RequestBody,
        P: Fn(R) -> O + Send + Sync + 'static,
        O: Into<Option<Response>>,
    {
        self.router_mut().add_handler_for_path(method, path, process);
    }

    /// See [`Router::add_handler_for_path_regex`].
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
        self.router_mut()
            .add_handler_for_path_regex(method, pattern, process)
    }

    /// See [`Router::add_handler_for_base_path`].
    pub fn add_handler_for_base_path(
        &mut self,
        base_path: &str,
        local_path: impl Into<PathBuf>,
        index_filename: Option<&str>,
        cache_age: u32,
    ) {
        self.router_mut()
            .add_handler_for_base_path(base_path, local_path, index_filename, cache_age);
    }

    /// Removes every registered handler.
    pub fn remove_all_handlers(&mut self) {
        self.router_mut().clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Returns the bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Returns the bound port while running.
    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Binds the listener and starts accepting connections in the background.
    ///
    /// Returns the bound address, which is useful when the configured port is 0.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyRunning`] if the server was already started.
    /// - [`ServerError::Config`] if the configuration does not validate.
    /// - [`ServerError::Bind`] if the address cannot be bound
    ///   (e.g. port already in use, insufficient permissions).
    /// - [`ServerError::Advertise`] if the advertiser rejects the service; the
    ///   listener is closed again.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        self.config.validate()?;

        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.clone(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        let advertised = self.advertise(local_addr.port())?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.config),
            Arc::clone(&self.router),
            Arc::clone(&self.connections),
            shutdown_rx,
        ));

        info!(address = %local_addr, handlers = self.router.len(), "portico listening");
        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
            advertised,
        });
        Ok(local_addr)
    }

    /// Stops accepting connections and closes the listener.
    ///
    /// Connections already accepted run to completion.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotRunning`] if the server is not running.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let running = self.running.take().ok_or(ServerError::NotRunning)?;

        if running.advertised {
            if let Some(advertiser) = &self.advertiser {
                advertiser.withdraw();
            }
        }

        // The receiver may already be gone if the accept loop ended on its own.
        let _ = running.shutdown.send(());
        if let Err(e) = running.accept_task.await {
            error!(error = %e, "accept loop terminated abnormally");
        }

        info!(address = %running.local_addr, "portico stopped");
        Ok(())
    }

    /// Starts the server and serves until Ctrl-C, then stops it.
    ///
    /// # Errors
    ///
    /// Any error from [`start`](Self::start), or [`ServerError::Io`] if the
    /// signal handler cannot be installed.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.start().await?;
        let waited = tokio::signal::ctrl_c().await;
        if waited.is_ok() {
            info!("interrupt received, shutting down");
        }
        self.stop().await?;
        waited.map_err(ServerError::from)
    }

    fn advertise(&self, port: u16) -> Result<bool, ServerError> {
        let Some(name) = discovery::resolve_service_name(
            self.config.advertise_name.as_deref(),
            &self.config.server_name,
        ) else {
            return Ok(false);
        };

        let Some(advertiser) = &self.advertiser else {
            warn!(name = %name, "advertise name set but no advertiser configured");
            return Ok(false);
        };

        advertiser
            .advertise(&name, port)
            .map_err(|source| ServerError::Advertise {
                name: name.clone(),
                source,
            })?;
        info!(name = %name, port, "service advertised");
        Ok(true)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Accepts connections until `shutdown` fires (or its sender is dropped).
async fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    router: Arc<Router>,
    connections: Arc<AtomicUsize>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        debug!(peer = %peer_addr, "connection accepted");
        let guard = ConnectionGuard::new(Arc::clone(&connections));
        let config = Arc::clone(&config);
        let router = Arc::clone(&router);

        tokio::spawn(async move {
            let _guard = guard;
            let mut connection = Connection::new(stream, peer_addr, config, router);
            if let Err(e) = connection.run().await {
                warn!(peer = %peer_addr, error = %e, "connection closed with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingAdvertiser {
        events: Mutex<Vec<String>>,
    }

    impl ServiceAdvertiser for RecordingAdvertiser {
        fn advertise(&self, name: &str, port: u16) -> std::io::Result<()> {
            self.events.lock().unwrap().push(format!("advertise {name} {port}"));
            Ok(())
        }

        fn withdraw(&self) {
            self.events.lock().unwrap().push("withdraw".into());
        }
    }

    struct FailingAdvertiser;

    impl ServiceAdvertiser for FailingAdvertiser {
        fn advertise(&self, _name: &str, _port: u16) -> std::io::Result<()> {
            Err(std::io::Error::other("no responder"))
        }

        fn withdraw(&self) {}
    }

    #[tokio::test]
    async fn start_and_stop() {
        let mut server = Server::new(local_config());
        assert!(!server.is_running());
        assert_eq!(server.port(), None);

        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert_eq!(server.port(), Some(addr.port()));
        assert_ne!(addr.port(), 0);
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));

        // The listener is closed once stopped.
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let mut first = Server::new(local_config());
        let addr = first.start().await.unwrap();

        let mut second = Server::new(ServerConfig {
            port: addr.port(),
            ..local_config()
        });
        assert!(matches!(second.start().await, Err(ServerError::Bind { .. })));
        assert!(!second.is_running());

        first.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut server = Server::new(ServerConfig {
            host: String::new(),
            ..local_config()
        });
        assert!(matches!(
            server.start().await,
            Err(ServerError::Config(ConfigError::EmptyHost))
        ));
    }

    #[tokio::test]
    async fn advertises_and_withdraws() {
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let mut server = Server::new(ServerConfig {
            advertise_name: Some("files".into()),
            ..local_config()
        });
        server.set_advertiser(advertiser.clone());

        let port = server.start().await.unwrap().port();
        server.stop().await.unwrap();

        let events = advertiser.events.lock().unwrap().clone();
        assert_eq!(events, vec![format!("advertise files {port}"), "withdraw".to_string()]);
    }

    #[tokio::test]
    async fn no_advertisement_without_name() {
        let advertiser = Arc::new(RecordingAdvertiser::default());
        let mut server = Server::new(local_config());
        server.set_advertiser(advertiser.clone());
        server.start().await.unwrap();
        server.stop().await.unwrap();
        assert!(advertiser.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_advertisement_aborts_start() {
        let mut server = Server::new(ServerConfig {
            advertise_name: Some("files".into()),
            ..local_config()
        });
        server.set_advertiser(Arc::new(FailingAdvertiser));
        assert!(matches!(
            server.start().await,
            Err(ServerError::Advertise { .. })
        ));
        assert!(!server.is_running());
    }

    #[test]
    fn registration_is_delegated_to_router() {
        let mut server = Server::new(local_config());
        server.add_handler_for_path("GET", "/a", |_req: Request| Response::text("a"));
        server.add_default_handler("GET", |_req: Request| Response::text("fallback"));
        server
            .add_handler_for_path_regex("GET", "^/b", |_req: Request| Response::text("b"))
            .unwrap();
        assert_eq!(server.router().len(), 3);
        server.remove_all_handlers();
        assert!(server.router().is_empty());
    }

    #[test]
    fn connection_guard_counts() {
        let count = Arc::new(AtomicUsize::new(0));
        let a = ConnectionGuard::new(Arc::clone(&count));
        let b = ConnectionGuard::new(Arc::clone(&count));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        drop(a);
        drop(b);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

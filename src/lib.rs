//! # portico
//!
//! An embeddable async HTTP/1.1 server. Register handlers, start the server,
//! and every connection serves one request:
//!
//! 1. the request head is parsed,
//! 2. the newest matching handler picks a request variant,
//! 3. the body is streamed into it (memory, temp file, url-encoded or
//!    multipart form),
//! 4. the processing function turns the finished request into a response,
//! 5. the response body is streamed back and the connection closes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use portico::{Server, ServerConfig};
//! use portico::http::{MultipartFormRequest, Request, Response};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default());
//!
//!     server.add_handler_for_path("GET", "/hello", |_req: Request| Response::text("world"));
//!     server.add_handler_for_path("POST", "/upload", |req: MultipartFormRequest| {
//!         let names: Vec<&str> = req.files().values().map(|f| f.file_name()).collect();
//!         Response::text(names.join(", "))
//!     });
//!     server.add_handler_for_base_path("/static", "./public", Some("index.html"), 3600);
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod http;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{ConfigError, ServerConfig};
pub use http::{Headers, Method, Request, RequestBody, Response, StatusCode};
pub use router::{Resolution, Router};
pub use server::{Server, ServerError, ServiceAdvertiser};

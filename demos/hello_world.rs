//! Minimal portico server.
//!
//! ```text
//! RUST_LOG=portico=debug cargo run --example hello_world
//! curl http://127.0.0.1:8080/hello
//! curl -F name=bar -F upload=@Cargo.toml http://127.0.0.1:8080/upload
//! ```

use std::collections::HashMap;

use portico::http::{DataRequest, MultipartFormRequest, Request, Response};
use portico::{Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = ServerConfig {
        host: "127.0.0.1".into(),
        ..Default::default()
    };
    config.apply_env_vars();

    let mut server = Server::new(config);

    server.add_default_handler("GET", |req: Request| {
        Response::html(format!("<p>Nothing at <code>{}</code> yet.</p>", req.path()))
    });

    server.add_handler_for_path("GET", "/hello", |req: Request| {
        let name = req.query_param("name").unwrap_or("world");
        Response::text(format!("Hello, {name}!"))
    });

    server.add_handler_for_path("POST", "/echo", |req: DataRequest| {
        let (head, data) = req.into_parts();
        let content_type = head.content_type().unwrap_or("application/octet-stream");
        Response::data(data, content_type.to_owned())
    });

    server.add_handler_for_path("POST", "/upload", |req: MultipartFormRequest| {
        let mut summary = HashMap::new();
        for (name, file) in req.files() {
            let size = std::fs::metadata(file.temporary_path()).map(|m| m.len()).ok();
            let _ = std::fs::remove_file(file.temporary_path());
            summary.insert(name.clone(), (file.file_name().to_owned(), size));
        }
        let fields: HashMap<_, _> = req
            .arguments()
            .iter()
            .filter_map(|(name, arg)| Some((name.clone(), arg.string()?.to_owned())))
            .collect();
        Response::json(&serde_json::json!({ "fields": fields, "files": summary })).ok()
    });

    server.add_handler_for_path_regex("GET", r"^/old(/.*)?$", |req: Request| {
        Response::redirect(req.path().replacen("/old", "/hello", 1), false)
    })?;

    server.run().await?;
    Ok(())
}

//! Local service advertisement.
//!
//! The server does not speak any discovery protocol itself. It hands the
//! resolved service name and bound port to a [`ServiceAdvertiser`] after the
//! listener is up, and withdraws the advertisement when it stops.

use std::io;

/// Publishes the running server on the local network.
pub trait ServiceAdvertiser: Send + Sync {
    /// Announces the service as `name` on `port`.
    fn advertise(&self, name: &str, port: u16) -> io::Result<()>;

    /// Removes the announcement made by [`advertise`](Self::advertise).
    fn withdraw(&self);
}

/// Resolves the configured advertisement name.
///
/// `None` disables advertising. An empty name falls back to the host name
/// (the `HOSTNAME` environment variable), then to `server_name`.
pub fn resolve_service_name(configured: Option<&str>, server_name: &str) -> Option<String> {
    resolve_with(configured, server_name, || std::env::var("HOSTNAME").ok())
}

fn resolve_with<F>(configured: Option<&str>, server_name: &str, hostname: F) -> Option<String>
where
    F: FnOnce() -> Option<String>,
{
    match configured? {
        "" => Some(
            hostname()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| server_name.to_owned()),
        ),
        name => Some(name.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_disables_advertising() {
        assert_eq!(resolve_with(None, "Portico", || Some("box".into())), None);
    }

    #[test]
    fn explicit_name_is_kept() {
        assert_eq!(
            resolve_with(Some("files"), "Portico", || Some("box".into())),
            Some("files".to_owned())
        );
    }

    #[test]
    fn empty_name_uses_host_then_server_name() {
        assert_eq!(
            resolve_with(Some(""), "Portico", || Some("box\n".into())),
            Some("box".to_owned())
        );
        assert_eq!(
            resolve_with(Some(""), "Portico", || None),
            Some("Portico".to_owned())
        );
        assert_eq!(
            resolve_with(Some(""), "Portico", || Some(String::new())),
            Some("Portico".to_owned())
        );
    }
}

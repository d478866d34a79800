//! Message-based transport interface and the process-global registry.
//!
//! A transport knows nothing about frames or objects; it moves opaque,
//! complete messages between peers. Higher-level patterns (calls,
//! streaming, events) are built on top by the connection.

use std::sync::{Arc, LazyLock, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use lattice_core::RpcError;

/// Peer credentials, for transports able to supply them (e.g. Unix
/// domain sockets). Unset otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// One end of an established link.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Queue a complete message for transmission.
    async fn send(&self, frame: Bytes) -> Result<(), RpcError>;

    /// Await the next complete message. `Ok(None)` means the link is
    /// closed. Messages arrive in sender order.
    async fn recv(&self) -> Result<Option<Bytes>, RpcError>;

    /// Credentials of the peer, when the transport can supply them.
    fn peer_credentials(&self) -> Option<Credentials> {
        None
    }

    /// Sever the link. Pending and future `recv` calls drain to `None`.
    fn abort(&self);
}

/// A bound listening endpoint.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Await the next inbound link.
    async fn accept(&self) -> Result<Box<dyn MessageChannel>, RpcError>;

    /// Stop accepting; expected to stop new connections.
    fn close(&self);
}

/// A registered transport: a name, the URI schemes it claims, and the
/// connect/listen entry points.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn schemes(&self) -> &'static [&'static str];

    async fn connect(&self, uri: &str) -> Result<Box<dyn MessageChannel>, RpcError>;

    async fn listen(&self, uri: &str) -> Result<Box<dyn Listener>, RpcError>;
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("name", &self.name()).finish()
    }
}

static TRANSPORTS: LazyLock<RwLock<Vec<Arc<dyn Transport>>>> =
    LazyLock::new(|| RwLock::new(Vec::new()));

/// Register a transport in the process-global registry.
pub fn register_transport(transport: Arc<dyn Transport>) {
    TRANSPORTS.write().unwrap().push(transport);
}

/// Find the transport claiming a URI scheme.
pub fn find_transport(scheme: &str) -> Option<Arc<dyn Transport>> {
    TRANSPORTS
        .read()
        .unwrap()
        .iter()
        .find(|t| t.schemes().contains(&scheme))
        .cloned()
}

/// Scheme portion of a URI, e.g. `loopback` for `loopback://main`.
pub fn uri_scheme(uri: &str) -> Option<&str> {
    uri.split_once("://").map(|(scheme, _)| scheme)
}

/// Resolve the transport for a full URI. Fails with `ENXIO` when no
/// transport claims the scheme.
pub fn transport_for(uri: &str) -> Result<Arc<dyn Transport>, RpcError> {
    let scheme = uri_scheme(uri)
        .ok_or_else(|| RpcError::invalid(format!("Malformed URI: {}", uri)))?;
    find_transport(scheme)
        .ok_or_else(|| RpcError::no_transport(format!("No transport for scheme '{}'", scheme)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_scheme() {
        assert_eq!(uri_scheme("loopback://server"), Some("loopback"));
        assert_eq!(uri_scheme("no-scheme"), None);
    }

    #[test]
    fn test_unknown_scheme_is_enxio() {
        let err = transport_for("bogus://x").unwrap_err();
        assert_eq!(err.code, lattice_core::code::ENXIO);
    }
}

//! Client-side connection establishment.

use std::sync::Arc;
use std::time::Duration;

use lattice_core::serializer::find_serializer;
use lattice_core::RpcError;
use lattice_typing::TypingContext;
use tracing::info;

use crate::connection::{Connection, ConnectionParams};
use crate::transport::transport_for;

/// Builder for configuring an outbound connection.
pub struct ClientBuilder {
    codec: String,
    default_timeout: Option<Duration>,
    typing: Option<Arc<TypingContext>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            codec: "msgpack".to_string(),
            default_timeout: None,
            typing: None,
        }
    }

    /// Select the wire codec by name.
    pub fn codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    /// Timeout applied to synchronous calls.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Attach a typing context: payloads are wrapped and unwrapped with
    /// their type annotations.
    pub fn typing(mut self, typing: Arc<TypingContext>) -> Self {
        self.typing = Some(typing);
        self
    }

    /// Resolve the transport for the URI scheme and establish the
    /// connection.
    pub async fn connect(self, uri: &str) -> Result<Connection, RpcError> {
        let codec = find_serializer(&self.codec)
            .ok_or_else(|| RpcError::not_found(format!("Serializer '{}' not found", self.codec)))?;

        let transport = transport_for(uri)?;
        let channel = transport.connect(uri).await?;
        info!(uri, transport = transport.name(), "connected");

        Ok(Connection::spawn(ConnectionParams {
            uri: uri.to_string(),
            channel,
            codec,
            context: None,
            server: None,
            typing: self.typing,
            default_timeout: self.default_timeout,
        }))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect with default settings (msgpack codec, no timeout).
pub async fn connect(uri: &str) -> Result<Connection, RpcError> {
    ClientBuilder::new().connect(uri).await
}

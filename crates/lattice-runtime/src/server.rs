//! Server lifecycle: listen, accept, broadcast, teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lattice_core::serializer::{find_serializer, Serializer};
use lattice_core::{Object, RpcError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionParams};
use crate::context::Context;
use crate::transport::{transport_for, Listener};

/// Connection lifecycle notifications delivered to the server's event
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    ConnectionArrived,
    ConnectionTerminated,
}

/// Handler observing connection arrivals and terminations.
pub type ServerEventHandler = Box<dyn Fn(&Connection, ServerEvent) + Send + Sync>;

pub(crate) struct ServerInner {
    uri: String,
    context: Context,
    codec: &'static Serializer,
    connections: RwLock<Vec<Connection>>,
    closed: AtomicBool,
    drained: Notify,
    event_handler: Mutex<Option<ServerEventHandler>>,
    listener: Mutex<Option<Arc<dyn Listener>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInner {
    fn accept(self: &Arc<Self>, channel: Box<dyn crate::transport::MessageChannel>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let conn = Connection::spawn(ConnectionParams {
            uri: self.uri.clone(),
            channel,
            codec: self.codec,
            context: Some(self.context.clone()),
            server: Some(Arc::downgrade(self)),
            typing: self.context.typing().cloned(),
            default_timeout: None,
        });

        self.connections.write().unwrap().push(conn.clone());
        debug!(uri = %self.uri, "connection arrived");

        if let Some(handler) = self.event_handler.lock().unwrap().as_ref() {
            handler(&conn, ServerEvent::ConnectionArrived);
        }
    }

    pub(crate) fn connection_terminated(&self, conn: &Connection) {
        if let Some(handler) = self.event_handler.lock().unwrap().as_ref() {
            handler(conn, ServerEvent::ConnectionTerminated);
        }

        let mut connections = self.connections.write().unwrap();
        connections.retain(|c| !Arc::ptr_eq(&c.inner, &conn.inner));
        if connections.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

/// A listening endpoint routing inbound calls into a [`Context`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Bind a server on a URI. The scheme selects a registered transport
    /// (`ENXIO` when none claims it); the server is published on the
    /// context afterwards.
    pub async fn create(uri: &str, context: &Context) -> Result<Server, RpcError> {
        Self::create_with_codec(uri, context, "msgpack").await
    }

    pub async fn create_with_codec(
        uri: &str,
        context: &Context,
        codec: &str,
    ) -> Result<Server, RpcError> {
        let codec = find_serializer(codec)
            .ok_or_else(|| RpcError::not_found(format!("Serializer '{}' not found", codec)))?;

        let transport = transport_for(uri)?;
        let listener: Arc<dyn Listener> = Arc::from(transport.listen(uri).await?);
        info!(uri, transport = transport.name(), "server listening");

        let server = Server {
            inner: Arc::new(ServerInner {
                uri: uri.to_string(),
                context: context.clone(),
                codec,
                connections: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
                drained: Notify::new(),
                event_handler: Mutex::new(None),
                listener: Mutex::new(Some(listener.clone())),
                accept_task: Mutex::new(None),
            }),
        };

        context.add_server(server.clone());

        let inner = Arc::clone(&server.inner);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(channel) => inner.accept(channel),
                    Err(e) => {
                        debug!(uri = %inner.uri, error = %e, "accept loop stopped");
                        break;
                    }
                }
            }
        });
        *server.inner.accept_task.lock().unwrap() = Some(task);

        Ok(server)
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn same_as(&self, other: &Server) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Replace the connection lifecycle handler.
    pub fn set_event_handler(&self, handler: ServerEventHandler) {
        *self.inner.event_handler.lock().unwrap() = Some(handler);
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().unwrap().len()
    }

    /// Send an event frame to every open connection. A failure on one
    /// connection does not stop the broadcast. No-op once closed.
    pub async fn broadcast_event(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        args: Object,
    ) {
        if self.is_closed() {
            return;
        }

        let connections: Vec<_> = self.inner.connections.read().unwrap().clone();
        for conn in connections {
            if let Err(e) = conn.send_event(path, interface, name, args.clone()).await {
                warn!(uri = %self.inner.uri, error = %e, "event broadcast failed for one connection");
            }
        }
    }

    /// Tear the server down: unpublish it, stop accepting, abort every
    /// open connection and wait for the connection list to drain.
    pub async fn close(&self) -> Result<(), RpcError> {
        if !self.inner.context.remove_server(self) {
            return Err(RpcError::not_found("Server not attached to its context"));
        }

        self.inner.closed.store(true, Ordering::Release);

        // Teardown hook: the listener is expected to stop new accepts.
        if let Some(listener) = self.inner.listener.lock().unwrap().take() {
            listener.close();
        }

        let connections: Vec<_> = self.inner.connections.read().unwrap().clone();
        for conn in connections {
            conn.close().await;
        }

        loop {
            let notified = self.inner.drained.notified();
            if self.inner.connections.read().unwrap().is_empty() {
                break;
            }
            notified.await;
        }

        if let Some(task) = self.inner.accept_task.lock().unwrap().take() {
            task.abort();
        }

        info!(uri = %self.inner.uri, "server closed");
        Ok(())
    }
}

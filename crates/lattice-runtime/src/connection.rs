//! Per-peer connection state.
//!
//! A connection owns one message channel, the table of outstanding
//! outbound calls, the inbound calls being served, the event
//! subscription set and a worker task that delivers events and call
//! callbacks in arrival order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use lattice_core::serializer::Serializer;
use lattice_core::{Object, RpcError};
use lattice_typing::TypingContext;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::call::{Call, CallCallback, CallCore, CallResponse, CallStatus, CallStream};
use crate::context::Context;
use crate::frame::Frame;
use crate::inbound::InboundCall;
use crate::server::ServerInner;
use crate::transport::{Credentials, MessageChannel};

/// Handler invoked with the payload of a subscribed event.
pub type EventHandler = Arc<dyn Fn(&Object) + Send + Sync>;

type EventKey = (String, String, String);
type WorkItem = Box<dyn FnOnce() + Send>;

pub(crate) struct ConnectionParams {
    pub uri: String,
    pub channel: Box<dyn MessageChannel>,
    pub codec: &'static Serializer,
    pub context: Option<Context>,
    pub server: Option<Weak<ServerInner>>,
    pub typing: Option<Arc<TypingContext>>,
    pub default_timeout: Option<Duration>,
}

pub(crate) struct ConnectionInner {
    uri: String,
    codec: &'static Serializer,
    channel: Box<dyn MessageChannel>,
    calls: Mutex<HashMap<u64, Arc<CallCore>>>,
    inbound: Mutex<HashMap<u64, Arc<InboundCall>>>,
    subscriptions: Mutex<HashSet<EventKey>>,
    handlers: Mutex<HashMap<EventKey, Vec<EventHandler>>>,
    peer_subscriptions: Mutex<HashSet<EventKey>>,
    next_id: AtomicU64,
    default_timeout: Mutex<Option<Duration>>,
    credentials: Option<Credentials>,
    context: Option<Context>,
    server: Option<Weak<ServerInner>>,
    typing: Option<Arc<TypingContext>>,
    closed: AtomicBool,
    worker_tx: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    worker_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::connection_reset("Connection closed"));
        }

        let frame = self.wrap_frame(frame)?;
        let data = self.codec.dump(&frame.to_object())?;
        self.channel.send(data).await
    }

    /// Run payloads through typed serialization when a typing context is
    /// attached.
    fn wrap_frame(&self, frame: Frame) -> Result<Frame, RpcError> {
        let Some(typing) = &self.typing else {
            return Ok(frame);
        };

        Ok(match frame {
            Frame::Call {
                id,
                path,
                interface,
                method,
                args,
            } => Frame::Call {
                id,
                path,
                interface,
                method,
                args: typing.serialize(&args)?,
            },
            Frame::Response { id, result } => Frame::Response {
                id,
                result: typing.serialize(&result)?,
            },
            Frame::Fragment { id, seqno, value } => Frame::Fragment {
                id,
                seqno,
                value: typing.serialize(&value)?,
            },
            Frame::Event {
                path,
                interface,
                name,
                args,
            } => Frame::Event {
                path,
                interface,
                name,
                args: typing.serialize(&args)?,
            },
            other => other,
        })
    }

    fn unwrap_frame(&self, frame: Frame) -> Result<Frame, RpcError> {
        let Some(typing) = &self.typing else {
            return Ok(frame);
        };

        Ok(match frame {
            Frame::Call {
                id,
                path,
                interface,
                method,
                args,
            } => Frame::Call {
                id,
                path,
                interface,
                method,
                args: typing.deserialize(&args)?,
            },
            Frame::Response { id, result } => Frame::Response {
                id,
                result: typing.deserialize(&result)?,
            },
            Frame::Fragment { id, seqno, value } => Frame::Fragment {
                id,
                seqno,
                value: typing.deserialize(&value)?,
            },
            Frame::Event {
                path,
                interface,
                name,
                args,
            } => Frame::Event {
                path,
                interface,
                name,
                args: typing.deserialize(&args)?,
            },
            other => other,
        })
    }

    fn enqueue(&self, item: WorkItem) {
        if let Some(tx) = self.worker_tx.lock().unwrap().as_ref() {
            let _ = tx.send(item);
        }
    }

    fn enqueue_callback(&self, core: &Arc<CallCore>, status: CallStatus, value: Option<Object>) {
        let core = core.clone();
        self.enqueue(Box::new(move || core.fire_callback(status, value)));
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Call {
                id,
                path,
                interface,
                method,
                args,
            } => {
                let Some(context) = &self.context else {
                    let _ = self
                        .send_frame(Frame::Error {
                            id,
                            error: RpcError::not_supported("No service context attached"),
                        })
                        .await;
                    return;
                };

                let call = Arc::new(InboundCall::new(
                    id,
                    path,
                    interface,
                    method,
                    args,
                    Arc::downgrade(self),
                ));
                self.inbound.lock().unwrap().insert(id, call.clone());
                context.dispatch(Connection { inner: self.clone() }, call);
            }
            Frame::Response { id, result } => {
                let Some(call) = self.calls.lock().unwrap().remove(&id) else {
                    debug!(id, "response for unknown call dropped");
                    return;
                };
                call.complete(result.clone());
                self.enqueue_callback(&call, CallStatus::Done, Some(result));
            }
            Frame::Fragment { id, seqno, value } => {
                let Some(call) = self.calls.lock().unwrap().get(&id).cloned() else {
                    debug!(id, seqno, "fragment for unknown call dropped");
                    return;
                };
                call.push_fragment(value.clone());
                self.enqueue_callback(&call, CallStatus::MoreAvailable, Some(value));
            }
            Frame::End { id, .. } => {
                let Some(call) = self.calls.lock().unwrap().remove(&id) else {
                    debug!(id, "end for unknown call dropped");
                    return;
                };
                call.finish();
                self.enqueue_callback(&call, CallStatus::Done, None);
            }
            Frame::Error { id, error } => {
                let Some(call) = self.calls.lock().unwrap().remove(&id) else {
                    debug!(id, "error for unknown call dropped");
                    return;
                };
                call.fail(error.clone());
                self.enqueue_callback(&call, CallStatus::Error, Some(Object::error(error)));
            }
            Frame::Continue { id } => {
                if let Some(call) = self.inbound.lock().unwrap().get(&id).cloned() {
                    call.continue_received();
                }
            }
            Frame::Abort { id } => {
                match self.inbound.lock().unwrap().remove(&id) {
                    Some(call) => call.mark_aborted(),
                    None => debug!(id, "abort for unknown call ignored"),
                }
            }
            Frame::Event {
                path,
                interface,
                name,
                args,
            } => {
                let key = (path, interface, name);
                if !self.subscriptions.lock().unwrap().contains(&key) {
                    return;
                }

                let handlers = self
                    .handlers
                    .lock()
                    .unwrap()
                    .get(&key)
                    .cloned()
                    .unwrap_or_default();
                self.enqueue(Box::new(move || {
                    for handler in &handlers {
                        handler(&args);
                    }
                }));
            }
            Frame::Subscribe {
                path,
                interface,
                name,
            } => {
                self.peer_subscriptions
                    .lock()
                    .unwrap()
                    .insert((path, interface, name));
            }
            Frame::Unsubscribe {
                path,
                interface,
                name,
            } => {
                self.peer_subscriptions
                    .lock()
                    .unwrap()
                    .remove(&(path, interface, name));
            }
        }
    }

    /// Tear the connection down: fail outstanding outbound calls with
    /// `ECONNRESET`, abort inbound calls, discard queued events and let
    /// the owning server know.
    async fn terminate(self: &Arc<Self>, reason: RpcError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(uri = %self.uri, reason = %reason, "connection terminated");
        self.channel.abort();

        let calls: Vec<_> = self.calls.lock().unwrap().drain().map(|(_, c)| c).collect();
        for call in calls {
            call.fail(reason.clone());
            call.fire_callback(CallStatus::Error, Some(Object::error(reason.clone())));
        }

        let inbound: Vec<_> = self
            .inbound
            .lock()
            .unwrap()
            .drain()
            .map(|(_, c)| c)
            .collect();
        for call in inbound {
            call.mark_aborted();
        }

        self.worker_tx.lock().unwrap().take();
        if let Some(task) = self.worker_task.lock().unwrap().take() {
            task.abort();
        }

        if let Some(server) = self.server.as_ref().and_then(Weak::upgrade) {
            server.connection_terminated(&Connection { inner: self.clone() });
        }
    }
}

/// A live peer connection. Cheap to clone; the underlying state is
/// shared.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.inner.uri)
            .finish()
    }
}

impl Connection {
    pub(crate) fn spawn(params: ConnectionParams) -> Connection {
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel::<WorkItem>();

        let credentials = params.channel.peer_credentials();
        let inner = Arc::new(ConnectionInner {
            uri: params.uri,
            codec: params.codec,
            channel: params.channel,
            calls: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            handlers: Mutex::new(HashMap::new()),
            peer_subscriptions: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            default_timeout: Mutex::new(params.default_timeout),
            credentials,
            context: params.context,
            server: params.server,
            typing: params.typing,
            closed: AtomicBool::new(false),
            worker_tx: Mutex::new(Some(worker_tx)),
            worker_task: Mutex::new(None),
        });

        let worker = tokio::spawn(async move {
            while let Some(item) = worker_rx.recv().await {
                item();
            }
        });
        *inner.worker_task.lock().unwrap() = Some(worker);

        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                match reader.channel.recv().await {
                    Ok(Some(data)) => {
                        let frame = reader
                            .codec
                            .load(&data)
                            .and_then(|obj| Frame::from_object(&obj))
                            .and_then(|frame| reader.unwrap_frame(frame));

                        match frame {
                            Ok(frame) => reader.handle_frame(frame).await,
                            Err(e) => {
                                warn!(uri = %reader.uri, error = %e, "dropping connection on malformed frame");
                                reader.terminate(e).await;
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        reader
                            .terminate(RpcError::connection_reset("Connection closed by peer"))
                            .await;
                        break;
                    }
                    Err(e) => {
                        reader.terminate(e).await;
                        break;
                    }
                }
            }
        });

        Connection { inner }
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Peer credentials supplied by the transport, if any.
    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.credentials
    }

    pub fn set_default_timeout(&self, timeout: Option<Duration>) {
        *self.inner.default_timeout.lock().unwrap() = timeout;
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        self.inner.send_frame(frame).await
    }

    pub(crate) fn forget_call(&self, id: u64) {
        self.inner.calls.lock().unwrap().remove(&id);
    }

    pub(crate) fn finish_inbound(&self, id: u64) {
        self.inner.inbound.lock().unwrap().remove(&id);
    }

    pub(crate) fn enqueue_callback(
        &self,
        core: &Arc<CallCore>,
        status: CallStatus,
        value: Option<Object>,
    ) {
        self.inner.enqueue_callback(core, status, value);
    }

    async fn start_call(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Object,
        callback: Option<CallCallback>,
    ) -> Result<Call, RpcError> {
        if self.is_closed() {
            return Err(RpcError::connection_reset("Connection closed"));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let core = CallCore::new(id, format!("{}.{}", interface, method), callback);
        self.inner.calls.lock().unwrap().insert(id, core.clone());

        let frame = Frame::Call {
            id,
            path: path.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
            args,
        };

        if let Err(e) = self.send_frame(frame).await {
            self.forget_call(id);
            return Err(e);
        }

        Ok(Call {
            core,
            conn: self.clone(),
        })
    }

    /// Start a call and return its handle without waiting.
    pub async fn call(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Object,
    ) -> Result<Call, RpcError> {
        self.start_call(path, interface, method, args, None).await
    }

    /// Start a call whose transitions are observed through a callback on
    /// the connection's worker.
    pub async fn call_async<F>(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Object,
        callback: F,
    ) -> Result<Call, RpcError>
    where
        F: FnMut(CallStatus, Option<Object>) + Send + 'static,
    {
        self.start_call(path, interface, method, args, Some(Box::new(callback)))
            .await
    }

    /// Call and wait for the first transition: a single result, a
    /// fragment stream, or the error. Honors the connection's default
    /// timeout; on expiry the call fails with `ETIMEDOUT` and the
    /// server-side work is cancelled.
    pub async fn call_sync(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Object,
    ) -> Result<CallResponse, RpcError> {
        let call = self.call(path, interface, method, args).await?;
        let timeout = *self.inner.default_timeout.lock().unwrap();

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    call.core.fail(RpcError::timed_out("Call timed out"));
                    self.forget_call(call.id());
                    let _ = self.send_frame(Frame::Abort { id: call.id() }).await;
                    return Err(RpcError::timed_out("Call timed out"));
                }
            },
            None => call.wait().await,
        };

        match status {
            CallStatus::MoreAvailable => Ok(CallResponse::Stream(CallStream { call })),
            _ => call.result().await.map(CallResponse::Single),
        }
    }

    /// Subscribe to an event and register a handler for it. Events are
    /// delivered on the connection's worker in arrival order.
    pub async fn subscribe(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        handler: EventHandler,
    ) -> Result<(), RpcError> {
        let key = (path.to_string(), interface.to_string(), name.to_string());
        self.inner.subscriptions.lock().unwrap().insert(key.clone());
        self.inner
            .handlers
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push(handler);

        self.send_frame(Frame::Subscribe {
            path: path.to_string(),
            interface: interface.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<(), RpcError> {
        let key = (path.to_string(), interface.to_string(), name.to_string());
        self.inner.subscriptions.lock().unwrap().remove(&key);
        self.inner.handlers.lock().unwrap().remove(&key);

        self.send_frame(Frame::Unsubscribe {
            path: path.to_string(),
            interface: interface.to_string(),
            name: name.to_string(),
        })
        .await
    }

    /// Send a one-way event frame to the peer.
    pub async fn send_event(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        args: Object,
    ) -> Result<(), RpcError> {
        self.send_frame(Frame::Event {
            path: path.to_string(),
            interface: interface.to_string(),
            name: name.to_string(),
            args,
        })
        .await
    }

    /// Whether the peer announced interest in an event.
    pub fn peer_subscribed(&self, path: &str, interface: &str, name: &str) -> bool {
        self.inner.peer_subscriptions.lock().unwrap().contains(&(
            path.to_string(),
            interface.to_string(),
            name.to_string(),
        ))
    }

    /// Close the connection locally.
    pub async fn close(&self) {
        self.inner
            .terminate(RpcError::connection_reset("Connection closed"))
            .await;
    }
}

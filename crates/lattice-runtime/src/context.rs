//! Service context: the method registry, instance paths and the worker
//! pool that runs inbound calls.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use lattice_core::{Object, RpcError};
use lattice_typing::validate::validation_error;
use lattice_typing::TypingContext;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::connection::Connection;
use crate::inbound::InboundCall;
use crate::server::Server;

/// Default number of concurrent method executions per context.
pub const DEFAULT_WORKERS: usize = 8;

/// Interface of the built-in service methods.
pub const BUILTIN_INTERFACE: &str = "com.twoporeguys.librpc.Builtin";

/// Result of a method implementation. `Ok` becomes the response (or, for
/// producers that yielded fragments, closes the stream); `Err` becomes
/// the error frame.
pub type MethodResult = Result<Object, RpcError>;

type BoxedMethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send>>;

/// A registered method implementation.
pub type MethodFn = Arc<dyn Fn(Arc<InboundCall>, Object) -> BoxedMethodFuture + Send + Sync>;

/// Registry entry for one method.
pub struct MethodDescriptor {
    pub name: String,
    pub description: String,
    pub func: MethodFn,
}

pub(crate) struct ContextInner {
    methods: RwLock<HashMap<String, Arc<MethodDescriptor>>>,
    instances: RwLock<HashSet<String>>,
    servers: Mutex<Vec<Server>>,
    workers: Arc<Semaphore>,
    typing: OnceLock<Arc<TypingContext>>,
}

/// Registry of methods and instances plus the dispatch worker pool.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    pub fn new() -> Context {
        Self::with_workers(DEFAULT_WORKERS)
    }

    pub fn with_workers(workers: usize) -> Context {
        let ctx = Context {
            inner: Arc::new(ContextInner {
                methods: RwLock::new(HashMap::new()),
                instances: RwLock::new(HashSet::new()),
                servers: Mutex::new(Vec::new()),
                workers: Arc::new(Semaphore::new(workers.max(1))),
                typing: OnceLock::new(),
            }),
        };

        ctx.register_instance("/");
        ctx.register_func(
            format!("{}.ping", BUILTIN_INTERFACE),
            "Liveness probe",
            |_call, _args| async { Ok(Object::null()) },
        );

        ctx
    }

    /// Register a method under its fully qualified name
    /// (`interface.method`). An existing entry with the same name is
    /// overwritten.
    pub fn register_func<F, Fut>(&self, name: impl Into<String>, description: &str, func: F)
    where
        F: Fn(Arc<InboundCall>, Object) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let name = name.into();
        let descriptor = Arc::new(MethodDescriptor {
            name: name.clone(),
            description: description.to_string(),
            func: Arc::new(move |call, args| Box::pin(func(call, args))),
        });
        self.inner.methods.write().unwrap().insert(name, descriptor);
    }

    /// Remove a registered method. Fails with `ENOENT` if absent.
    pub fn unregister_method(&self, name: &str) -> Result<(), RpcError> {
        match self.inner.methods.write().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(RpcError::not_found(format!("Method {} not found", name))),
        }
    }

    pub fn find_method(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.inner.methods.read().unwrap().get(name).cloned()
    }

    /// Publish an addressable instance path.
    pub fn register_instance(&self, path: impl Into<String>) {
        self.inner.instances.write().unwrap().insert(path.into());
    }

    pub fn has_instance(&self, path: &str) -> bool {
        self.inner.instances.read().unwrap().contains(path)
    }

    /// Attach a typing context: arguments and results of declared
    /// interface members are validated around every dispatch.
    pub fn attach_typing(&self, typing: Arc<TypingContext>) {
        let _ = self.inner.typing.set(typing);
    }

    pub fn typing(&self) -> Option<&Arc<TypingContext>> {
        self.inner.typing.get()
    }

    pub(crate) fn add_server(&self, server: Server) {
        self.inner.servers.lock().unwrap().push(server);
    }

    /// Remove a server from the published list; false if it was absent.
    pub(crate) fn remove_server(&self, server: &Server) -> bool {
        let mut servers = self.inner.servers.lock().unwrap();
        let before = servers.len();
        servers.retain(|s| !s.same_as(server));
        servers.len() != before
    }

    /// Enqueue an inbound call on the worker pool.
    pub(crate) fn dispatch(&self, conn: Connection, call: Arc<InboundCall>) {
        let ctx = self.clone();
        let workers = self.inner.workers.clone();

        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire().await else {
                return;
            };
            ctx.run_call(&conn, &call).await;
            conn.finish_inbound(call.id());
        });
    }

    async fn run_call(&self, conn: &Connection, call: &Arc<InboundCall>) {
        debug!(
            id = call.id(),
            interface = call.interface_name(),
            method = call.method_name(),
            "dispatching inbound call"
        );

        if !self.has_instance(call.path()) {
            call.error(RpcError::not_found(format!(
                "Instance {} not found",
                call.path()
            )))
            .await;
            return;
        }

        let name = format!("{}.{}", call.interface_name(), call.method_name());
        let Some(method) = self.find_method(&name) else {
            call.error(RpcError::not_found(format!("Method {} not found", name)))
                .await;
            return;
        };

        // Pre-call hook: validate arguments of declared members; the
        // implementation is not invoked on failure.
        let member = self.typing().and_then(|typing| {
            typing
                .find_if_member(call.interface_name(), call.method_name())
                .ok()
        });
        if let (Some(typing), Some(member)) = (self.typing(), &member) {
            if let Err(errors) = typing.validate_args(member, call.args()) {
                call.error(validation_error(errors)).await;
                return;
            }
        }

        let result = (method.func)(call.clone(), call.args().clone()).await;

        if call.is_aborted() {
            debug!(id = call.id(), "inbound call aborted, dropping result");
            return;
        }

        match result {
            Ok(value) => {
                if call.is_streaming() {
                    call.end().await;
                    return;
                }

                // Post-call hook: validate the result of declared members.
                if let (Some(typing), Some(member)) = (self.typing(), &member) {
                    if let Err(errors) = typing.validate_return(member, &value) {
                        call.error(
                            RpcError::invalid("Return value validation failed")
                                .with_extra(errors),
                        )
                        .await;
                        return;
                    }
                }

                call.respond(value).await;
            }
            Err(error) => call.error(error).await,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

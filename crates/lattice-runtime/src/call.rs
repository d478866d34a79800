//! Outbound call handles.
//!
//! Each outbound call parks a state cell keyed by its id on the
//! connection. Incoming `response`, `fragment`, `end` and `error` frames
//! drive the cell; waiters are woken through a notify handle and an
//! optional callback observes every transition.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, Stream};
use lattice_core::{Object, RpcError};
use tokio::sync::Notify;
use tracing::debug;

use crate::connection::Connection;
use crate::frame::Frame;

/// State of an outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Frame sent, nothing received yet.
    InProgress,
    /// At least one fragment arrived and the stream is still open.
    MoreAvailable,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Error,
}

/// Callback invoked on every state transition, with the current status
/// and the latest result or fragment.
pub type CallCallback = Box<dyn FnMut(CallStatus, Option<Object>) + Send>;

#[derive(Debug)]
struct CallState {
    status: CallStatus,
    result: Option<Object>,
    error: Option<RpcError>,
    fragments: VecDeque<Object>,
    error_consumed: bool,
}

pub(crate) struct CallCore {
    pub(crate) id: u64,
    pub(crate) method: String,
    state: Mutex<CallState>,
    notify: Notify,
    callback: Mutex<Option<CallCallback>>,
}

impl CallCore {
    pub(crate) fn new(id: u64, method: String, callback: Option<CallCallback>) -> Arc<Self> {
        Arc::new(Self {
            id,
            method,
            state: Mutex::new(CallState {
                status: CallStatus::InProgress,
                result: None,
                error: None,
                fragments: VecDeque::new(),
                error_consumed: false,
            }),
            notify: Notify::new(),
            callback: Mutex::new(callback),
        })
    }

    pub(crate) fn status(&self) -> CallStatus {
        self.state.lock().unwrap().status
    }

    fn transition<F: FnOnce(&mut CallState)>(&self, f: F) {
        let mut state = self.state.lock().unwrap();
        if matches!(state.status, CallStatus::Done | CallStatus::Error) {
            // No frame is observed after a terminal one.
            debug!(id = self.id, "frame after terminal state dropped");
            return;
        }
        f(&mut state);
        drop(state);
        self.notify.notify_waiters();
    }

    pub(crate) fn complete(&self, result: Object) {
        self.transition(|state| {
            state.status = CallStatus::Done;
            state.result = Some(result);
        });
    }

    pub(crate) fn push_fragment(&self, value: Object) {
        self.transition(|state| {
            state.status = CallStatus::MoreAvailable;
            state.fragments.push_back(value);
        });
    }

    pub(crate) fn finish(&self) {
        self.transition(|state| {
            state.status = CallStatus::Done;
        });
    }

    pub(crate) fn fail(&self, error: RpcError) {
        self.transition(|state| {
            state.status = CallStatus::Error;
            state.error = Some(error);
        });
    }

    /// The latest observable value: result, queued fragment or error.
    pub(crate) fn latest(&self) -> Option<Object> {
        let state = self.state.lock().unwrap();
        state
            .result
            .clone()
            .or_else(|| state.fragments.back().cloned())
            .or_else(|| state.error.clone().map(Object::error))
    }

    pub(crate) fn fire_callback(&self, status: CallStatus, value: Option<Object>) {
        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(status, value);
        }
    }

    async fn wait_leaving_in_progress(&self) {
        loop {
            let notified = self.notify.notified();
            if self.state.lock().unwrap().status != CallStatus::InProgress {
                return;
            }
            notified.await;
        }
    }
}

/// Handle for an in-flight outbound call.
#[derive(Clone)]
pub struct Call {
    pub(crate) core: Arc<CallCore>,
    pub(crate) conn: Connection,
}

impl Call {
    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn method(&self) -> &str {
        &self.core.method
    }

    pub fn status(&self) -> CallStatus {
        self.core.status()
    }

    /// Await the first transition out of `InProgress`.
    pub async fn wait(&self) -> CallStatus {
        self.core.wait_leaving_in_progress().await;
        self.core.status()
    }

    /// Await the terminal state and return the single result.
    pub async fn result(&self) -> Result<Object, RpcError> {
        loop {
            let notified = self.core.notify.notified();
            {
                let state = self.core.state.lock().unwrap();
                match state.status {
                    CallStatus::Done => {
                        return Ok(state.result.clone().unwrap_or_else(Object::null))
                    }
                    CallStatus::Error => {
                        return Err(state
                            .error
                            .clone()
                            .unwrap_or_else(|| RpcError::io("Call failed")))
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Cancel the call: an `abort` frame is sent and the local state
    /// becomes `error(ECANCELED)`.
    pub async fn abort(&self) {
        let _ = self.conn.send_frame(Frame::Abort { id: self.core.id }).await;
        self.core.fail(RpcError::canceled("Call aborted"));
        self.conn.forget_call(self.core.id);
        self.conn
            .enqueue_callback(&self.core, CallStatus::Error, self.core.latest());
    }
}

/// Outcome of a synchronous call: a single result or a fragment stream.
#[derive(Debug)]
pub enum CallResponse {
    Single(Object),
    Stream(CallStream),
}

impl CallResponse {
    /// The single result, treating a streaming response as a usage error.
    pub fn into_single(self) -> Result<Object, RpcError> {
        match self {
            CallResponse::Single(result) => Ok(result),
            CallResponse::Stream(_) => {
                Err(RpcError::invalid("Streaming response to a unary call"))
            }
        }
    }
}

/// Iterator over streaming call fragments. Consuming a fragment sends
/// `continue`, asking the producer for the next one; the stream ends on
/// `end` or yields the terminal error.
pub struct CallStream {
    pub(crate) call: Call,
}

impl std::fmt::Debug for CallStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream")
            .field("id", &self.call.core.id)
            .finish()
    }
}

enum NextPoll {
    Fragment(Object),
    Done,
    Error(RpcError),
    Pending,
}

impl CallStream {
    fn poll_once(&self) -> NextPoll {
        let mut state = self.call.core.state.lock().unwrap();
        if let Some(value) = state.fragments.pop_front() {
            return NextPoll::Fragment(value);
        }

        match state.status {
            CallStatus::Done => NextPoll::Done,
            CallStatus::Error => {
                if state.error_consumed {
                    return NextPoll::Done;
                }
                state.error_consumed = true;
                NextPoll::Error(
                    state
                        .error
                        .clone()
                        .unwrap_or_else(|| RpcError::io("Call failed")),
                )
            }
            _ => NextPoll::Pending,
        }
    }

    pub async fn next(&mut self) -> Option<Result<Object, RpcError>> {
        loop {
            let notified = self.call.core.notify.notified();
            match self.poll_once() {
                NextPoll::Fragment(value) => {
                    let _ = self
                        .call
                        .conn
                        .send_frame(Frame::Continue { id: self.call.core.id })
                        .await;
                    return Some(Ok(value));
                }
                NextPoll::Done => return None,
                NextPoll::Error(err) => return Some(Err(err)),
                NextPoll::Pending => {}
            }
            notified.await;
        }
    }

    pub fn status(&self) -> CallStatus {
        self.call.status()
    }

    /// Adapt into a `Stream` of fragments.
    pub fn into_stream(self) -> impl Stream<Item = Result<Object, RpcError>> + Send {
        stream::unfold(self, |mut this| async move {
            this.next().await.map(|item| (item, this))
        })
    }
}

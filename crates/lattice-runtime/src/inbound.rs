//! Inbound call handles.
//!
//! An inbound call is created when a `call` frame arrives and lives until
//! a terminal frame is sent back. Streaming producers block in
//! `yield_fragment` until the consumer's `continue` catches up or the
//! call is aborted.

use std::sync::{Mutex, Weak};

use lattice_core::{Object, RpcError};
use tokio::sync::Notify;
use tracing::debug;

use crate::connection::ConnectionInner;
use crate::frame::Frame;

#[derive(Debug, Default)]
struct InboundState {
    producer_seqno: u64,
    consumer_seqno: u64,
    streaming: bool,
    responded: bool,
    ended: bool,
    aborted: bool,
}

/// Server-side handle tracking one call's lifetime.
pub struct InboundCall {
    id: u64,
    path: String,
    interface: String,
    method: String,
    args: Object,
    conn: Weak<ConnectionInner>,
    state: Mutex<InboundState>,
    cv: Notify,
}

impl InboundCall {
    pub(crate) fn new(
        id: u64,
        path: String,
        interface: String,
        method: String,
        args: Object,
        conn: Weak<ConnectionInner>,
    ) -> Self {
        Self {
            id,
            path,
            interface,
            method,
            args,
            conn,
            state: Mutex::new(InboundState::default()),
            cv: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    pub fn method_name(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &Object {
        &self.args
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.state.lock().unwrap().streaming
    }

    pub(crate) fn has_responded(&self) -> bool {
        self.state.lock().unwrap().responded
    }

    async fn send(&self, frame: Frame) -> Result<(), RpcError> {
        let conn = self
            .conn
            .upgrade()
            .ok_or_else(|| RpcError::connection_reset("Connection gone"))?;
        conn.send_frame(frame).await
    }

    /// Produce one fragment and wait until the peer asks for the next
    /// one. Returns `ECANCELED` once the call is aborted, signalling the
    /// producer to unwind.
    pub async fn yield_fragment(&self, value: Object) -> Result<(), RpcError> {
        let seqno = {
            let mut state = self.state.lock().unwrap();
            if state.aborted {
                return Err(RpcError::canceled("Call aborted"));
            }
            if state.ended {
                return Err(RpcError::invalid("Stream already ended"));
            }
            state.streaming = true;
            let seqno = state.producer_seqno;
            state.producer_seqno += 1;
            seqno
        };

        self.send(Frame::Fragment {
            id: self.id,
            seqno,
            value,
        })
        .await?;

        loop {
            let notified = self.cv.notified();
            {
                let state = self.state.lock().unwrap();
                if state.aborted {
                    return Err(RpcError::canceled("Call aborted"));
                }
                if state.consumer_seqno >= state.producer_seqno {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Send the single response. A second response for the same call is
    /// dropped.
    pub async fn respond(&self, result: Object) {
        if !self.begin_response() {
            return;
        }
        let _ = self
            .send(Frame::Response {
                id: self.id,
                result,
            })
            .await;
    }

    /// Close a fragment stream successfully.
    pub async fn end(&self) {
        let seqno = {
            let mut state = self.state.lock().unwrap();
            if state.responded && !state.streaming {
                debug!(id = self.id, "dropping duplicate response");
                return;
            }
            if state.ended || state.aborted {
                debug!(id = self.id, "dropping end for finished call");
                return;
            }
            state.responded = true;
            state.ended = true;
            state.producer_seqno
        };

        let _ = self.send(Frame::End { id: self.id, seqno }).await;
    }

    /// Terminate the call with an error.
    pub async fn error(&self, error: RpcError) {
        if !self.begin_response() {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.ended = true;
        }
        let _ = self.send(Frame::Error { id: self.id, error }).await;
    }

    fn begin_response(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.responded || state.ended {
            debug!(id = self.id, "dropping duplicate response");
            return false;
        }
        if state.aborted {
            debug!(id = self.id, "dropping response for aborted call");
            return false;
        }
        state.responded = true;
        true
    }

    /// A `continue` frame arrived: release the producer for the next
    /// fragment. Ignored after `end` or `error`.
    pub(crate) fn continue_received(&self) {
        let mut state = self.state.lock().unwrap();
        if state.ended {
            return;
        }
        state.consumer_seqno += 1;
        drop(state);
        self.cv.notify_waiters();
    }

    /// The peer aborted the call; the next `yield_fragment` unwinds.
    pub(crate) fn mark_aborted(&self) {
        let mut state = self.state.lock().unwrap();
        state.aborted = true;
        drop(state);
        self.cv.notify_waiters();
    }
}

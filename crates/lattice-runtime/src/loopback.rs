//! In-process loopback transport.
//!
//! Connects peers through in-memory channels. Used by the test suite and
//! for same-process producer/consumer pairs; it carries no credentials.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Once};

use async_trait::async_trait;
use bytes::Bytes;
use lattice_core::{code, RpcError};
use tokio::sync::{mpsc, Notify};

use crate::transport::{register_transport, Listener, MessageChannel, Transport};

static LISTENERS: LazyLock<Mutex<HashMap<String, mpsc::UnboundedSender<Box<dyn MessageChannel>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Register the loopback transport in the global registry. Safe to call
/// more than once.
pub fn register() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| register_transport(Arc::new(LoopbackTransport)));
}

pub struct LoopbackTransport;

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["loopback"]
    }

    async fn connect(&self, uri: &str) -> Result<Box<dyn MessageChannel>, RpcError> {
        let accept_tx = LISTENERS
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| RpcError::new(code::ECONNREFUSED, "Connection refused"))?;

        let (client, server) = LoopbackChannel::pair();
        accept_tx
            .send(Box::new(server))
            .map_err(|_| RpcError::new(code::ECONNREFUSED, "Connection refused"))?;

        Ok(Box::new(client))
    }

    async fn listen(&self, uri: &str) -> Result<Box<dyn Listener>, RpcError> {
        let mut listeners = LISTENERS.lock().unwrap();
        if listeners.contains_key(uri) {
            return Err(RpcError::invalid(format!("Address in use: {}", uri)));
        }

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        listeners.insert(uri.to_string(), accept_tx);

        Ok(Box::new(LoopbackListener {
            uri: uri.to_string(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }))
    }
}

struct LoopbackListener {
    uri: String,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<dyn MessageChannel>>>,
}

#[async_trait]
impl Listener for LoopbackListener {
    async fn accept(&self) -> Result<Box<dyn MessageChannel>, RpcError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| RpcError::connection_reset("Listener closed"))
    }

    fn close(&self) {
        LISTENERS.lock().unwrap().remove(&self.uri);
    }
}

/// One end of an in-memory duplex link. Messages sent on one end appear
/// on the other, in order.
pub struct LoopbackChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    aborted: AtomicBool,
    abort_notify: Notify,
}

impl LoopbackChannel {
    /// A pair of connected channel ends.
    pub fn pair() -> (LoopbackChannel, LoopbackChannel) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = LoopbackChannel {
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
            aborted: AtomicBool::new(false),
            abort_notify: Notify::new(),
        };
        let b = LoopbackChannel {
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
            aborted: AtomicBool::new(false),
            abort_notify: Notify::new(),
        };

        (a, b)
    }
}

#[async_trait]
impl MessageChannel for LoopbackChannel {
    async fn send(&self, frame: Bytes) -> Result<(), RpcError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(RpcError::connection_reset("Channel aborted"));
        }

        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| RpcError::connection_reset("Peer gone")),
            None => Err(RpcError::connection_reset("Channel aborted")),
        }
    }

    async fn recv(&self) -> Result<Option<Bytes>, RpcError> {
        let notified = self.abort_notify.notified();
        if self.aborted.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            message = rx.recv() => Ok(message),
            _ = notified => Ok(None),
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        // Dropping our sender drains the peer to None as well.
        self.tx.lock().unwrap().take();
        self.abort_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_duplex() {
        let (a, b) = LoopbackChannel::pair();

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(Bytes::from_static(b"ping")));

        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn test_abort_drains_both_ends() {
        let (a, b) = LoopbackChannel::pair();

        a.abort();
        assert!(a.send(Bytes::new()).await.is_err());
        assert_eq!(a.recv().await.unwrap(), None);
        assert_eq!(b.recv().await.unwrap(), None);
    }
}

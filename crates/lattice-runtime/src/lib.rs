//! Call engine, connection and server lifecycle for the Lattice RPC
//! runtime.
//!
//! This crate ties the object model and the typing layer together:
//! - Transport interface and process-global registry
//! - Protocol frames and the per-connection call engine
//! - Context (method registry + worker pool) and server lifecycle
//! - Event subscription and fan-out
//! - Built-in typing discovery service

pub mod call;
pub mod client;
pub mod connection;
pub mod context;
pub mod frame;
pub mod inbound;
pub mod loopback;
pub mod server;
pub mod service;
pub mod transport;

pub use call::{Call, CallResponse, CallStatus, CallStream};
pub use client::{connect, ClientBuilder};
pub use connection::{Connection, EventHandler};
pub use context::{Context, MethodResult};
pub use frame::Frame;
pub use inbound::InboundCall;
pub use server::{Server, ServerEvent, ServerEventHandler};
pub use transport::{
    find_transport, register_transport, Credentials, Listener, MessageChannel, Transport,
};

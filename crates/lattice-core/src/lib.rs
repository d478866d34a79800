//! Core types for the Lattice RPC runtime.
//!
//! This crate provides the foundation shared by all Lattice components:
//! - The dynamic object model (tagged, refcounted values)
//! - The wire error model (POSIX-style codes plus message and extra)
//! - The codec registry (msgpack, json, yaml)

pub mod error;
mod json;
mod msgpack;
pub mod object;
pub mod serializer;
mod yaml;

pub use error::{code, RpcError};
pub use object::{Object, ObjectKind, TypeTag};
pub use serializer::{dump, find_serializer, load, Serializer};

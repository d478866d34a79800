//! IDL-driven type system for the Lattice RPC runtime.
//!
//! IDL documents are YAML files declaring types (structs, unions, enums,
//! typedefs, with generics) and interfaces (methods, properties,
//! events). This crate loads them into a [`TypingContext`], produces
//! specialized [`TypeInstance`]s at call sites, validates values against
//! declarations and wraps payloads with type annotations for the wire.

pub mod context;
pub mod file;
pub mod grammar;
pub mod interface;
pub mod typed;
pub mod types;
pub mod validate;

pub use context::{TypingContext, TYPING_INTERFACE};
pub use file::IdlFile;
pub use interface::{AccessRights, Argument, IfMember, IfMemberKind, Interface};
pub use typed::{get_class, get_typei, get_value, set_value, typed};
pub use types::{is_compatible, Member, Type, TypeClass, TypeInstance, BUILTIN_TYPES};
pub use validate::{errors_to_object, ValidationError};

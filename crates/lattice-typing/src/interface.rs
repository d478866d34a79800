//! Interfaces and their members.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::TypeInstance;

/// Access rights of a property member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRights {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// A declared method argument.
#[derive(Debug)]
pub struct Argument {
    pub name: String,
    pub description: String,
    pub typei: TypeInstance,
}

/// The shape of an interface member.
#[derive(Debug)]
pub enum IfMemberKind {
    Method {
        arguments: Vec<Argument>,
        result: Option<TypeInstance>,
    },
    Property {
        result: Option<TypeInstance>,
        access: AccessRights,
        notify: bool,
    },
    Event {
        payload: Option<TypeInstance>,
    },
}

/// A method, property or event declared on an interface.
#[derive(Debug)]
pub struct IfMember {
    pub name: String,
    pub description: String,
    pub kind: IfMemberKind,
}

impl IfMember {
    pub fn arguments(&self) -> Option<&[Argument]> {
        match &self.kind {
            IfMemberKind::Method { arguments, .. } => Some(arguments),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&TypeInstance> {
        match &self.kind {
            IfMemberKind::Method { result, .. } => result.as_ref(),
            IfMemberKind::Property { result, .. } => result.as_ref(),
            IfMemberKind::Event { payload } => payload.as_ref(),
        }
    }
}

/// A named interface.
#[derive(Debug)]
pub struct Interface {
    /// Fully qualified name (`namespace.localname`).
    pub name: String,
    pub description: String,
    /// `path:line` of the declaration.
    pub origin: String,
    pub members: HashMap<String, Arc<IfMember>>,
}

impl Interface {
    pub fn member(&self, name: &str) -> Option<&Arc<IfMember>> {
        self.members.get(name)
    }

    /// Iterate members; the callback returns `true` to keep going.
    /// Returns `true` if stopped early.
    pub fn members_apply<F: FnMut(&IfMember) -> bool>(&self, mut f: F) -> bool {
        for member in self.members.values() {
            if !f(member.as_ref()) {
                return true;
            }
        }
        false
    }
}

//! Types and type instances.
//!
//! A [`Type`] is a named, possibly generic declaration read from an IDL
//! document (or a builtin). A [`TypeInstance`] is a concrete usage of a
//! type at a site, with generic variables specialized. Instances are
//! refcounted; types live for the lifetime of their [`crate::TypingContext`].

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use lattice_core::{Object, TypeTag};

/// Builtin type names reserved by the runtime.
pub const BUILTIN_TYPES: &[&str] = &[
    "nulltype",
    "bool",
    "uint64",
    "int64",
    "double",
    "date",
    "string",
    "binary",
    "fd",
    "dictionary",
    "array",
    "shmem",
    "error",
    "any",
];

/// Class of a type declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeClass {
    Struct,
    Union,
    Enum,
    Typedef,
    Builtin,
}

impl TypeClass {
    pub fn from_decl(decl: &str) -> Option<Self> {
        match decl {
            "struct" => Some(TypeClass::Struct),
            "union" => Some(TypeClass::Union),
            "enum" => Some(TypeClass::Enum),
            "typedef" => Some(TypeClass::Typedef),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TypeClass::Struct => "struct",
            TypeClass::Union => "union",
            TypeClass::Enum => "enum",
            TypeClass::Typedef => "typedef",
            TypeClass::Builtin => "builtin",
        }
    }
}

/// A structure member, union branch or enum tag.
#[derive(Debug)]
pub struct Member {
    pub name: String,
    pub description: String,
    /// `None` for enum tags, which are untyped.
    pub typei: Option<TypeInstance>,
    pub constraints: Arc<HashMap<String, Object>>,
}

/// A named type: struct, union, enum, typedef or builtin.
#[derive(Debug)]
pub struct Type {
    /// Fully qualified name (`namespace.localname`).
    pub name: String,
    pub description: String,
    pub class: TypeClass,
    /// Defining file, for namespace-aware member type lookups.
    pub file: Option<PathBuf>,
    /// `path:line` of the declaration, for diagnostics.
    pub origin: String,
    /// Single-inheritance parent; members are merged at load time.
    pub parent: Option<Arc<Type>>,
    /// Ordered generic variable names; empty for non-generic types.
    pub generic_vars: Vec<String>,
    pub members: HashMap<String, Member>,
    pub constraints: Arc<HashMap<String, Object>>,
    /// Typedef body; `None` for every other class.
    pub definition: Option<TypeInstance>,
}

impl Type {
    pub fn is_generic(&self) -> bool {
        !self.generic_vars.is_empty()
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Iterate members; the callback returns `true` to keep going.
    /// Returns `true` if stopped early.
    pub fn members_apply<F: FnMut(&Member) -> bool>(&self, mut f: F) -> bool {
        for member in self.members.values() {
            if !f(member) {
                return true;
            }
        }
        false
    }
}

#[derive(Debug)]
enum InstanceInner {
    /// An unresolved generic variable, e.g. the `T` in `List<T>` inside a
    /// generic type body.
    Proxy { variable: String },
    Concrete {
        ty: Arc<Type>,
        specializations: HashMap<String, TypeInstance>,
        constraints: Arc<HashMap<String, Object>>,
        canonical: String,
    },
}

/// A specialized usage of a [`Type`].
#[derive(Debug, Clone)]
pub struct TypeInstance {
    inner: Arc<InstanceInner>,
}

impl TypeInstance {
    pub(crate) fn proxy(variable: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(InstanceInner::Proxy {
                variable: variable.into(),
            }),
        }
    }

    pub(crate) fn concrete(
        ty: Arc<Type>,
        specializations: HashMap<String, TypeInstance>,
        constraints: Arc<HashMap<String, Object>>,
    ) -> Self {
        let canonical = render_canonical(&ty, &specializations);
        Self {
            inner: Arc::new(InstanceInner::Concrete {
                ty,
                specializations,
                constraints,
                canonical,
            }),
        }
    }

    /// Same instance with a different constraint set; used when a member
    /// site narrows the constraints of its declared type.
    pub(crate) fn with_constraints(&self, constraints: Arc<HashMap<String, Object>>) -> Self {
        match &*self.inner {
            InstanceInner::Proxy { variable } => Self::proxy(variable.clone()),
            InstanceInner::Concrete {
                ty, specializations, ..
            } => Self::concrete(ty.clone(), specializations.clone(), constraints),
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(&*self.inner, InstanceInner::Proxy { .. })
    }

    /// The generic variable name, for proxy instances.
    pub fn variable(&self) -> Option<&str> {
        match &*self.inner {
            InstanceInner::Proxy { variable } => Some(variable),
            InstanceInner::Concrete { .. } => None,
        }
    }

    pub fn ty(&self) -> Option<&Arc<Type>> {
        match &*self.inner {
            InstanceInner::Proxy { .. } => None,
            InstanceInner::Concrete { ty, .. } => Some(ty),
        }
    }

    pub fn specialization(&self, variable: &str) -> Option<&TypeInstance> {
        match &*self.inner {
            InstanceInner::Proxy { .. } => None,
            InstanceInner::Concrete { specializations, .. } => specializations.get(variable),
        }
    }

    pub(crate) fn specializations(&self) -> Option<&HashMap<String, TypeInstance>> {
        match &*self.inner {
            InstanceInner::Proxy { .. } => None,
            InstanceInner::Concrete { specializations, .. } => Some(specializations),
        }
    }

    pub fn specialization_count(&self) -> usize {
        self.specializations().map(HashMap::len).unwrap_or(0)
    }

    pub fn constraints(&self) -> Option<&Arc<HashMap<String, Object>>> {
        match &*self.inner {
            InstanceInner::Proxy { .. } => None,
            InstanceInner::Concrete { constraints, .. } => Some(constraints),
        }
    }

    /// A type instance is fully specialized iff its type is non-generic
    /// or every generic variable is bound to a non-proxy instance.
    pub fn is_fully_specialized(&self) -> bool {
        match &*self.inner {
            InstanceInner::Proxy { .. } => false,
            InstanceInner::Concrete {
                ty, specializations, ..
            } => {
                if !ty.is_generic() {
                    return true;
                }
                ty.generic_vars.len() == specializations.len()
                    && specializations.values().all(|s| !s.is_proxy())
            }
        }
    }

    /// Follow typedef definitions until a non-typedef instance is reached.
    pub fn unwind(&self) -> TypeInstance {
        let mut current = self.clone();
        loop {
            let next = match &*current.inner {
                InstanceInner::Concrete { ty, .. } if ty.class == TypeClass::Typedef => {
                    match &ty.definition {
                        Some(def) => def.clone(),
                        None => return current,
                    }
                }
                _ => return current,
            };
            current = next;
        }
    }

    pub fn canonical_form(&self) -> &str {
        match &*self.inner {
            InstanceInner::Proxy { variable } => variable,
            InstanceInner::Concrete { canonical, .. } => canonical,
        }
    }

    /// Pointer identity, used to observe canonical-cache sharing.
    pub fn ptr_eq(&self, other: &TypeInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl TypeTag for TypeInstance {
    fn canonical_form(&self) -> &str {
        TypeInstance::canonical_form(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn render_canonical(ty: &Arc<Type>, specializations: &HashMap<String, TypeInstance>) -> String {
    if !ty.is_generic() {
        return ty.name.clone();
    }

    // Specializations render in generic-variable declaration order.
    let vars: Vec<&str> = ty
        .generic_vars
        .iter()
        .map(|var| {
            specializations
                .get(var)
                .map(|s| s.canonical_form())
                .unwrap_or(var.as_str())
        })
        .collect();

    format!("{}<{}>", ty.name, vars.join(","))
}

/// Structural compatibility: is a value annotated `actual` acceptable
/// where `decl` is declared?
///
/// Specialization arguments are not compared; `List<int64>` passes where
/// `List<string>` is declared.
pub fn is_compatible(decl: &TypeInstance, actual: &TypeInstance) -> bool {
    let (Some(decl_ty), Some(actual_ty)) = (decl.ty(), actual.ty()) else {
        return false;
    };

    if decl_ty.name == "any" {
        return true;
    }

    if decl.specialization_count() > actual.specialization_count() {
        return false;
    }

    if decl_ty.name == actual_ty.name {
        return true;
    }

    // The wire codecs do not preserve integer signedness below i64::MAX,
    // so the two integer builtins accept each other; range is checked by
    // the builtin validator.
    if matches!(
        (decl_ty.name.as_str(), actual_ty.name.as_str()),
        ("int64", "uint64") | ("uint64", "int64")
    ) {
        return true;
    }

    // Walk the actual type's ancestor chain looking for the declared type.
    let mut cur = actual_ty.parent.clone();
    while let Some(parent) = cur {
        if parent.name == decl_ty.name {
            return true;
        }
        cur = parent.parent.clone();
    }

    false
}

//! The dynamic object model.
//!
//! Every value that crosses a Lattice call boundary is an [`Object`]: a
//! refcounted, tagged value. Cloning an object retains it; the backing
//! storage is released when the last handle drops. Containers (arrays and
//! dictionaries) hold objects and may be mutated in place through any
//! handle.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::{Arc, OnceLock, RwLock};

use bytes::Bytes;

use crate::error::RpcError;

/// The kind tag of an [`Object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Null,
    Bool,
    Uint64,
    Int64,
    Double,
    Date,
    String,
    Binary,
    Fd,
    Dictionary,
    Array,
    Error,
}

impl ObjectKind {
    /// Wire name of the kind. Matches the builtin type names used by the
    /// typing layer, except that the null kind is named `null` here and
    /// `nulltype` in IDL documents.
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Null => "null",
            ObjectKind::Bool => "bool",
            ObjectKind::Uint64 => "uint64",
            ObjectKind::Int64 => "int64",
            ObjectKind::Double => "double",
            ObjectKind::Date => "date",
            ObjectKind::String => "string",
            ObjectKind::Binary => "binary",
            ObjectKind::Fd => "fd",
            ObjectKind::Dictionary => "dictionary",
            ObjectKind::Array => "array",
            ObjectKind::Error => "error",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type annotation attached to an object by the typing layer.
///
/// Defined as a trait so the object model does not depend on the typing
/// crate; the typing layer downcasts through `as_any`.
pub trait TypeTag: fmt::Debug + Send + Sync {
    /// Canonical rendering of the annotated type, e.g. `HashMap<string,double>`.
    fn canonical_form(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// An owned or borrowed file descriptor value.
///
/// Owned descriptors are closed when the last object handle drops.
/// Borrowed descriptors (produced by decoding) are left open.
#[derive(Debug)]
pub struct FdValue {
    raw: RawFd,
    owned: bool,
}

impl FdValue {
    pub fn raw(&self) -> RawFd {
        self.raw
    }
}

impl Drop for FdValue {
    fn drop(&mut self) {
        if self.owned {
            // Reconstruct the OwnedFd so the descriptor is closed.
            drop(unsafe { OwnedFd::from_raw_fd(self.raw) });
        }
    }
}

#[derive(Debug)]
enum Value {
    Null,
    Bool(bool),
    Uint64(u64),
    Int64(i64),
    Double(f64),
    /// Seconds since the Unix epoch, whole-second precision.
    Date(i64),
    String(String),
    Binary(Bytes),
    Fd(Arc<FdValue>),
    Array(RwLock<Vec<Object>>),
    Dictionary(RwLock<HashMap<String, Object>>),
    Error(Box<RpcError>),
}

#[derive(Debug)]
struct Inner {
    value: Value,
    type_tag: OnceLock<Arc<dyn TypeTag>>,
    /// Source line in the document this object was decoded from, if known.
    line: OnceLock<u64>,
}

/// A refcounted dynamic value.
///
/// `clone` retains, `drop` releases. Equality is structural: two objects
/// are equal iff their kinds match and their values match, recursively
/// for containers.
#[derive(Debug, Clone)]
pub struct Object {
    inner: Arc<Inner>,
}

impl Object {
    fn from_value(value: Value) -> Self {
        Self {
            inner: Arc::new(Inner {
                value,
                type_tag: OnceLock::new(),
                line: OnceLock::new(),
            }),
        }
    }

    pub fn null() -> Self {
        Self::from_value(Value::Null)
    }

    pub fn boolean(v: bool) -> Self {
        Self::from_value(Value::Bool(v))
    }

    pub fn uint64(v: u64) -> Self {
        Self::from_value(Value::Uint64(v))
    }

    pub fn int64(v: i64) -> Self {
        Self::from_value(Value::Int64(v))
    }

    pub fn double(v: f64) -> Self {
        Self::from_value(Value::Double(v))
    }

    /// A date, as whole seconds since the Unix epoch.
    pub fn date(secs: i64) -> Self {
        Self::from_value(Value::Date(secs))
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self::from_value(Value::String(v.into()))
    }

    /// Binary data. `Bytes` carries the copy-or-borrow distinction: a
    /// buffer built with `Bytes::from_static` borrows, anything else owns
    /// or shares its storage.
    pub fn binary(v: Bytes) -> Self {
        Self::from_value(Value::Binary(v))
    }

    pub fn binary_copy(v: &[u8]) -> Self {
        Self::from_value(Value::Binary(Bytes::copy_from_slice(v)))
    }

    /// Takes ownership of the descriptor; it is closed when the last
    /// handle to this object drops.
    pub fn fd(fd: OwnedFd) -> Self {
        Self::from_value(Value::Fd(Arc::new(FdValue {
            raw: fd.into_raw_fd(),
            owned: true,
        })))
    }

    /// Wraps a descriptor number without taking ownership. Used by codecs
    /// when decoding; the descriptor is not closed on release.
    pub fn fd_borrowed(raw: RawFd) -> Self {
        Self::from_value(Value::Fd(Arc::new(FdValue { raw, owned: false })))
    }

    pub fn array() -> Self {
        Self::from_value(Value::Array(RwLock::new(Vec::new())))
    }

    pub fn array_from(items: impl IntoIterator<Item = Object>) -> Self {
        Self::from_value(Value::Array(RwLock::new(items.into_iter().collect())))
    }

    pub fn dictionary() -> Self {
        Self::from_value(Value::Dictionary(RwLock::new(HashMap::new())))
    }

    pub fn dictionary_from<K: Into<String>>(
        entries: impl IntoIterator<Item = (K, Object)>,
    ) -> Self {
        Self::from_value(Value::Dictionary(RwLock::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn error(err: RpcError) -> Self {
        Self::from_value(Value::Error(Box::new(err)))
    }

    pub fn kind(&self) -> ObjectKind {
        match &self.inner.value {
            Value::Null => ObjectKind::Null,
            Value::Bool(_) => ObjectKind::Bool,
            Value::Uint64(_) => ObjectKind::Uint64,
            Value::Int64(_) => ObjectKind::Int64,
            Value::Double(_) => ObjectKind::Double,
            Value::Date(_) => ObjectKind::Date,
            Value::String(_) => ObjectKind::String,
            Value::Binary(_) => ObjectKind::Binary,
            Value::Fd(_) => ObjectKind::Fd,
            Value::Array(_) => ObjectKind::Array,
            Value::Dictionary(_) => ObjectKind::Dictionary,
            Value::Error(_) => ObjectKind::Error,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.inner.value, Value::Null)
    }

    /// Number of strong handles to this object. Mostly useful in tests.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.inner.value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint64(&self) -> Option<u64> {
        match &self.inner.value {
            Value::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int64(&self) -> Option<i64> {
        match &self.inner.value {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match &self.inner.value {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<i64> {
        match &self.inner.value {
            Value::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.inner.value {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.inner.value {
            Value::Binary(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_fd(&self) -> Option<RawFd> {
        match &self.inner.value {
            Value::Fd(v) => Some(v.raw()),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&RpcError> {
        match &self.inner.value {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    // Array operations.

    pub fn array_append(&self, item: Object) {
        if let Value::Array(items) = &self.inner.value {
            items.write().unwrap().push(item);
        }
    }

    pub fn array_get(&self, index: usize) -> Option<Object> {
        match &self.inner.value {
            Value::Array(items) => items.read().unwrap().get(index).cloned(),
            _ => None,
        }
    }

    pub fn array_set(&self, index: usize, item: Object) -> Result<(), RpcError> {
        match &self.inner.value {
            Value::Array(items) => {
                let mut items = items.write().unwrap();
                if index >= items.len() {
                    return Err(RpcError::out_of_range(format!(
                        "Index {} out of bounds",
                        index
                    )));
                }
                items[index] = item;
                Ok(())
            }
            _ => Err(RpcError::invalid("Not an array")),
        }
    }

    pub fn array_remove(&self, index: usize) -> Result<Object, RpcError> {
        match &self.inner.value {
            Value::Array(items) => {
                let mut items = items.write().unwrap();
                if index >= items.len() {
                    return Err(RpcError::out_of_range(format!(
                        "Index {} out of bounds",
                        index
                    )));
                }
                Ok(items.remove(index))
            }
            _ => Err(RpcError::invalid("Not an array")),
        }
    }

    /// Iterate over array elements. The callback returns `true` to keep
    /// going; returning `false` stops early. The return value is `true`
    /// if iteration was stopped by the callback.
    pub fn array_apply<F: FnMut(usize, &Object) -> bool>(&self, mut f: F) -> bool {
        if let Value::Array(items) = &self.inner.value {
            let items = items.read().unwrap();
            for (idx, item) in items.iter().enumerate() {
                if !f(idx, item) {
                    return true;
                }
            }
        }
        false
    }

    // Dictionary operations.

    pub fn dict_set(&self, key: impl Into<String>, value: Object) {
        if let Value::Dictionary(map) = &self.inner.value {
            map.write().unwrap().insert(key.into(), value);
        }
    }

    pub fn dict_get(&self, key: &str) -> Option<Object> {
        match &self.inner.value {
            Value::Dictionary(map) => map.read().unwrap().get(key).cloned(),
            _ => None,
        }
    }

    pub fn dict_contains(&self, key: &str) -> bool {
        match &self.inner.value {
            Value::Dictionary(map) => map.read().unwrap().contains_key(key),
            _ => false,
        }
    }

    /// Remove a key, returning its value if present.
    pub fn dict_detach(&self, key: &str) -> Option<Object> {
        match &self.inner.value {
            Value::Dictionary(map) => map.write().unwrap().remove(key),
            _ => None,
        }
    }

    pub fn dict_remove(&self, key: &str) -> Result<(), RpcError> {
        self.dict_detach(key)
            .map(|_| ())
            .ok_or_else(|| RpcError::not_found(format!("Key '{}' not found", key)))
    }

    /// Iterate over dictionary entries. Same stop protocol as
    /// [`Object::array_apply`]. Iteration order is unspecified but stable
    /// for an unmodified dictionary.
    pub fn dict_apply<F: FnMut(&str, &Object) -> bool>(&self, mut f: F) -> bool {
        if let Value::Dictionary(map) = &self.inner.value {
            let map = map.read().unwrap();
            for (key, value) in map.iter() {
                if !f(key, value) {
                    return true;
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        match &self.inner.value {
            Value::Array(items) => items.read().unwrap().len(),
            Value::Dictionary(map) => map.read().unwrap().len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shallow copy: returns a fresh object. Container elements are
    /// re-retained, not copied. Leaves yield a semantically equal fresh
    /// object. The type annotation is not carried over.
    pub fn copy(&self) -> Object {
        match &self.inner.value {
            Value::Null => Object::null(),
            Value::Bool(v) => Object::boolean(*v),
            Value::Uint64(v) => Object::uint64(*v),
            Value::Int64(v) => Object::int64(*v),
            Value::Double(v) => Object::double(*v),
            Value::Date(v) => Object::date(*v),
            Value::String(v) => Object::string(v.clone()),
            Value::Binary(v) => Object::binary(v.clone()),
            Value::Fd(v) => Object::from_value(Value::Fd(Arc::clone(v))),
            Value::Array(items) => Object::array_from(items.read().unwrap().iter().cloned()),
            Value::Dictionary(map) => Object::dictionary_from(
                map.read()
                    .unwrap()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            ),
            Value::Error(e) => Object::error((**e).clone()),
        }
    }

    // Type annotation.

    /// Attach a type annotation. Returns `false` if one was already set.
    pub fn set_type_tag(&self, tag: Arc<dyn TypeTag>) -> bool {
        self.inner.type_tag.set(tag).is_ok()
    }

    pub fn type_tag(&self) -> Option<&Arc<dyn TypeTag>> {
        self.inner.type_tag.get()
    }

    /// Copy-then-annotate: a fresh shallow copy carrying `tag`.
    pub fn with_type_tag(&self, tag: Arc<dyn TypeTag>) -> Object {
        let copy = self.copy();
        copy.set_type_tag(tag);
        copy
    }

    // Source location, for diagnostics on decoded IDL documents.

    pub fn set_line_number(&self, line: u64) {
        let _ = self.inner.line.set(line);
    }

    pub fn line_number(&self) -> Option<u64> {
        self.inner.line.get().copied()
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }

        match (&self.inner.value, &other.inner.value) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Uint64(a), Value::Uint64(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Fd(a), Value::Fd(b)) => a.raw() == b.raw(),
            (Value::Array(a), Value::Array(b)) => {
                let a = a.read().unwrap();
                let b = b.read().unwrap();
                *a == *b
            }
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                let a = a.read().unwrap();
                let b = b.read().unwrap();
                *a == *b
            }
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;

    #[test]
    fn test_retain_release_balanced() {
        let obj = Object::string("hello");
        assert_eq!(obj.refcount(), 1);

        let retained = obj.clone();
        assert_eq!(obj.refcount(), 2);
        assert_eq!(retained.as_str(), Some("hello"));

        drop(retained);
        assert_eq!(obj.refcount(), 1);
        assert_eq!(obj.as_str(), Some("hello"));
    }

    #[test]
    fn test_structural_equality() {
        let a = Object::array_from([Object::int64(1), Object::string("x")]);
        let b = Object::array_from([Object::int64(1), Object::string("x")]);
        assert_eq!(a, b);

        b.array_append(Object::null());
        assert_ne!(a, b);

        // Kind mismatch is never equal, even for the same numeric value.
        assert_ne!(Object::int64(1), Object::uint64(1));
    }

    #[test]
    fn test_dictionary_ops() {
        let dict = Object::dictionary();
        dict.dict_set("a", Object::int64(1));
        dict.dict_set("b", Object::int64(2));
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.dict_get("a"), Some(Object::int64(1)));

        let detached = dict.dict_detach("a").unwrap();
        assert_eq!(detached, Object::int64(1));
        assert_eq!(dict.len(), 1);

        assert_eq!(
            dict.dict_remove("nope").unwrap_err().code,
            code::ENOENT
        );
    }

    #[test]
    fn test_array_bounds() {
        let arr = Object::array_from([Object::int64(1)]);
        assert_eq!(arr.array_set(5, Object::null()).unwrap_err().code, code::ERANGE);
        assert_eq!(arr.array_remove(5).unwrap_err().code, code::ERANGE);

        arr.array_set(0, Object::int64(9)).unwrap();
        assert_eq!(arr.array_get(0), Some(Object::int64(9)));
    }

    #[test]
    fn test_apply_stops_early() {
        let arr = Object::array_from([
            Object::int64(1),
            Object::int64(2),
            Object::int64(3),
        ]);

        let mut seen = 0;
        let stopped = arr.array_apply(|_, _| {
            seen += 1;
            seen < 2
        });
        assert!(stopped);
        assert_eq!(seen, 2);

        let stopped = arr.array_apply(|_, _| true);
        assert!(!stopped);
    }

    #[test]
    fn test_shallow_copy_retains_elements() {
        let shared = Object::string("shared");
        let arr = Object::array_from([shared.clone()]);

        let copy = arr.copy();
        copy.array_append(Object::int64(2));

        // Original is unaffected by mutation of the copy...
        assert_eq!(arr.len(), 1);
        // ...but the element itself is the same object.
        assert_eq!(shared.refcount(), 3);
    }

    #[test]
    fn test_copy_drops_annotation() {
        #[derive(Debug)]
        struct Tag;
        impl TypeTag for Tag {
            fn canonical_form(&self) -> &str {
                "string"
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        let obj = Object::string("x");
        assert!(obj.set_type_tag(Arc::new(Tag)));
        assert!(!obj.set_type_tag(Arc::new(Tag)));

        let copy = obj.copy();
        assert!(copy.type_tag().is_none());
    }

    #[test]
    fn test_date_boundaries() {
        assert_eq!(Object::date(0).as_date(), Some(0));
        assert_eq!(Object::date(i32::MAX as i64).as_date(), Some(2147483647));
    }
}

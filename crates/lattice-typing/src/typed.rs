//! Typed (de)serialization wrapping and instance helpers.
//!
//! `serialize` renders annotated objects into plain trees carrying
//! `%type` sentinel keys; `deserialize` reconstructs the annotations.
//! Both are identity-shaped for trees that never touch declared types.

use std::sync::Arc;

use lattice_core::{Object, ObjectKind, RpcError};

use crate::context::TypingContext;
use crate::types::{TypeClass, TypeInstance};

/// Sentinel dictionary keys used by typed serialization.
pub const REALM_FIELD: &str = "%realm";
pub const TYPE_FIELD: &str = "%type";
pub const VALUE_FIELD: &str = "%value";

fn builtin_name(obj: &Object) -> &'static str {
    if obj.is_null() {
        "nulltype"
    } else {
        obj.kind().name()
    }
}

impl TypingContext {
    /// Create a typed instance: a shallow copy of `obj` annotated with the
    /// unwound instance of `decl`.
    pub fn new_instance(&self, decl: &str, obj: &Object) -> Result<Object, RpcError> {
        let typei = self.instantiate(decl)?;
        Ok(typed(&typei, obj))
    }

    /// Descend a tree, annotating every node and rendering declared types
    /// with their `%type` sentinels.
    pub fn serialize(&self, obj: &Object) -> Result<Object, RpcError> {
        let Some(tag) = obj.type_tag() else {
            return match obj.kind() {
                ObjectKind::Dictionary => {
                    let out = Object::dictionary();
                    let mut failure = None;
                    obj.dict_apply(|key, value| match self.serialize(value) {
                        Ok(v) => {
                            out.dict_set(key, v);
                            true
                        }
                        Err(e) => {
                            failure = Some(e);
                            false
                        }
                    });
                    if let Some(e) = failure {
                        return Err(e);
                    }
                    out.set_type_tag(Arc::new(self.instantiate("dictionary")?));
                    Ok(out)
                }
                ObjectKind::Array => {
                    let out = Object::array();
                    let mut failure = None;
                    obj.array_apply(|_, value| match self.serialize(value) {
                        Ok(v) => {
                            out.array_append(v);
                            true
                        }
                        Err(e) => {
                            failure = Some(e);
                            false
                        }
                    });
                    if let Some(e) = failure {
                        return Err(e);
                    }
                    out.set_type_tag(Arc::new(self.instantiate("array")?));
                    Ok(out)
                }
                _ => {
                    let out = obj.copy();
                    out.set_type_tag(Arc::new(self.instantiate(builtin_name(obj))?));
                    Ok(out)
                }
            };
        };

        let Some(typei) = tag.as_any().downcast_ref::<TypeInstance>().cloned() else {
            return Ok(obj.clone());
        };

        let unwound = typei.unwind();
        let Some(ty) = unwound.ty().cloned() else {
            return Ok(obj.clone());
        };

        match ty.class {
            TypeClass::Builtin => match obj.kind() {
                ObjectKind::Dictionary => {
                    let out = Object::dictionary();
                    let mut failure = None;
                    obj.dict_apply(|key, value| match self.serialize(value) {
                        Ok(v) => {
                            out.dict_set(key, v);
                            true
                        }
                        Err(e) => {
                            failure = Some(e);
                            false
                        }
                    });
                    if let Some(e) = failure {
                        return Err(e);
                    }
                    out.set_type_tag(Arc::new(unwound));
                    Ok(out)
                }
                ObjectKind::Array => {
                    let out = Object::array();
                    let mut failure = None;
                    obj.array_apply(|_, value| match self.serialize(value) {
                        Ok(v) => {
                            out.array_append(v);
                            true
                        }
                        Err(e) => {
                            failure = Some(e);
                            false
                        }
                    });
                    if let Some(e) = failure {
                        return Err(e);
                    }
                    out.set_type_tag(Arc::new(unwound));
                    Ok(out)
                }
                _ => Ok(obj.clone()),
            },
            TypeClass::Struct | TypeClass::Union => {
                let out = Object::dictionary();
                out.dict_set(TYPE_FIELD, Object::string(unwound.canonical_form()));

                // Scalar-valued instances (union branches) carry their
                // value under %value.
                if obj.kind() != ObjectKind::Dictionary {
                    out.dict_set(VALUE_FIELD, obj.copy());
                    return Ok(out);
                }

                let mut failure = None;
                obj.dict_apply(|key, value| {
                    if key.starts_with('%') {
                        out.dict_set(key, value.clone());
                        return true;
                    }
                    match self.serialize(value) {
                        Ok(v) => {
                            out.dict_set(key, v);
                            true
                        }
                        Err(e) => {
                            failure = Some(e);
                            false
                        }
                    }
                });
                if let Some(e) = failure {
                    return Err(e);
                }
                Ok(out)
            }
            TypeClass::Enum => {
                let tag_value = obj
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| {
                        obj.dict_get(VALUE_FIELD)
                            .and_then(|v| v.as_str().map(str::to_string))
                    })
                    .ok_or_else(|| RpcError::invalid("Malformed enum instance"))?;

                let out = Object::dictionary();
                out.dict_set(TYPE_FIELD, Object::string(unwound.canonical_form()));
                out.dict_set(VALUE_FIELD, Object::string(tag_value));
                Ok(out)
            }
            TypeClass::Typedef => Ok(obj.clone()),
        }
    }

    /// Reconstruct annotations from a plain tree: `%type` keys become
    /// type annotations, `%realm` keys are stripped, everything else is
    /// annotated with its builtin type.
    pub fn deserialize(&self, obj: &Object) -> Result<Object, RpcError> {
        if obj.type_tag().is_some() {
            return Ok(obj.clone());
        }

        match obj.kind() {
            ObjectKind::Dictionary => {
                let out = Object::dictionary();
                let mut failure = None;
                obj.dict_apply(|key, value| {
                    if key == REALM_FIELD || key == TYPE_FIELD {
                        return true;
                    }
                    match self.deserialize(value) {
                        Ok(v) => {
                            out.dict_set(key, v);
                            true
                        }
                        Err(e) => {
                            failure = Some(e);
                            false
                        }
                    }
                });
                if let Some(e) = failure {
                    return Err(e);
                }

                let declared = obj
                    .dict_get(TYPE_FIELD)
                    .and_then(|t| t.as_str().map(str::to_string));

                match declared {
                    None => self.new_instance("dictionary", &out),
                    Some(decl) => match self.instantiate(&decl) {
                        Ok(typei) => Ok(typed(&typei, &out)),
                        // An unknown declared type decodes to null.
                        Err(_) => Ok(Object::null()),
                    },
                }
            }
            ObjectKind::Array => {
                let out = Object::array();
                let mut failure = None;
                obj.array_apply(|_, value| match self.deserialize(value) {
                    Ok(v) => {
                        out.array_append(v);
                        true
                    }
                    Err(e) => {
                        failure = Some(e);
                        false
                    }
                });
                if let Some(e) = failure {
                    return Err(e);
                }
                self.new_instance("array", &out)
            }
            _ => self.new_instance(builtin_name(obj), obj),
        }
    }
}

/// A shallow copy of `obj` annotated with the unwound form of `typei`.
pub fn typed(typei: &TypeInstance, obj: &Object) -> Object {
    obj.with_type_tag(Arc::new(typei.unwind()))
}

/// The type instance annotating an object, if any.
pub fn get_typei(obj: &Object) -> Option<TypeInstance> {
    obj.type_tag()
        .and_then(|tag| tag.as_any().downcast_ref::<TypeInstance>())
        .cloned()
}

/// The type class of an annotated object.
pub fn get_class(obj: &Object) -> Option<TypeClass> {
    get_typei(obj).and_then(|typei| typei.ty().map(|ty| ty.class))
}

/// The `%value` payload of an annotated dictionary instance.
pub fn get_value(obj: &Object) -> Option<Object> {
    if obj.type_tag().is_none() || obj.kind() != ObjectKind::Dictionary {
        return None;
    }
    obj.dict_get(VALUE_FIELD)
}

/// Set the `%value` payload of an annotated dictionary instance.
pub fn set_value(obj: &Object, value: &str) {
    if obj.type_tag().is_none() || obj.kind() != ObjectKind::Dictionary {
        return;
    }
    obj.dict_set(VALUE_FIELD, Object::string(value));
}

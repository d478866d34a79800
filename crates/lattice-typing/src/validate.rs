//! Constraint validation.
//!
//! Validation walks a value against a declared type instance, collecting
//! errors with dot-joined paths (`.a.b`, `.0` for argument positions).
//! Per-constraint validators are looked up by `(kind name, constraint
//! name)`.

use std::collections::HashMap;
use std::sync::LazyLock;

use lattice_core::{Object, ObjectKind, RpcError};
use regex::Regex;

use crate::context::TypingContext;
use crate::interface::IfMember;
use crate::types::{is_compatible, TypeClass, TypeInstance};

/// A single validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
    pub extra: Option<Object>,
}

fn add_error(
    errors: &mut Vec<ValidationError>,
    path: &str,
    message: String,
    extra: Option<Object>,
) {
    errors.push(ValidationError {
        path: path.to_string(),
        message,
        extra,
    });
}

/// Render collected errors as the wire `extra` payload: an array of
/// `{path, message, extra}` dictionaries.
pub fn errors_to_object(errors: &[ValidationError]) -> Object {
    Object::array_from(errors.iter().map(|err| {
        let entry = Object::dictionary();
        entry.dict_set("path", Object::string(err.path.clone()));
        entry.dict_set("message", Object::string(err.message.clone()));
        if let Some(extra) = &err.extra {
            entry.dict_set("extra", extra.clone());
        }
        entry
    }))
}

impl TypingContext {
    /// Validate a value against a type instance. On failure, returns the
    /// aggregated error array.
    pub fn validate(&self, typei: &TypeInstance, obj: &Object) -> Result<(), Object> {
        let mut errors = Vec::new();
        if self.validate_instance(typei, obj, "", &mut errors) {
            Ok(())
        } else {
            Err(errors_to_object(&errors))
        }
    }

    /// Validate call arguments against a method declaration. Arguments
    /// beyond the declared count are ignored. The per-argument error path
    /// is the argument index (`.0`, `.1`, ...).
    pub fn validate_args(&self, member: &IfMember, args: &Object) -> Result<(), Object> {
        let Some(arguments) = member.arguments() else {
            return Ok(());
        };

        let mut errors = Vec::new();
        args.array_apply(|idx, arg| {
            if idx >= arguments.len() {
                return false;
            }
            self.validate_instance(&arguments[idx].typei, arg, &format!(".{}", idx), &mut errors);
            true
        });

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors_to_object(&errors))
        }
    }

    /// Validate a method result against its declared return type.
    pub fn validate_return(&self, member: &IfMember, result: &Object) -> Result<(), Object> {
        match member.result() {
            Some(typei) => self.validate(typei, result),
            None => Ok(()),
        }
    }

    pub(crate) fn validate_instance(
        &self,
        typei: &TypeInstance,
        obj: &Object,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) -> bool {
        let unwound = typei.unwind();
        let Some(ty) = unwound.ty().cloned() else {
            // An unresolved generic variable cannot be checked.
            return true;
        };

        match obj.type_tag() {
            None => {
                // Untyped values can only satisfy builtin declarations.
                let canonical = unwound.canonical_form();
                let matches = canonical == "any"
                    || (canonical == "nullptr" && obj.is_null())
                    || kind_matches(canonical, obj);
                if !matches {
                    add_error(
                        errors,
                        path,
                        format!(
                            "Incompatible type {}, should be {}",
                            obj.kind().name(),
                            canonical
                        ),
                        None,
                    );
                    return false;
                }
            }
            Some(tag) => {
                let compatible = tag
                    .as_any()
                    .downcast_ref::<TypeInstance>()
                    .is_some_and(|actual| is_compatible(&unwound, actual));
                if !compatible {
                    add_error(
                        errors,
                        path,
                        format!(
                            "Incompatible type {}, should be {}",
                            tag.canonical_form(),
                            typei.canonical_form()
                        ),
                        None,
                    );
                    return false;
                }
            }
        }

        let valid = match ty.class {
            TypeClass::Struct => self.validate_struct(&unwound, obj, path, errors),
            TypeClass::Union => self.validate_union(&unwound, obj, path, errors),
            TypeClass::Enum => validate_enum(&unwound, obj, path, errors),
            TypeClass::Builtin => validate_builtin(&unwound, obj, path, errors),
            TypeClass::Typedef => true,
        };

        run_validators(&unwound, obj, path, errors) && valid
    }

    fn validate_struct(
        &self,
        typei: &TypeInstance,
        obj: &Object,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) -> bool {
        if obj.kind() != ObjectKind::Dictionary {
            add_error(
                errors,
                path,
                format!("Incompatible type {}, should be a structure", obj.kind()),
                None,
            );
            return false;
        }

        let ty = typei.ty().expect("struct instance has a type").clone();
        let mut valid = true;

        for member in ty.members.values() {
            let child_path = format!("{}.{}", path, member.name);
            match obj.dict_get(&member.name) {
                None => {
                    add_error(
                        errors,
                        &child_path,
                        format!("Member '{}' is missing", member.name),
                        None,
                    );
                    valid = false;
                }
                Some(value) => match self.member_type(typei, member) {
                    Ok(member_typei) => {
                        if !self.validate_instance(&member_typei, &value, &child_path, errors) {
                            valid = false;
                        }
                    }
                    Err(e) => {
                        add_error(
                            errors,
                            &child_path,
                            format!("Cannot instantiate member type: {}", e.message),
                            None,
                        );
                        valid = false;
                    }
                },
            }
        }

        let mut extras = Vec::new();
        obj.dict_apply(|key, _| {
            if !key.starts_with('%') && !ty.members.contains_key(key) {
                extras.push(key.to_string());
            }
            true
        });
        for key in extras {
            add_error(
                errors,
                &format!("{}.{}", path, key),
                format!("Unknown member '{}'", key),
                None,
            );
            valid = false;
        }

        valid
    }

    fn validate_union(
        &self,
        typei: &TypeInstance,
        obj: &Object,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) -> bool {
        let ty = typei.ty().expect("union instance has a type").clone();

        // Branches are matched against the value form: the `%value`
        // payload of an annotated instance, the bare value when the
        // annotation is the union itself, or the object as-is.
        let candidate = match crate::typed::get_value(obj) {
            Some(inner) => inner,
            None => {
                let own = crate::typed::get_typei(obj)
                    .and_then(|t| t.ty().map(|t| t.name.clone()))
                    == Some(ty.name.clone());
                if own {
                    obj.copy()
                } else {
                    obj.clone()
                }
            }
        };

        for member in ty.members.values() {
            if member.typei.is_none() {
                continue;
            }

            let Ok(branch) = self.member_type(typei, member) else {
                continue;
            };

            let mut scratch = Vec::new();
            if self.validate_instance(&branch, &candidate, path, &mut scratch) {
                return true;
            }
        }

        add_error(
            errors,
            path,
            "No union branch matches the value".to_string(),
            None,
        );
        false
    }
}

fn validate_enum(
    typei: &TypeInstance,
    obj: &Object,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> bool {
    let ty = typei.ty().expect("enum instance has a type");

    let tag = obj
        .as_str()
        .map(str::to_string)
        .or_else(|| {
            obj.dict_get(crate::typed::VALUE_FIELD)
                .and_then(|v| v.as_str().map(str::to_string))
        });

    match tag {
        Some(tag) if ty.members.contains_key(&tag) => true,
        Some(tag) => {
            add_error(errors, path, format!("Invalid enum value '{}'", tag), None);
            false
        }
        None => {
            add_error(errors, path, "Not a valid enum value".to_string(), None);
            false
        }
    }
}

/// Does a value's kind satisfy a builtin type name? The integer builtins
/// accept each other when the value fits the declared range (the wire
/// codecs do not preserve signedness below `i64::MAX`).
fn kind_matches(declared: &str, obj: &Object) -> bool {
    let kind = obj.kind().name();
    if kind == declared {
        return true;
    }

    match (declared, kind) {
        ("int64", "uint64") => obj.as_uint64().is_some_and(|v| v <= i64::MAX as u64),
        ("uint64", "int64") => obj.as_int64().is_some_and(|v| v >= 0),
        _ => false,
    }
}

fn validate_builtin(
    typei: &TypeInstance,
    obj: &Object,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> bool {
    let ty = typei.ty().expect("builtin instance has a type");

    if ty.name == "any" {
        return true;
    }

    let actual = if obj.is_null() {
        "nulltype"
    } else {
        obj.kind().name()
    };

    if actual != ty.name && !kind_matches(&ty.name, obj) {
        add_error(
            errors,
            path,
            format!("Incompatible type {}, should be {}", actual, ty.name),
            None,
        );
        return false;
    }

    true
}

fn run_validators(
    typei: &TypeInstance,
    obj: &Object,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> bool {
    let Some(constraints) = typei.constraints() else {
        return true;
    };

    let mut valid = true;
    for (name, value) in constraints.iter() {
        let Some(validator) = VALIDATORS.get(&(obj.kind().name(), name.as_str())) else {
            add_error(errors, path, format!("Validator {} not found", name), None);
            valid = false;
            continue;
        };

        if !validator(obj, value, path, errors) {
            valid = false;
        }
    }

    valid
}

type ValidatorFn = fn(&Object, &Object, &str, &mut Vec<ValidationError>) -> bool;

static VALIDATORS: LazyLock<HashMap<(&'static str, &'static str), ValidatorFn>> =
    LazyLock::new(|| {
        let mut table: HashMap<(&'static str, &'static str), ValidatorFn> = HashMap::new();
        table.insert(("int64", "min"), validate_min);
        table.insert(("int64", "max"), validate_max);
        table.insert(("uint64", "min"), validate_min);
        table.insert(("uint64", "max"), validate_max);
        table.insert(("string", "min-length"), validate_min_length);
        table.insert(("string", "max-length"), validate_max_length);
        table.insert(("string", "regex"), validate_regex);
        table.insert(("array", "min-length"), validate_min_length);
        table.insert(("array", "max-length"), validate_max_length);
        table
    });

fn numeric(obj: &Object) -> Option<i64> {
    obj.as_int64()
        .or_else(|| obj.as_uint64().and_then(|v| i64::try_from(v).ok()))
}

fn validate_min(
    obj: &Object,
    bound: &Object,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> bool {
    let (Some(value), Some(bound)) = (numeric(obj), numeric(bound)) else {
        return true;
    };
    if value < bound {
        add_error(errors, path, format!("Value {} below minimum {}", value, bound), None);
        return false;
    }
    true
}

fn validate_max(
    obj: &Object,
    bound: &Object,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> bool {
    let (Some(value), Some(bound)) = (numeric(obj), numeric(bound)) else {
        return true;
    };
    if value > bound {
        add_error(errors, path, format!("Value {} above maximum {}", value, bound), None);
        return false;
    }
    true
}

fn length(obj: &Object) -> usize {
    obj.as_str().map(str::len).unwrap_or_else(|| obj.len())
}

fn validate_min_length(
    obj: &Object,
    bound: &Object,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> bool {
    let Some(bound) = numeric(bound) else {
        return true;
    };
    if (length(obj) as i64) < bound {
        add_error(errors, path, format!("Length below minimum {}", bound), None);
        return false;
    }
    true
}

fn validate_max_length(
    obj: &Object,
    bound: &Object,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> bool {
    let Some(bound) = numeric(bound) else {
        return true;
    };
    if (length(obj) as i64) > bound {
        add_error(errors, path, format!("Length above maximum {}", bound), None);
        return false;
    }
    true
}

fn validate_regex(
    obj: &Object,
    pattern: &Object,
    path: &str,
    errors: &mut Vec<ValidationError>,
) -> bool {
    let (Some(value), Some(pattern)) = (obj.as_str(), pattern.as_str()) else {
        return true;
    };

    let Ok(re) = Regex::new(pattern) else {
        add_error(errors, path, format!("Invalid pattern '{}'", pattern), None);
        return false;
    };

    if !re.is_match(value) {
        add_error(
            errors,
            path,
            format!("Value does not match pattern '{}'", pattern),
            None,
        );
        return false;
    }
    true
}

/// Convert an aggregated validation failure into the wire error shape:
/// `EINVAL` with the error array as `extra`.
pub fn validation_error(errors: Object) -> RpcError {
    RpcError::invalid(format!("Validation failed: {} errors", errors.len())).with_extra(errors)
}

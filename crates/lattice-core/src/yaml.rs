//! yaml codec.
//!
//! Used mostly for IDL documents. Non-native kinds use the same sentinel
//! scheme as the json codec.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_yaml::{Mapping, Number, Value};

use crate::error::RpcError;
use crate::object::{Object, ObjectKind};

pub(crate) fn serialize(obj: &Object) -> Result<Bytes, RpcError> {
    let value = to_value(obj)?;
    let text = serde_yaml::to_string(&value)
        .map_err(|e| RpcError::io(format!("yaml encode failed: {}", e)))?;
    Ok(Bytes::from(text.into_bytes()))
}

pub(crate) fn deserialize(data: &[u8]) -> Result<Object, RpcError> {
    let value: Value = serde_yaml::from_slice(data)
        .map_err(|e| RpcError::invalid(format!("yaml decode failed: {}", e)))?;
    from_value(&value)
}

fn sentinel(key: &str, value: Value) -> Value {
    let mut map = Mapping::new();
    map.insert(Value::String(key.to_string()), value);
    Value::Mapping(map)
}

fn to_value(obj: &Object) -> Result<Value, RpcError> {
    Ok(match obj.kind() {
        ObjectKind::Null => Value::Null,
        ObjectKind::Bool => Value::Bool(obj.as_bool().unwrap_or_default()),
        ObjectKind::Uint64 => Value::Number(Number::from(obj.as_uint64().unwrap_or_default())),
        ObjectKind::Int64 => Value::Number(Number::from(obj.as_int64().unwrap_or_default())),
        ObjectKind::Double => Value::Number(Number::from(obj.as_double().unwrap_or_default())),
        ObjectKind::String => Value::String(obj.as_str().unwrap_or_default().to_string()),
        ObjectKind::Date => sentinel(
            "$date",
            Value::Number(Number::from(obj.as_date().unwrap_or_default())),
        ),
        ObjectKind::Binary => sentinel(
            "$binary",
            Value::String(BASE64.encode(obj.as_bytes().map(|b| b.as_ref()).unwrap_or_default())),
        ),
        ObjectKind::Fd => sentinel(
            "$fd",
            Value::Number(Number::from(obj.as_fd().unwrap_or(-1))),
        ),
        ObjectKind::Error => {
            let err = obj
                .as_error()
                .cloned()
                .unwrap_or_else(|| RpcError::io("Malformed error object"));
            let mut body = Mapping::new();
            body.insert(
                Value::String("code".into()),
                Value::Number(Number::from(err.code)),
            );
            body.insert(Value::String("message".into()), Value::String(err.message));
            if let Some(extra) = &err.extra {
                body.insert(Value::String("extra".into()), to_value(extra)?);
            }
            if let Some(frames) = &err.stacktrace {
                body.insert(Value::String("stacktrace".into()), to_value(frames)?);
            }
            sentinel("$error", Value::Mapping(body))
        }
        ObjectKind::Array => {
            let mut items = Vec::with_capacity(obj.len());
            let mut err = None;
            obj.array_apply(|_, item| match to_value(item) {
                Ok(v) => {
                    items.push(v);
                    true
                }
                Err(e) => {
                    err = Some(e);
                    false
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            Value::Sequence(items)
        }
        ObjectKind::Dictionary => {
            let mut map = Mapping::new();
            let mut err = None;
            obj.dict_apply(|key, item| match to_value(item) {
                Ok(v) => {
                    map.insert(Value::String(key.to_string()), v);
                    true
                }
                Err(e) => {
                    err = Some(e);
                    false
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
            Value::Mapping(map)
        }
    })
}

fn from_value(value: &Value) -> Result<Object, RpcError> {
    Ok(match value {
        Value::Null => Object::null(),
        Value::Bool(v) => Object::boolean(*v),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Object::int64(v)
            } else if let Some(v) = n.as_u64() {
                Object::uint64(v)
            } else {
                Object::double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => Object::string(s.clone()),
        Value::Sequence(items) => {
            let arr = Object::array();
            for item in items {
                arr.array_append(from_value(item)?);
            }
            arr
        }
        Value::Mapping(map) => {
            if map.len() == 1 {
                if let Some(decoded) = decode_sentinel(map)? {
                    return Ok(decoded);
                }
            }
            let dict = Object::dictionary();
            for (key, item) in map {
                let key = key
                    .as_str()
                    .ok_or_else(|| RpcError::invalid("Non-string mapping key"))?;
                dict.dict_set(key, from_value(item)?);
            }
            dict
        }
        Value::Tagged(tagged) => from_value(&tagged.value)?,
    })
}

fn decode_sentinel(map: &Mapping) -> Result<Option<Object>, RpcError> {
    let (key, value) = map.iter().next().expect("single-entry mapping");
    let Some(key) = key.as_str() else {
        return Ok(None);
    };

    Ok(match key {
        "$date" => Some(Object::date(
            value
                .as_i64()
                .ok_or_else(|| RpcError::invalid("Malformed $date value"))?,
        )),
        "$binary" => {
            let encoded = value
                .as_str()
                .ok_or_else(|| RpcError::invalid("Malformed $binary value"))?;
            let data = BASE64
                .decode(encoded)
                .map_err(|e| RpcError::invalid(format!("Malformed base64: {}", e)))?;
            Some(Object::binary(Bytes::from(data)))
        }
        "$fd" => Some(Object::fd_borrowed(
            value
                .as_i64()
                .ok_or_else(|| RpcError::invalid("Malformed $fd value"))? as i32,
        )),
        "$error" => {
            let body = value
                .as_mapping()
                .ok_or_else(|| RpcError::invalid("Malformed $error value"))?;
            let code = body.get("code").and_then(Value::as_i64).unwrap_or_default() as i32;
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let mut err = RpcError::new(code, message);
            err.extra = body.get("extra").map(from_value).transpose()?;
            err.stacktrace = body.get("stacktrace").map(from_value).transpose()?;
            Some(Object::error(err))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idl_like_document() {
        let doc = b"
meta:
  version: 1
  namespace: com.example
struct Point:
  members:
    x:
      type: int64
    y:
      type: int64
";
        let obj = deserialize(doc).unwrap();
        assert_eq!(obj.kind(), ObjectKind::Dictionary);
        let meta = obj.dict_get("meta").unwrap();
        assert_eq!(meta.dict_get("version"), Some(Object::int64(1)));
        assert!(obj.dict_contains("struct Point"));
    }

    #[test]
    fn test_yaml_roundtrip_nested() {
        let dict = Object::dictionary();
        dict.dict_set("blob", Object::binary_copy(b"abc"));
        dict.dict_set("list", Object::array_from([Object::double(0.25)]));
        let back = deserialize(&serialize(&dict).unwrap()).unwrap();
        assert_eq!(back, dict);
    }
}

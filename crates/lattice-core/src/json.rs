//! json codec.
//!
//! Kinds with no native JSON representation are encoded as single-key
//! dictionaries: `{"$date": secs}`, `{"$binary": base64}`, `{"$fd": n}`
//! and `{"$error": {...}}`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{json, Map, Number, Value};

use crate::error::RpcError;
use crate::object::{Object, ObjectKind};

pub(crate) fn serialize(obj: &Object) -> Result<Bytes, RpcError> {
    let value = to_value(obj)?;
    let data = serde_json::to_vec(&value)
        .map_err(|e| RpcError::io(format!("json encode failed: {}", e)))?;
    Ok(Bytes::from(data))
}

pub(crate) fn deserialize(data: &[u8]) -> Result<Object, RpcError> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| RpcError::invalid(format!("json decode failed: {}", e)))?;
    from_value(&value)
}

fn to_value(obj: &Object) -> Result<Value, RpcError> {
    Ok(match obj.kind() {
        ObjectKind::Null => Value::Null,
        ObjectKind::Bool => Value::Bool(obj.as_bool().unwrap_or_default()),
        ObjectKind::Uint64 => Value::Number(Number::from(obj.as_uint64().unwrap_or_default())),
        ObjectKind::Int64 => Value::Number(Number::from(obj.as_int64().unwrap_or_default())),
        ObjectKind::Double => {
            let v = obj.as_double().unwrap_or_default();
            Value::Number(
                Number::from_f64(v)
                    .ok_or_else(|| RpcError::invalid("Non-finite double not encodable"))?,
            )
        }
        ObjectKind::String => Value::String(obj.as_str().unwrap_or_default().to_string()),
        ObjectKind::Date => json!({ "$date": obj.as_date().unwrap_or_default() }),
        ObjectKind::Binary => {
            let encoded = BASE64.encode(obj.as_bytes().map(|b| b.as_ref()).unwrap_or_default());
            json!({ "$binary": encoded })
        }
        ObjectKind::Fd => json!({ "$fd": obj.as_fd().unwrap_or(-1) }),
        ObjectKind::Error => {
            let err = obj
                .as_error()
                .cloned()
                .unwrap_or_else(|| RpcError::io("Malformed error object"));
            let mut body = Map::new();
            body.insert("code".into(), Value::Number(Number::from(err.code)));
            body.insert("message".into(), Value::String(err.message));
            if let Some(extra) = &err.extra {
                body.insert("extra".into(), to_value(extra)?);
            }
            if let Some(frames) = &err.stacktrace {
                body.insert("stacktrace".into(), to_value(frames)?);
            }
            json!({ "$error": body })
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
            Value::Array(items)
        }
        ObjectKind::Dictionary => {
            let mut map = Map::new();
            let mut err = None;
            obj.dict_apply(|key, item| match to_value(item) {
                Ok(v) => {
                    map.insert(key.to_string(), v);
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
            Value::Object(map)
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
        Value::Array(items) => {
            let arr = Object::array();
            for item in items {
                arr.array_append(from_value(item)?);
            }
            arr
        }
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(decoded) = decode_sentinel(map)? {
                    return Ok(decoded);
                }
            }
            let dict = Object::dictionary();
            for (key, item) in map {
                dict.dict_set(key.clone(), from_value(item)?);
            }
            dict
        }
    })
}

fn decode_sentinel(map: &Map<String, Value>) -> Result<Option<Object>, RpcError> {
    let (key, value) = map.iter().next().expect("single-entry map");
    Ok(match key.as_str() {
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
                .as_object()
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
    fn test_date_sentinel() {
        let data = serialize(&Object::date(1500000000)).unwrap();
        assert_eq!(&data[..], br#"{"$date":1500000000}"#);
        assert_eq!(deserialize(&data).unwrap(), Object::date(1500000000));
    }

    #[test]
    fn test_binary_base64() {
        let obj = Object::binary_copy(b"\xde\xad\xbe\xef");
        let back = deserialize(&serialize(&obj).unwrap()).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn test_plain_dictionary_not_misread() {
        let dict = Object::dictionary();
        dict.dict_set("key", Object::string("value"));
        let back = deserialize(&serialize(&dict).unwrap()).unwrap();
        assert_eq!(back, dict);
    }
}

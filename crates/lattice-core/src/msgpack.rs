//! msgpack codec, bridged through `rmpv` dynamic values.
//!
//! Extension tags:
//! - `0x01`: date, seconds since epoch as little-endian uint32
//! - `0x02`: file descriptor number as little-endian uint32
//! - `0x04`: nested object (payload re-enters the codec)

use bytes::Bytes;
use rmpv::Value;
use tracing::debug;

use crate::error::RpcError;
use crate::object::{Object, ObjectKind};

const EXT_DATE: i8 = 0x01;
const EXT_FD: i8 = 0x02;
const EXT_NESTED: i8 = 0x04;

pub(crate) fn serialize(obj: &Object) -> Result<Bytes, RpcError> {
    let value = to_value(obj)?;
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value)
        .map_err(|e| RpcError::io(format!("msgpack encode failed: {}", e)))?;
    Ok(Bytes::from(buf))
}

pub(crate) fn deserialize(data: &[u8]) -> Result<Object, RpcError> {
    let mut cursor = data;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| RpcError::invalid(format!("msgpack decode failed: {}", e)))?;
    from_value(value)
}

fn to_value(obj: &Object) -> Result<Value, RpcError> {
    Ok(match obj.kind() {
        ObjectKind::Null => Value::Nil,
        ObjectKind::Bool => Value::Boolean(obj.as_bool().unwrap_or_default()),
        ObjectKind::Uint64 => Value::from(obj.as_uint64().unwrap_or_default()),
        ObjectKind::Int64 => Value::from(obj.as_int64().unwrap_or_default()),
        ObjectKind::Double => Value::F64(obj.as_double().unwrap_or_default()),
        ObjectKind::String => Value::from(obj.as_str().unwrap_or_default()),
        ObjectKind::Binary => {
            Value::Binary(obj.as_bytes().map(|b| b.to_vec()).unwrap_or_default())
        }
        ObjectKind::Date => {
            let secs = obj.as_date().unwrap_or_default();
            let secs = u32::try_from(secs).map_err(|_| {
                RpcError::out_of_range(format!("Date {} not encodable as uint32", secs))
            })?;
            Value::Ext(EXT_DATE, secs.to_le_bytes().to_vec())
        }
        ObjectKind::Fd => {
            let raw = obj.as_fd().unwrap_or(-1) as u32;
            Value::Ext(EXT_FD, raw.to_le_bytes().to_vec())
        }
        ObjectKind::Error => {
            // Nested object: the error dictionary re-enters the codec.
            let err = obj.as_error().cloned().unwrap_or_else(|| {
                RpcError::io("Malformed error object")
            });
            let dict = Object::dictionary();
            dict.dict_set("code", Object::int64(err.code as i64));
            dict.dict_set("message", Object::string(err.message));
            if let Some(extra) = err.extra {
                dict.dict_set("extra", extra);
            }
            if let Some(frames) = err.stacktrace {
                dict.dict_set("stacktrace", frames);
            }
            Value::Ext(EXT_NESTED, serialize(&dict)?.to_vec())
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
            let mut entries = Vec::with_capacity(obj.len());
            let mut err = None;
            obj.dict_apply(|key, item| match to_value(item) {
                Ok(v) => {
                    entries.push((Value::from(key), v));
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
            Value::Map(entries)
        }
    })
}

fn from_value(value: Value) -> Result<Object, RpcError> {
    Ok(match value {
        Value::Nil => Object::null(),
        Value::Boolean(v) => Object::boolean(v),
        // Integers that fit a signed 64-bit value decode as int64; only
        // the range above i64::MAX becomes uint64.
        Value::Integer(n) => match n.as_i64() {
            Some(v) => Object::int64(v),
            None => Object::uint64(
                n.as_u64()
                    .ok_or_else(|| RpcError::invalid("Unrepresentable integer"))?,
            ),
        },
        Value::F32(v) => Object::double(v as f64),
        Value::F64(v) => Object::double(v),
        Value::String(s) => Object::string(
            s.into_str()
                .ok_or_else(|| RpcError::invalid("Invalid UTF-8 in string"))?,
        ),
        Value::Binary(b) => Object::binary(Bytes::from(b)),
        Value::Array(items) => {
            let arr = Object::array();
            for item in items {
                arr.array_append(from_value(item)?);
            }
            arr
        }
        Value::Map(entries) => {
            let dict = Object::dictionary();
            for (key, item) in entries {
                let key = key
                    .as_str()
                    .ok_or_else(|| RpcError::invalid("Non-string dictionary key"))?
                    .to_string();
                dict.dict_set(key, from_value(item)?);
            }
            dict
        }
        Value::Ext(EXT_DATE, payload) => {
            let bytes: [u8; 4] = payload
                .as_slice()
                .try_into()
                .map_err(|_| RpcError::invalid("Malformed date extension"))?;
            Object::date(u32::from_le_bytes(bytes) as i64)
        }
        Value::Ext(EXT_FD, payload) => {
            let bytes: [u8; 4] = payload
                .as_slice()
                .try_into()
                .map_err(|_| RpcError::invalid("Malformed fd extension"))?;
            Object::fd_borrowed(u32::from_le_bytes(bytes) as i32)
        }
        Value::Ext(EXT_NESTED, payload) => {
            let nested = deserialize(&payload)?;
            if nested.kind() != ObjectKind::Dictionary {
                return Err(RpcError::invalid("Malformed nested object extension"));
            }
            let code = nested
                .dict_get("code")
                .and_then(|c| c.as_int64().or_else(|| c.as_uint64().map(|v| v as i64)))
                .unwrap_or_default() as i32;
            let message = nested
                .dict_get("message")
                .and_then(|m| m.as_str().map(str::to_string))
                .unwrap_or_default();
            let mut err = RpcError::new(code, message);
            err.extra = nested.dict_get("extra");
            err.stacktrace = nested.dict_get("stacktrace");
            Object::error(err)
        }
        Value::Ext(tag, _) => {
            debug!(tag, "unknown msgpack extension, decoding as null");
            Object::null()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_extension_layout() {
        let data = serialize(&Object::date(0x01020304)).unwrap();
        // fixext4: 0xd6, tag, payload little-endian
        assert_eq!(&data[..], &[0xd6, 0x01, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_unknown_extension_decodes_to_null() {
        // fixext1 with an unregistered tag
        let obj = deserialize(&[0xd4, 0x7f, 0x00]).unwrap();
        assert!(obj.is_null());
    }

    #[test]
    fn test_negative_int_survives() {
        let back = deserialize(&serialize(&Object::int64(-42)).unwrap()).unwrap();
        assert_eq!(back, Object::int64(-42));
    }

    #[test]
    fn test_small_uint_narrows_to_int() {
        // The wire format does not distinguish integer signedness below
        // i64::MAX; such values decode as int64.
        let back = deserialize(&serialize(&Object::uint64(42)).unwrap()).unwrap();
        assert_eq!(back, Object::int64(42));

        let big = Object::uint64(u64::MAX);
        assert_eq!(deserialize(&serialize(&big).unwrap()).unwrap(), big);
    }
}

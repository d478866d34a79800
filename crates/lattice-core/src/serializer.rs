//! Codec registry.
//!
//! Named codecs map an object tree to an octet buffer and back. Three
//! codecs are built in: `msgpack` (the wire default), `json` and `yaml`.

use bytes::Bytes;

use crate::error::RpcError;
use crate::object::Object;
use crate::{json, msgpack, yaml};

/// A named encoder/decoder pair.
pub struct Serializer {
    pub name: &'static str,
    serialize: fn(&Object) -> Result<Bytes, RpcError>,
    deserialize: fn(&[u8]) -> Result<Object, RpcError>,
}

impl Serializer {
    /// Encode an object tree to bytes.
    pub fn dump(&self, obj: &Object) -> Result<Bytes, RpcError> {
        (self.serialize)(obj)
    }

    /// Decode an object tree from bytes.
    pub fn load(&self, data: &[u8]) -> Result<Object, RpcError> {
        (self.deserialize)(data)
    }
}

static SERIALIZERS: &[Serializer] = &[
    Serializer {
        name: "msgpack",
        serialize: msgpack::serialize,
        deserialize: msgpack::deserialize,
    },
    Serializer {
        name: "json",
        serialize: json::serialize,
        deserialize: json::deserialize,
    },
    Serializer {
        name: "yaml",
        serialize: yaml::serialize,
        deserialize: yaml::deserialize,
    },
];

/// Look up a codec by name.
pub fn find_serializer(name: &str) -> Option<&'static Serializer> {
    SERIALIZERS.iter().find(|s| s.name == name)
}

/// Encode with a named codec. Fails with `ENOENT` for unknown names.
pub fn dump(codec: &str, obj: &Object) -> Result<Bytes, RpcError> {
    find_serializer(codec)
        .ok_or_else(|| RpcError::not_found(format!("Serializer '{}' not found", codec)))?
        .dump(obj)
}

/// Decode with a named codec. Fails with `ENOENT` for unknown names.
pub fn load(codec: &str, data: &[u8]) -> Result<Object, RpcError> {
    find_serializer(codec)
        .ok_or_else(|| RpcError::not_found(format!("Serializer '{}' not found", codec)))?
        .load(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;

    fn sample() -> Object {
        let dict = Object::dictionary();
        dict.dict_set("flag", Object::boolean(true));
        dict.dict_set("count", Object::uint64(u64::MAX));
        dict.dict_set("delta", Object::int64(-7));
        dict.dict_set("ratio", Object::double(0.5));
        dict.dict_set("name", Object::string("lattice"));
        dict.dict_set("when", Object::date(1500000000));
        dict.dict_set("blob", Object::binary_copy(b"\x00\x01\x02"));
        dict.dict_set(
            "items",
            Object::array_from([Object::null(), Object::string("x")]),
        );
        dict
    }

    #[test]
    fn test_roundtrip_all_codecs() {
        let obj = sample();
        for codec in ["msgpack", "json", "yaml"] {
            let data = dump(codec, &obj).unwrap();
            let back = load(codec, &data).unwrap();
            assert_eq!(back, obj, "codec {}", codec);
        }
    }

    #[test]
    fn test_empty_containers_roundtrip() {
        for codec in ["msgpack", "json", "yaml"] {
            for obj in [
                Object::array(),
                Object::dictionary(),
                Object::binary(Bytes::new()),
                Object::date(0),
                Object::date(i32::MAX as i64),
            ] {
                let back = load(codec, &dump(codec, &obj).unwrap()).unwrap();
                assert_eq!(back, obj, "codec {}", codec);
            }
        }
    }

    #[test]
    fn test_error_object_roundtrip() {
        let err = Object::error(
            RpcError::invalid("boom").with_extra(Object::array_from([Object::int64(1)])),
        );
        for codec in ["msgpack", "json", "yaml"] {
            let back = load(codec, &dump(codec, &err).unwrap()).unwrap();
            assert_eq!(back, err, "codec {}", codec);
        }
    }

    #[test]
    fn test_array_order_preserved() {
        let arr = Object::array_from((0..16).map(Object::int64));
        let back = load("msgpack", &dump("msgpack", &arr).unwrap()).unwrap();
        let mut order = Vec::new();
        back.array_apply(|_, v| {
            order.push(v.as_int64().unwrap());
            true
        });
        assert_eq!(order, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_unknown_codec() {
        assert_eq!(
            dump("cbor", &Object::null()).unwrap_err().code,
            code::ENOENT
        );
    }
}

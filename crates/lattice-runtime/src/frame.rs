//! Protocol frames.
//!
//! Frames are encoder-neutral: each one renders to an object dictionary
//! and is pushed through the connection's codec. Unknown header keys are
//! ignored on decode; unknown frame types are rejected.

use lattice_core::{Object, RpcError};

/// A single protocol frame. `Call`, `Continue` and `Abort` flow
/// client-to-server; `Response`, `Fragment`, `End` flow back; `Error` and
/// `Abort` may flow either way; `Event` and the subscription controls are
/// one-way notifications without a call id.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call {
        id: u64,
        path: String,
        interface: String,
        method: String,
        args: Object,
    },
    Response {
        id: u64,
        result: Object,
    },
    Fragment {
        id: u64,
        seqno: u64,
        value: Object,
    },
    End {
        id: u64,
        seqno: u64,
    },
    Error {
        id: u64,
        error: RpcError,
    },
    Continue {
        id: u64,
    },
    Abort {
        id: u64,
    },
    Event {
        path: String,
        interface: String,
        name: String,
        args: Object,
    },
    Subscribe {
        path: String,
        interface: String,
        name: String,
    },
    Unsubscribe {
        path: String,
        interface: String,
        name: String,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Call { .. } => "call",
            Frame::Response { .. } => "response",
            Frame::Fragment { .. } => "fragment",
            Frame::End { .. } => "end",
            Frame::Error { .. } => "error",
            Frame::Continue { .. } => "continue",
            Frame::Abort { .. } => "abort",
            Frame::Event { .. } => "event",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Unsubscribe { .. } => "unsubscribe",
        }
    }

    /// The call id this frame belongs to, when it has one.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Frame::Call { id, .. }
            | Frame::Response { id, .. }
            | Frame::Fragment { id, .. }
            | Frame::End { id, .. }
            | Frame::Error { id, .. }
            | Frame::Continue { id }
            | Frame::Abort { id } => Some(*id),
            _ => None,
        }
    }

    pub fn to_object(&self) -> Object {
        let obj = Object::dictionary();
        obj.dict_set("type", Object::string(self.kind()));

        match self {
            Frame::Call {
                id,
                path,
                interface,
                method,
                args,
            } => {
                obj.dict_set("id", Object::uint64(*id));
                obj.dict_set("path", Object::string(path.clone()));
                obj.dict_set("interface", Object::string(interface.clone()));
                obj.dict_set("method", Object::string(method.clone()));
                obj.dict_set("args", args.clone());
            }
            Frame::Response { id, result } => {
                obj.dict_set("id", Object::uint64(*id));
                obj.dict_set("result", result.clone());
            }
            Frame::Fragment { id, seqno, value } => {
                obj.dict_set("id", Object::uint64(*id));
                obj.dict_set("seqno", Object::uint64(*seqno));
                obj.dict_set("value", value.clone());
            }
            Frame::End { id, seqno } => {
                obj.dict_set("id", Object::uint64(*id));
                obj.dict_set("seqno", Object::uint64(*seqno));
            }
            Frame::Error { id, error } => {
                obj.dict_set("id", Object::uint64(*id));
                obj.dict_set("code", Object::int64(error.code as i64));
                obj.dict_set("message", Object::string(error.message.clone()));
                if let Some(extra) = &error.extra {
                    obj.dict_set("extra", extra.clone());
                }
            }
            Frame::Continue { id } | Frame::Abort { id } => {
                obj.dict_set("id", Object::uint64(*id));
            }
            Frame::Event {
                path,
                interface,
                name,
                args,
            } => {
                obj.dict_set("path", Object::string(path.clone()));
                obj.dict_set("interface", Object::string(interface.clone()));
                obj.dict_set("name", Object::string(name.clone()));
                obj.dict_set("args", args.clone());
            }
            Frame::Subscribe {
                path,
                interface,
                name,
            }
            | Frame::Unsubscribe {
                path,
                interface,
                name,
            } => {
                obj.dict_set("path", Object::string(path.clone()));
                obj.dict_set("interface", Object::string(interface.clone()));
                obj.dict_set("name", Object::string(name.clone()));
            }
        }

        obj
    }

    pub fn from_object(obj: &Object) -> Result<Frame, RpcError> {
        let kind = obj
            .dict_get("type")
            .and_then(|t| t.as_str().map(str::to_string))
            .ok_or_else(|| RpcError::invalid("Frame without a type"))?;

        let id = || -> Result<u64, RpcError> {
            obj.dict_get("id")
                .and_then(|v| v.as_uint64().or_else(|| v.as_int64().map(|i| i as u64)))
                .ok_or_else(|| RpcError::invalid(format!("Malformed {} frame: missing id", kind)))
        };
        let seqno = || -> Result<u64, RpcError> {
            obj.dict_get("seqno")
                .and_then(|v| v.as_uint64().or_else(|| v.as_int64().map(|i| i as u64)))
                .ok_or_else(|| {
                    RpcError::invalid(format!("Malformed {} frame: missing seqno", kind))
                })
        };
        let field = |name: &str| -> Result<String, RpcError> {
            obj.dict_get(name)
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| {
                    RpcError::invalid(format!("Malformed {} frame: missing {}", kind, name))
                })
        };
        let args = || obj.dict_get("args").unwrap_or_else(Object::array);

        Ok(match kind.as_str() {
            "call" => Frame::Call {
                id: id()?,
                path: field("path")?,
                interface: field("interface")?,
                method: field("method")?,
                args: args(),
            },
            "response" => Frame::Response {
                id: id()?,
                result: obj.dict_get("result").unwrap_or_else(Object::null),
            },
            "fragment" => Frame::Fragment {
                id: id()?,
                seqno: seqno()?,
                value: obj.dict_get("value").unwrap_or_else(Object::null),
            },
            "end" => Frame::End {
                id: id()?,
                seqno: seqno()?,
            },
            "error" => {
                let code = obj
                    .dict_get("code")
                    .and_then(|c| c.as_int64().or_else(|| c.as_uint64().map(|v| v as i64)))
                    .unwrap_or(lattice_core::code::EIO as i64) as i32;
                let mut error = RpcError::new(code, field("message").unwrap_or_default());
                error.extra = obj.dict_get("extra");
                Frame::Error { id: id()?, error }
            }
            "continue" => Frame::Continue { id: id()? },
            "abort" => Frame::Abort { id: id()? },
            "event" => Frame::Event {
                path: field("path")?,
                interface: field("interface")?,
                name: field("name")?,
                args: args(),
            },
            "subscribe" => Frame::Subscribe {
                path: field("path")?,
                interface: field("interface")?,
                name: field("name")?,
            },
            "unsubscribe" => Frame::Unsubscribe {
                path: field("path")?,
                interface: field("interface")?,
                name: field("name")?,
            },
            other => {
                return Err(RpcError::invalid(format!("Unknown frame type: {}", other)))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_frame_roundtrip() {
        let frame = Frame::Call {
            id: 7,
            path: "/".into(),
            interface: "com.example.Calc".into(),
            method: "add".into(),
            args: Object::array_from([Object::int64(2), Object::int64(3)]),
        };

        let decoded = Frame::from_object(&frame.to_object()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.call_id(), Some(7));
    }

    #[test]
    fn test_error_frame_carries_extra() {
        let frame = Frame::Error {
            id: 1,
            error: RpcError::invalid("Validation failed")
                .with_extra(Object::array_from([Object::string("detail")])),
        };

        let decoded = Frame::from_object(&frame.to_object()).unwrap();
        match decoded {
            Frame::Error { error, .. } => {
                assert_eq!(error.code, lattice_core::code::EINVAL);
                assert_eq!(error.extra.unwrap().len(), 1);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let obj = Object::dictionary();
        obj.dict_set("type", Object::string("nonsense"));
        assert!(Frame::from_object(&obj).is_err());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let frame = Frame::Continue { id: 3 };
        let obj = frame.to_object();
        obj.dict_set("future-field", Object::boolean(true));
        assert_eq!(Frame::from_object(&obj).unwrap(), frame);
    }

    #[test]
    fn test_wire_roundtrip_through_codec() {
        let frame = Frame::Fragment {
            id: 9,
            seqno: 2,
            value: Object::string("chunk"),
        };
        let data = lattice_core::dump("msgpack", &frame.to_object()).unwrap();
        let decoded = Frame::from_object(&lattice_core::load("msgpack", &data).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }
}

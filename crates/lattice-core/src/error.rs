//! Wire error model.
//!
//! Errors that cross a call boundary are `error` objects carrying a
//! POSIX-style code, a message and an optional `extra` payload. The same
//! type doubles as the crate-level `Error` so fallible operations can be
//! propagated with `?` and converted into a wire object at the boundary.

use crate::object::Object;

/// POSIX-style error codes used on the wire.
pub mod code {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const EBADF: i32 = 9;
    pub const EFAULT: i32 = 14;
    pub const EINVAL: i32 = 22;
    pub const ERANGE: i32 = 34;
    pub const ENOTSUP: i32 = 95;
    pub const ECONNRESET: i32 = 104;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
    pub const ECANCELED: i32 = 125;
}

/// An RPC error: the payload of an `error` object and the terminal state
/// of a failed call.
///
/// `extra` carries structured detail (for validation failures, the array
/// of per-path messages). `stacktrace` is only present when a producer
/// explicitly attaches one; it never crosses the wire otherwise.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    pub extra: Option<Object>,
    pub stacktrace: Option<Object>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            extra: None,
            stacktrace: None,
        }
    }

    /// Attach a structured payload to the error.
    pub fn with_extra(mut self, extra: Object) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn with_stacktrace(mut self, frames: Object) -> Self {
        self.stacktrace = Some(frames);
        self
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(code::EINVAL, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(code::ENOENT, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(code::ERANGE, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(code::ENOTSUP, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(code::EIO, message)
    }

    pub fn no_transport(message: impl Into<String>) -> Self {
        Self::new(code::ENXIO, message)
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(code::ECONNRESET, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(code::ETIMEDOUT, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(code::ECANCELED, message)
    }
}

impl PartialEq for RpcError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.message == other.message
            && self.extra == other.extra
            && self.stacktrace == other.stacktrace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::invalid("bad argument");
        assert_eq!(err.to_string(), "[22] bad argument");
        assert_eq!(err.code, code::EINVAL);
    }

    #[test]
    fn test_error_extra_roundtrip() {
        let extra = Object::string("detail");
        let err = RpcError::not_found("missing").with_extra(extra.clone());
        assert_eq!(err.extra, Some(extra));
    }
}

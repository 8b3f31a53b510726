//! Status channel threaded through every foreign call.

use std::fmt;
use std::sync::Arc;

use crate::api::EngineApi;
use crate::error::{Error, NativeError, Result};
use crate::ffi::{NativePtr, TF_Status};

/// Canonical status codes reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
    /// A code outside the canonical set.
    Other(i32),
}

impl Code {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            other => Code::Other(other),
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            Code::Ok => 0,
            Code::Cancelled => 1,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::DeadlineExceeded => 4,
            Code::NotFound => 5,
            Code::AlreadyExists => 6,
            Code::PermissionDenied => 7,
            Code::ResourceExhausted => 8,
            Code::FailedPrecondition => 9,
            Code::Aborted => 10,
            Code::OutOfRange => 11,
            Code::Unimplemented => 12,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::DataLoss => 15,
            Code::Unauthenticated => 16,
            Code::Other(raw) => raw,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Other(raw) => write!(f, "status code {raw}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Owns one native status object; released exactly once on drop.
///
/// The engine overwrites the status on every call it is passed to, so a single
/// instance can be reused across calls as long as it is inspected after each one.
pub struct Status {
    api: Arc<dyn EngineApi>,
    raw: NativePtr<TF_Status>,
}

impl Status {
    pub fn new(api: Arc<dyn EngineApi>) -> Result<Self> {
        let raw = NativePtr::new(api.new_status()).ok_or_else(|| Error::Native {
            call: "new_status",
            source: NativeError {
                code: Code::ResourceExhausted,
                message: "engine returned a null status".to_string(),
            },
        })?;
        Ok(Self { api, raw })
    }

    pub fn as_ptr(&self) -> *mut TF_Status {
        self.raw.as_ptr()
    }

    pub fn code(&self) -> Code {
        // SAFETY: `raw` was produced by `api.new_status` and is live until drop.
        Code::from_raw(unsafe { self.api.status_code(self.raw.as_ptr()) })
    }

    pub fn message(&self) -> String {
        // SAFETY: see `code`.
        unsafe { self.api.status_message(self.raw.as_ptr()) }
    }

    pub fn is_ok(&self) -> bool {
        self.code() == Code::Ok
    }

    /// Converts a failure code into an error carrying the native message.
    ///
    /// Callers that only want to inspect the outcome use [`Status::is_ok`] and
    /// [`Status::code`] instead.
    pub fn check(&self) -> std::result::Result<(), NativeError> {
        match self.code() {
            Code::Ok => Ok(()),
            code => Err(NativeError {
                code,
                message: self.message(),
            }),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("raw", &self.raw)
            .field("code", &self.code())
            .finish()
    }
}

impl Drop for Status {
    fn drop(&mut self) {
        // SAFETY: the status is owned by this wrapper and deleted once.
        unsafe { self.api.delete_status(self.raw.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::Code;

    #[test]
    fn codes_roundtrip_through_raw_values() {
        for raw in -1..20 {
            assert_eq!(Code::from_raw(raw).to_raw(), raw);
        }
        assert_eq!(Code::from_raw(3), Code::InvalidArgument);
        assert_eq!(Code::Other(42).to_string(), "status code 42");
    }
}

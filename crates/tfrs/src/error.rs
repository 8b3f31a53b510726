//! Error taxonomy surfaced by sessions and their collaborators.

use thiserror::Error;

use crate::dtype::DType;
use crate::status::Code;

/// Failure reported through a native status object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct NativeError {
    pub code: Code,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The foreign execution context could not be opened.
    #[error("failed to open session: {message}")]
    EngineOpen { message: String },

    /// The foreign run call returned a failure status.
    #[error("run failed ({code}): {message}")]
    Run { code: Code, message: String },

    #[error("feed for '{tensor}' has dtype {provided}, expected {expected}")]
    FeedType {
        tensor: String,
        expected: DType,
        provided: DType,
    },

    #[error("feed for '{tensor}' has shape {provided:?}, expected {expected}")]
    FeedShape {
        tensor: String,
        expected: String,
        provided: Vec<usize>,
    },

    /// A handle passed to a session belongs to a different graph.
    #[error("'{name}' does not belong to the session graph")]
    ForeignTensor { name: String },

    #[error("fetch '{name}' does not name an operation or tensor in the graph")]
    UnknownFetch { name: String },

    #[error("cannot decode output{} with unsupported dtype {dtype}", tensor_suffix(.tensor))]
    UnsupportedDtype {
        dtype: String,
        tensor: Option<String>,
    },

    /// The raw buffer does not match the layout implied by its dtype and shape.
    #[error("malformed output buffer{}: {reason}", tensor_suffix(.tensor))]
    Decode {
        reason: String,
        tensor: Option<String>,
    },

    #[error("session is closed")]
    UseAfterClose,

    #[error("failed to close session: {message}")]
    Close { message: String },

    #[error("invalid host array: {0}")]
    InvalidArray(String),

    /// Any other failed foreign call (graph import, option setup, allocation).
    #[error("native call {call} failed: {source}")]
    Native {
        call: &'static str,
        #[source]
        source: NativeError,
    },
}

impl Error {
    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        Error::Decode {
            reason: reason.into(),
            tensor: None,
        }
    }

    /// Attaches the producing tensor name to decode-time failures.
    pub(crate) fn for_tensor(self, name: &str) -> Self {
        match self {
            Error::UnsupportedDtype { dtype, tensor: None } => Error::UnsupportedDtype {
                dtype,
                tensor: Some(name.to_string()),
            },
            Error::Decode {
                reason,
                tensor: None,
            } => Error::Decode {
                reason,
                tensor: Some(name.to_string()),
            },
            other => other,
        }
    }
}

fn tensor_suffix(tensor: &Option<String>) -> String {
    match tensor {
        Some(name) => format!(" '{name}'"),
        None => String::new(),
    }
}

/// Convenience alias for results returned by session routines.
pub type Result<T> = std::result::Result<T, Error>;

//! Session runner for graph-based tensor engines.
//!
//! `tfrs` drives one execution step of an already-built graph through a native
//! engine reached across the C boundary. Callers describe what they want back
//! with a [`Fetch`], bind inputs with a [`FeedDict`], and receive host-owned
//! [`Array`] values shaped like the request.
//!
//! The engine itself is abstracted behind [`EngineApi`], a dispatch table
//! mirroring the TensorFlow C API. `tfrs-backend-capi` implements it on top of
//! `libtensorflow`; `tfrs-backend-tests` provides an in-process stub.

pub mod api;
pub mod array;
pub mod buffer;
pub mod decode;
pub mod dtype;
mod env;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod ffi;
pub mod graph;
pub mod session;
pub mod shape;
pub mod status;
pub mod strings;

pub use api::EngineApi;
pub use array::{Array, ArrayData, Element};
pub use buffer::{BufferView, Ownership, RawTensor};
pub use dtype::DType;
pub use error::{Error, NativeError, Result};
pub use feed::FeedDict;
pub use fetch::{Fetch, FetchPlan, FetchResult};
pub use graph::{Graph, Operation, Tensor};
pub use session::{Session, SessionConfig};
pub use shape::Dimension;
pub use status::{Code, Status};
pub use strings::StringLayout;

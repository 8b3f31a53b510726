//! Handles into an externally built graph.
//!
//! The graph's node and edge definitions live in the engine. This module only
//! keeps the native pointer, a process-unique id used to check that handles
//! belong to the graph a session is bound to, and a version counter that tells
//! sessions when new nodes must be pushed before the next run.

use std::ffi::CString;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::api::EngineApi;
use crate::dtype::{self, DType};
use crate::error::{Error, NativeError, Result};
use crate::ffi::{NativePtr, TF_Graph, TF_Operation, TF_Output};
use crate::shape::Dimension;
use crate::status::{Code, Status};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

pub struct Graph {
    api: Arc<dyn EngineApi>,
    raw: NativePtr<TF_Graph>,
    id: u64,
    version: AtomicU64,
    mutation: Mutex<()>,
}

impl Graph {
    /// Allocates an empty native graph.
    pub fn new(api: Arc<dyn EngineApi>) -> Result<Self> {
        let raw = api.new_graph();
        // SAFETY: a fresh graph from `new_graph` is owned by the caller.
        unsafe { Self::from_raw(api, raw) }.ok_or_else(|| Error::Native {
            call: "new_graph",
            source: NativeError {
                code: Code::ResourceExhausted,
                message: "engine returned a null graph".to_string(),
            },
        })
    }

    /// Adopts a graph built elsewhere; it is deleted when this wrapper drops.
    ///
    /// # Safety
    /// `raw` must come from `api`, be live, and not be deleted by anyone else.
    pub unsafe fn from_raw(api: Arc<dyn EngineApi>, raw: *mut TF_Graph) -> Option<Self> {
        Some(Self {
            api,
            raw: NativePtr::new(raw)?,
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            version: AtomicU64::new(0),
            mutation: Mutex::new(()),
        })
    }

    pub fn api(&self) -> &Arc<dyn EngineApi> {
        &self.api
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn as_ptr(&self) -> *mut TF_Graph {
        self.raw.as_ptr()
    }

    /// Monotonic counter bumped whenever nodes are added.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Records that nodes were added through the raw pointer by an external builder.
    pub fn mark_modified(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Imports a serialized graph definition.
    pub fn import_graph_def(&self, graph_def: &[u8]) -> Result<()> {
        self.import_graph_def_with_prefix(graph_def, "")
    }

    /// Imports a serialized graph definition, prefixing every imported node name.
    pub fn import_graph_def_with_prefix(&self, graph_def: &[u8], prefix: &str) -> Result<()> {
        let prefix = CString::new(prefix).map_err(|_| Error::Native {
            call: "import_graph_def",
            source: NativeError {
                code: Code::InvalidArgument,
                message: "import prefix contains a NUL byte".to_string(),
            },
        })?;
        let _guard = self.mutation.lock().expect("graph mutation lock poisoned");
        let status = Status::new(Arc::clone(&self.api))?;
        // SAFETY: graph and status are live; the slice outlives the call.
        unsafe {
            self.api
                .import_graph_def(self.raw.as_ptr(), graph_def, &prefix, status.as_ptr())
        };
        status.check().map_err(|source| Error::Native {
            call: "import_graph_def",
            source,
        })?;
        self.mark_modified();
        tracing::debug!(graph = self.id, version = self.version(), "imported graph def");
        Ok(())
    }

    /// Looks an operation up by name.
    pub fn operation_by_name(&self, name: &str) -> Option<Operation> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: graph is live; the name is NUL-terminated.
        let raw = unsafe { self.api.operation_by_name(self.raw.as_ptr(), &c_name) };
        // SAFETY: `raw` was just returned by the engine for this graph.
        unsafe { self.operation_from_raw(raw) }
    }

    /// Wraps an operation pointer obtained from an external graph builder.
    /// Returns `None` for null.
    ///
    /// # Safety
    /// `raw` must be null or an operation of this graph.
    pub unsafe fn operation_from_raw(&self, raw: *mut TF_Operation) -> Option<Operation> {
        let raw = NativePtr::new(raw)?;
        let name = self.api.operation_name(raw.as_ptr());
        let num_outputs = self.api.operation_num_outputs(raw.as_ptr());
        Some(Operation {
            graph_id: self.id,
            raw,
            name: Arc::from(name),
            num_outputs: usize::try_from(num_outputs).unwrap_or(0),
        })
    }

    /// Like [`Graph::operation_by_name`] but fails with `UnknownFetch`.
    pub fn operation(&self, name: &str) -> Result<Operation> {
        self.operation_by_name(name)
            .ok_or_else(|| Error::UnknownFetch {
                name: name.to_string(),
            })
    }

    /// Builds the handle for output `index` of `operation`, reading its declared
    /// dtype and shape from the engine.
    pub fn output(&self, operation: &Operation, index: usize) -> Result<Tensor> {
        if !self.owns(operation) {
            return Err(Error::ForeignTensor {
                name: operation.name().to_string(),
            });
        }
        if index >= operation.num_outputs() {
            return Err(Error::UnknownFetch {
                name: format!("{}:{index}", operation.name()),
            });
        }
        let native = TF_Output {
            oper: operation.as_ptr(),
            index: index as i32,
        };
        // SAFETY: the operation belongs to this live graph and `index` is in range.
        let tag = unsafe { self.api.output_type(native) };
        let dtype = DType::from_tag(tag).ok_or_else(|| Error::UnsupportedDtype {
            dtype: dtype::describe_tag(tag),
            tensor: Some(format!("{}:{index}", operation.name())),
        })?;
        let status = Status::new(Arc::clone(&self.api))?;
        // SAFETY: as above; status is live for the call.
        let dims = unsafe {
            self.api
                .output_shape(self.raw.as_ptr(), native, status.as_ptr())
        };
        status.check().map_err(|source| Error::Native {
            call: "output_shape",
            source,
        })?;
        Ok(Tensor {
            operation: operation.clone(),
            index,
            dtype,
            shape: dims.map(|dims| dims.into_iter().map(Dimension::from_native).collect()),
        })
    }

    /// Resolves `"op:N"` to output `N` of `op`; a bare `"op"` means output 0.
    ///
    /// This differs from [`Fetch::Name`](crate::fetch::Fetch::Name), where a bare
    /// `"op"` names the operation itself and runs it as a target.
    pub fn tensor_by_name(&self, name: &str) -> Result<Tensor> {
        let (op_name, index) = split_tensor_name(name).unwrap_or((name, 0));
        let operation = self.operation_by_name(op_name).ok_or_else(|| Error::UnknownFetch {
            name: name.to_string(),
        })?;
        self.output(&operation, index)
    }

    pub fn owns(&self, operation: &Operation) -> bool {
        operation.graph_id == self.id
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("raw", &self.raw)
            .field("version", &self.version())
            .finish()
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        // SAFETY: the graph is owned by this wrapper and deleted once.
        unsafe { self.api.delete_graph(self.raw.as_ptr()) };
    }
}

/// Splits `"name:3"` into `("name", 3)`; `None` when there is no numeric suffix.
pub fn split_tensor_name(name: &str) -> Option<(&str, usize)> {
    let (op, index) = name.rsplit_once(':')?;
    let index = index.parse().ok()?;
    (!op.is_empty()).then_some((op, index))
}

/// A computation node.
#[derive(Clone)]
pub struct Operation {
    graph_id: u64,
    raw: NativePtr<TF_Operation>,
    name: Arc<str>,
    num_outputs: usize,
}

impl Operation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }

    pub fn as_ptr(&self) -> *mut TF_Operation {
        self.raw.as_ptr()
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.graph_id == other.graph_id && self.raw == other.raw
    }
}

impl Eq for Operation {}

impl Hash for Operation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.graph_id.hash(state);
        self.raw.hash(state);
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({})", self.name)
    }
}

/// Symbolic handle for one operation output.
#[derive(Clone)]
pub struct Tensor {
    operation: Operation,
    index: usize,
    dtype: DType,
    shape: Option<Vec<Dimension>>,
}

impl Tensor {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Declared shape; `None` when even the rank is unknown.
    pub fn shape(&self) -> Option<&[Dimension]> {
        self.shape.as_deref()
    }

    /// Canonical `"op:index"` name.
    pub fn name(&self) -> String {
        format!("{}:{}", self.operation.name(), self.index)
    }

    pub fn to_native(&self) -> TF_Output {
        TF_Output {
            oper: self.operation.as_ptr(),
            index: self.index as i32,
        }
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.operation == other.operation && self.index == other.index
    }
}

impl Eq for Tensor {}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.operation.hash(state);
        self.index.hash(state);
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}, {})", self.name(), self.dtype)
    }
}

//! Dispatch table for the foreign engine.
//!
//! Each method corresponds to one entry point of the TensorFlow C API. The
//! session layer never calls the C library directly; it goes through an
//! `Arc<dyn EngineApi>`, which lets the dynamically loaded library and the
//! in-process stub used by tests share every line of marshaling code.
//!
//! Methods that receive native pointers are `unsafe`: callers must pass pointers
//! obtained from the same implementation that are still live. Slices stand in
//! for the C pointer/length pairs.

use std::ffi::CStr;
use std::os::raw::c_void;

use crate::ffi::{
    TF_Graph, TF_Operation, TF_Output, TF_Session, TF_SessionOptions, TF_Status, TF_Tensor,
};
use crate::strings::StringLayout;

pub trait EngineApi: Send + Sync {
    /// Human-readable engine identifier (e.g. `"libtensorflow"`).
    fn engine_name(&self) -> &str;

    /// Version string reported by the engine.
    fn version(&self) -> String;

    /// Byte layout the engine uses for string tensors.
    ///
    /// String feeds and outputs are rejected with `UnsupportedDtype` unless
    /// this is [`StringLayout::OffsetTable`].
    fn string_layout(&self) -> StringLayout {
        StringLayout::OffsetTable
    }

    fn new_status(&self) -> *mut TF_Status;
    unsafe fn delete_status(&self, status: *mut TF_Status);
    unsafe fn status_code(&self, status: *const TF_Status) -> i32;
    unsafe fn status_message(&self, status: *const TF_Status) -> String;

    fn new_session_options(&self) -> *mut TF_SessionOptions;
    unsafe fn delete_session_options(&self, options: *mut TF_SessionOptions);
    unsafe fn set_target(&self, options: *mut TF_SessionOptions, target: &CStr);
    unsafe fn set_config(
        &self,
        options: *mut TF_SessionOptions,
        proto: &[u8],
        status: *mut TF_Status,
    );

    fn new_graph(&self) -> *mut TF_Graph;
    unsafe fn delete_graph(&self, graph: *mut TF_Graph);
    /// Imports a serialized graph definition into `graph`, prefixing imported names.
    unsafe fn import_graph_def(
        &self,
        graph: *mut TF_Graph,
        graph_def: &[u8],
        prefix: &CStr,
        status: *mut TF_Status,
    );
    /// Returns null when no operation has that name.
    unsafe fn operation_by_name(&self, graph: *mut TF_Graph, name: &CStr) -> *mut TF_Operation;
    unsafe fn operation_name(&self, operation: *mut TF_Operation) -> String;
    unsafe fn operation_num_outputs(&self, operation: *mut TF_Operation) -> i32;
    unsafe fn output_type(&self, output: TF_Output) -> u32;
    /// Declared shape of a graph output; `None` when the rank is unknown and `-1`
    /// entries for unknown extents.
    unsafe fn output_shape(
        &self,
        graph: *mut TF_Graph,
        output: TF_Output,
        status: *mut TF_Status,
    ) -> Option<Vec<i64>>;

    unsafe fn new_session(
        &self,
        graph: *mut TF_Graph,
        options: *const TF_SessionOptions,
        status: *mut TF_Status,
    ) -> *mut TF_Session;

    /// Pushes graph nodes added since the session was opened.
    ///
    /// Engines whose sessions observe their graph directly keep the default no-op.
    unsafe fn extend_session(
        &self,
        _session: *mut TF_Session,
        _graph: *mut TF_Graph,
        _status: *mut TF_Status,
    ) {
    }

    /// Runs one step. `output_values` arrives filled with nulls; on success the
    /// engine stores one newly allocated tensor per slot, owned by the caller.
    #[allow(clippy::too_many_arguments)]
    unsafe fn session_run(
        &self,
        session: *mut TF_Session,
        inputs: &[TF_Output],
        input_values: &[*mut TF_Tensor],
        outputs: &[TF_Output],
        output_values: &mut [*mut TF_Tensor],
        targets: &[*const TF_Operation],
        status: *mut TF_Status,
    );
    unsafe fn close_session(&self, session: *mut TF_Session, status: *mut TF_Status);
    unsafe fn delete_session(&self, session: *mut TF_Session, status: *mut TF_Status);

    /// Allocates an uninitialized tensor of `byte_len` bytes.
    unsafe fn allocate_tensor(&self, dtype: u32, dims: &[i64], byte_len: usize) -> *mut TF_Tensor;
    unsafe fn delete_tensor(&self, tensor: *mut TF_Tensor);
    unsafe fn tensor_type(&self, tensor: *const TF_Tensor) -> u32;
    unsafe fn tensor_dims(&self, tensor: *const TF_Tensor) -> Vec<i64>;
    unsafe fn tensor_byte_size(&self, tensor: *const TF_Tensor) -> usize;
    unsafe fn tensor_data(&self, tensor: *const TF_Tensor) -> *mut c_void;
}

//! `EngineApi` over the TensorFlow C library, resolved at runtime.
//!
//! Nothing links against `libtensorflow` at build time. [`CApi::load`] opens the
//! library named by `TFRS_TENSORFLOW_LIB`, or the first platform default that
//! loads, and resolves every entry point up front so a missing symbol fails at
//! load rather than mid-run.

#![allow(non_camel_case_types)]

mod env;

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::{Arc, OnceLock};

use libloading::Library;
use thiserror::Error;
use tfrs::api::EngineApi;
use tfrs::ffi::{
    TF_Graph, TF_Operation, TF_Output, TF_Session, TF_SessionOptions, TF_Status, TF_Tensor,
};
use tfrs::StringLayout;

const DEFAULT_LIBRARIES: [&str; 4] = [
    "libtensorflow.so.2",
    "libtensorflow.so",
    "libtensorflow.dylib",
    "tensorflow.dll",
];

#[repr(C)]
pub struct TF_ImportGraphDefOptions {
    _private: [u8; 0],
}

/// Borrowed byte buffer handed to the C API; never freed by the library here.
#[repr(C)]
pub struct TF_Buffer {
    pub data: *const c_void,
    pub length: usize,
    pub data_deallocator: Option<unsafe extern "C" fn(data: *mut c_void, length: usize)>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to load {path}: {source}")]
    Library {
        path: String,
        #[source]
        source: libloading::Error,
    },
    #[error("no TensorFlow C library found (tried {})", .tried.join(", "))]
    NotFound { tried: Vec<String> },
    #[error("failed to resolve symbol {name}: {source}")]
    Symbol {
        name: String,
        #[source]
        source: libloading::Error,
    },
}

type TfNewStatusFn = unsafe extern "C" fn() -> *mut TF_Status;
type TfDeleteStatusFn = unsafe extern "C" fn(status: *mut TF_Status);
type TfGetCodeFn = unsafe extern "C" fn(status: *const TF_Status) -> c_int;
type TfMessageFn = unsafe extern "C" fn(status: *const TF_Status) -> *const c_char;
type TfNewSessionOptionsFn = unsafe extern "C" fn() -> *mut TF_SessionOptions;
type TfDeleteSessionOptionsFn = unsafe extern "C" fn(options: *mut TF_SessionOptions);
type TfSetTargetFn = unsafe extern "C" fn(options: *mut TF_SessionOptions, target: *const c_char);
type TfSetConfigFn = unsafe extern "C" fn(
    options: *mut TF_SessionOptions,
    proto: *const c_void,
    proto_len: usize,
    status: *mut TF_Status,
);
type TfNewGraphFn = unsafe extern "C" fn() -> *mut TF_Graph;
type TfDeleteGraphFn = unsafe extern "C" fn(graph: *mut TF_Graph);
type TfNewImportGraphDefOptionsFn = unsafe extern "C" fn() -> *mut TF_ImportGraphDefOptions;
type TfDeleteImportGraphDefOptionsFn = unsafe extern "C" fn(options: *mut TF_ImportGraphDefOptions);
type TfImportGraphDefOptionsSetPrefixFn =
    unsafe extern "C" fn(options: *mut TF_ImportGraphDefOptions, prefix: *const c_char);
type TfGraphImportGraphDefFn = unsafe extern "C" fn(
    graph: *mut TF_Graph,
    graph_def: *const TF_Buffer,
    options: *const TF_ImportGraphDefOptions,
    status: *mut TF_Status,
);
type TfGraphOperationByNameFn =
    unsafe extern "C" fn(graph: *mut TF_Graph, name: *const c_char) -> *mut TF_Operation;
type TfOperationNameFn = unsafe extern "C" fn(operation: *mut TF_Operation) -> *const c_char;
type TfOperationNumOutputsFn = unsafe extern "C" fn(operation: *mut TF_Operation) -> c_int;
type TfOperationOutputTypeFn = unsafe extern "C" fn(output: TF_Output) -> c_int;
type TfGraphGetTensorNumDimsFn =
    unsafe extern "C" fn(graph: *mut TF_Graph, output: TF_Output, status: *mut TF_Status) -> c_int;
type TfGraphGetTensorShapeFn = unsafe extern "C" fn(
    graph: *mut TF_Graph,
    output: TF_Output,
    dims: *mut i64,
    num_dims: c_int,
    status: *mut TF_Status,
);
type TfNewSessionFn = unsafe extern "C" fn(
    graph: *mut TF_Graph,
    options: *const TF_SessionOptions,
    status: *mut TF_Status,
) -> *mut TF_Session;
type TfCloseSessionFn = unsafe extern "C" fn(session: *mut TF_Session, status: *mut TF_Status);
type TfDeleteSessionFn = unsafe extern "C" fn(session: *mut TF_Session, status: *mut TF_Status);
type TfSessionRunFn = unsafe extern "C" fn(
    session: *mut TF_Session,
    run_options: *const TF_Buffer,
    inputs: *const TF_Output,
    input_values: *const *mut TF_Tensor,
    ninputs: c_int,
    outputs: *const TF_Output,
    output_values: *mut *mut TF_Tensor,
    noutputs: c_int,
    target_opers: *const *const TF_Operation,
    ntargets: c_int,
    run_metadata: *mut TF_Buffer,
    status: *mut TF_Status,
);
type TfAllocateTensorFn = unsafe extern "C" fn(
    dtype: c_int,
    dims: *const i64,
    num_dims: c_int,
    len: usize,
) -> *mut TF_Tensor;
type TfDeleteTensorFn = unsafe extern "C" fn(tensor: *mut TF_Tensor);
type TfTensorTypeFn = unsafe extern "C" fn(tensor: *const TF_Tensor) -> c_int;
type TfNumDimsFn = unsafe extern "C" fn(tensor: *const TF_Tensor) -> c_int;
type TfDimFn = unsafe extern "C" fn(tensor: *const TF_Tensor, index: c_int) -> i64;
type TfTensorByteSizeFn = unsafe extern "C" fn(tensor: *const TF_Tensor) -> usize;
type TfTensorDataFn = unsafe extern "C" fn(tensor: *const TF_Tensor) -> *mut c_void;
type TfVersionFn = unsafe extern "C" fn() -> *const c_char;

struct CApiFns {
    new_status: TfNewStatusFn,
    delete_status: TfDeleteStatusFn,
    get_code: TfGetCodeFn,
    message: TfMessageFn,
    new_session_options: TfNewSessionOptionsFn,
    delete_session_options: TfDeleteSessionOptionsFn,
    set_target: TfSetTargetFn,
    set_config: TfSetConfigFn,
    new_graph: TfNewGraphFn,
    delete_graph: TfDeleteGraphFn,
    new_import_options: TfNewImportGraphDefOptionsFn,
    delete_import_options: TfDeleteImportGraphDefOptionsFn,
    import_options_set_prefix: TfImportGraphDefOptionsSetPrefixFn,
    graph_import_graph_def: TfGraphImportGraphDefFn,
    graph_operation_by_name: TfGraphOperationByNameFn,
    operation_name: TfOperationNameFn,
    operation_num_outputs: TfOperationNumOutputsFn,
    operation_output_type: TfOperationOutputTypeFn,
    graph_get_tensor_num_dims: TfGraphGetTensorNumDimsFn,
    graph_get_tensor_shape: TfGraphGetTensorShapeFn,
    new_session: TfNewSessionFn,
    close_session: TfCloseSessionFn,
    delete_session: TfDeleteSessionFn,
    session_run: TfSessionRunFn,
    allocate_tensor: TfAllocateTensorFn,
    delete_tensor: TfDeleteTensorFn,
    tensor_type: TfTensorTypeFn,
    num_dims: TfNumDimsFn,
    dim: TfDimFn,
    tensor_byte_size: TfTensorByteSizeFn,
    tensor_data: TfTensorDataFn,
    version: TfVersionFn,
}

/// The TensorFlow C API behind the `EngineApi` dispatch table.
///
/// String tensors are marshaled only for engines older than 2.4, which use the
/// offset-table layout; newer engines report [`StringLayout::TString`] and
/// string feeds and outputs fail with `UnsupportedDtype`.
pub struct CApi {
    _lib: Library,
    fns: CApiFns,
    path: String,
    string_layout: StringLayout,
}

/// Picks the string tensor layout from a `TF_Version()` string.
///
/// Versions that cannot be parsed are treated as the newer layout.
pub fn string_layout_for_version(version: &str) -> StringLayout {
    let mut parts = version.trim().split('.').map(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<u32>().ok()
    });
    let major = parts.next().flatten();
    let minor = parts.next().flatten();
    match (major, minor) {
        (Some(major), _) if major < 2 => StringLayout::OffsetTable,
        (Some(2), Some(minor)) if minor < 4 => StringLayout::OffsetTable,
        _ => StringLayout::TString,
    }
}

static SHARED: OnceLock<Result<Arc<CApi>, String>> = OnceLock::new();

/// Whether a TensorFlow C library can be loaded in this process.
pub fn is_available() -> bool {
    shared().is_ok()
}

/// Process-wide engine, loaded on first use.
pub fn shared() -> Result<Arc<CApi>, String> {
    SHARED
        .get_or_init(|| match CApi::load() {
            Ok(api) => Ok(Arc::new(api)),
            Err(err) => Err(err.to_string()),
        })
        .clone()
}

impl CApi {
    /// Loads `TFRS_TENSORFLOW_LIB`, falling back to the platform default names.
    pub fn load() -> Result<Self, LoadError> {
        if let Some(path) = env::tensorflow_lib() {
            return Self::load_from(path);
        }
        for candidate in DEFAULT_LIBRARIES {
            match Self::load_from(candidate) {
                Ok(api) => return Ok(api),
                Err(LoadError::Library { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(LoadError::NotFound {
            tried: DEFAULT_LIBRARIES.iter().map(|name| name.to_string()).collect(),
        })
    }

    pub fn load_from(path: &str) -> Result<Self, LoadError> {
        // SAFETY: loading runs the library's initializers; no symbol is called yet.
        let lib = unsafe { Library::new(path) }.map_err(|source| LoadError::Library {
            path: path.to_string(),
            source,
        })?;
        let fns = CApiFns {
            new_status: load_symbol(&lib, b"TF_NewStatus\0")?,
            delete_status: load_symbol(&lib, b"TF_DeleteStatus\0")?,
            get_code: load_symbol(&lib, b"TF_GetCode\0")?,
            message: load_symbol(&lib, b"TF_Message\0")?,
            new_session_options: load_symbol(&lib, b"TF_NewSessionOptions\0")?,
            delete_session_options: load_symbol(&lib, b"TF_DeleteSessionOptions\0")?,
            set_target: load_symbol(&lib, b"TF_SetTarget\0")?,
            set_config: load_symbol(&lib, b"TF_SetConfig\0")?,
            new_graph: load_symbol(&lib, b"TF_NewGraph\0")?,
            delete_graph: load_symbol(&lib, b"TF_DeleteGraph\0")?,
            new_import_options: load_symbol(&lib, b"TF_NewImportGraphDefOptions\0")?,
            delete_import_options: load_symbol(&lib, b"TF_DeleteImportGraphDefOptions\0")?,
            import_options_set_prefix: load_symbol(&lib, b"TF_ImportGraphDefOptionsSetPrefix\0")?,
            graph_import_graph_def: load_symbol(&lib, b"TF_GraphImportGraphDef\0")?,
            graph_operation_by_name: load_symbol(&lib, b"TF_GraphOperationByName\0")?,
            operation_name: load_symbol(&lib, b"TF_OperationName\0")?,
            operation_num_outputs: load_symbol(&lib, b"TF_OperationNumOutputs\0")?,
            operation_output_type: load_symbol(&lib, b"TF_OperationOutputType\0")?,
            graph_get_tensor_num_dims: load_symbol(&lib, b"TF_GraphGetTensorNumDims\0")?,
            graph_get_tensor_shape: load_symbol(&lib, b"TF_GraphGetTensorShape\0")?,
            new_session: load_symbol(&lib, b"TF_NewSession\0")?,
            close_session: load_symbol(&lib, b"TF_CloseSession\0")?,
            delete_session: load_symbol(&lib, b"TF_DeleteSession\0")?,
            session_run: load_symbol(&lib, b"TF_SessionRun\0")?,
            allocate_tensor: load_symbol(&lib, b"TF_AllocateTensor\0")?,
            delete_tensor: load_symbol(&lib, b"TF_DeleteTensor\0")?,
            tensor_type: load_symbol(&lib, b"TF_TensorType\0")?,
            num_dims: load_symbol(&lib, b"TF_NumDims\0")?,
            dim: load_symbol(&lib, b"TF_Dim\0")?,
            tensor_byte_size: load_symbol(&lib, b"TF_TensorByteSize\0")?,
            tensor_data: load_symbol(&lib, b"TF_TensorData\0")?,
            version: load_symbol(&lib, b"TF_Version\0")?,
        };
        let mut api = Self {
            _lib: lib,
            fns,
            path: path.to_string(),
            string_layout: StringLayout::TString,
        };
        let version = api.version();
        api.string_layout = string_layout_for_version(&version);
        if !api.string_layout.is_supported() {
            tracing::warn!(%version, "string tensors are not supported with this engine");
        }
        tracing::debug!(
            path,
            %version,
            layout = ?api.string_layout,
            "loaded tensorflow c api"
        );
        Ok(api)
    }

    /// Path the library was loaded from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T, LoadError> {
    // SAFETY: the caller names the symbol with its C API signature.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|source| LoadError::Symbol {
        name: String::from_utf8_lossy(&name[..name.len() - 1]).into_owned(),
        source,
    })?;
    Ok(*sym)
}

/// Copies a C string owned by the library; null reads as empty.
unsafe fn owned_string(raw: *const c_char) -> String {
    if raw.is_null() {
        String::new()
    } else {
        CStr::from_ptr(raw).to_string_lossy().into_owned()
    }
}

fn null_or<T>(slice: &[T]) -> *const T {
    if slice.is_empty() {
        ptr::null()
    } else {
        slice.as_ptr()
    }
}

impl EngineApi for CApi {
    fn engine_name(&self) -> &str {
        "libtensorflow"
    }

    fn version(&self) -> String {
        // SAFETY: TF_Version returns a static string.
        unsafe { owned_string((self.fns.version)()) }
    }

    fn string_layout(&self) -> StringLayout {
        self.string_layout
    }

    fn new_status(&self) -> *mut TF_Status {
        // SAFETY: no preconditions.
        unsafe { (self.fns.new_status)() }
    }

    unsafe fn delete_status(&self, status: *mut TF_Status) {
        (self.fns.delete_status)(status)
    }

    unsafe fn status_code(&self, status: *const TF_Status) -> i32 {
        (self.fns.get_code)(status)
    }

    unsafe fn status_message(&self, status: *const TF_Status) -> String {
        owned_string((self.fns.message)(status))
    }

    fn new_session_options(&self) -> *mut TF_SessionOptions {
        // SAFETY: no preconditions.
        unsafe { (self.fns.new_session_options)() }
    }

    unsafe fn delete_session_options(&self, options: *mut TF_SessionOptions) {
        (self.fns.delete_session_options)(options)
    }

    unsafe fn set_target(&self, options: *mut TF_SessionOptions, target: &CStr) {
        (self.fns.set_target)(options, target.as_ptr())
    }

    unsafe fn set_config(
        &self,
        options: *mut TF_SessionOptions,
        proto: &[u8],
        status: *mut TF_Status,
    ) {
        (self.fns.set_config)(options, proto.as_ptr() as *const c_void, proto.len(), status)
    }

    fn new_graph(&self) -> *mut TF_Graph {
        // SAFETY: no preconditions.
        unsafe { (self.fns.new_graph)() }
    }

    unsafe fn delete_graph(&self, graph: *mut TF_Graph) {
        (self.fns.delete_graph)(graph)
    }

    unsafe fn import_graph_def(
        &self,
        graph: *mut TF_Graph,
        graph_def: &[u8],
        prefix: &CStr,
        status: *mut TF_Status,
    ) {
        let buffer = TF_Buffer {
            data: graph_def.as_ptr() as *const c_void,
            length: graph_def.len(),
            data_deallocator: None,
        };
        let options = (self.fns.new_import_options)();
        if !prefix.to_bytes().is_empty() {
            (self.fns.import_options_set_prefix)(options, prefix.as_ptr());
        }
        (self.fns.graph_import_graph_def)(graph, &buffer, options, status);
        (self.fns.delete_import_options)(options);
    }

    unsafe fn operation_by_name(&self, graph: *mut TF_Graph, name: &CStr) -> *mut TF_Operation {
        (self.fns.graph_operation_by_name)(graph, name.as_ptr())
    }

    unsafe fn operation_name(&self, operation: *mut TF_Operation) -> String {
        owned_string((self.fns.operation_name)(operation))
    }

    unsafe fn operation_num_outputs(&self, operation: *mut TF_Operation) -> i32 {
        (self.fns.operation_num_outputs)(operation)
    }

    unsafe fn output_type(&self, output: TF_Output) -> u32 {
        (self.fns.operation_output_type)(output) as u32
    }

    unsafe fn output_shape(
        &self,
        graph: *mut TF_Graph,
        output: TF_Output,
        status: *mut TF_Status,
    ) -> Option<Vec<i64>> {
        let rank = (self.fns.graph_get_tensor_num_dims)(graph, output, status);
        if rank < 0 || self.status_code(status) != 0 {
            return None;
        }
        let mut dims = vec![0i64; rank as usize];
        if rank > 0 {
            (self.fns.graph_get_tensor_shape)(graph, output, dims.as_mut_ptr(), rank, status);
        }
        Some(dims)
    }

    unsafe fn new_session(
        &self,
        graph: *mut TF_Graph,
        options: *const TF_SessionOptions,
        status: *mut TF_Status,
    ) -> *mut TF_Session {
        (self.fns.new_session)(graph, options, status)
    }

    unsafe fn session_run(
        &self,
        session: *mut TF_Session,
        inputs: &[TF_Output],
        input_values: &[*mut TF_Tensor],
        outputs: &[TF_Output],
        output_values: &mut [*mut TF_Tensor],
        targets: &[*const TF_Operation],
        status: *mut TF_Status,
    ) {
        let output_ptr = if output_values.is_empty() {
            ptr::null_mut()
        } else {
            output_values.as_mut_ptr()
        };
        (self.fns.session_run)(
            session,
            ptr::null(),
            null_or(inputs),
            null_or(input_values),
            inputs.len() as c_int,
            null_or(outputs),
            output_ptr,
            outputs.len() as c_int,
            null_or(targets),
            targets.len() as c_int,
            ptr::null_mut(),
            status,
        )
    }

    unsafe fn close_session(&self, session: *mut TF_Session, status: *mut TF_Status) {
        (self.fns.close_session)(session, status)
    }

    unsafe fn delete_session(&self, session: *mut TF_Session, status: *mut TF_Status) {
        (self.fns.delete_session)(session, status)
    }

    unsafe fn allocate_tensor(&self, dtype: u32, dims: &[i64], byte_len: usize) -> *mut TF_Tensor {
        (self.fns.allocate_tensor)(dtype as c_int, null_or(dims), dims.len() as c_int, byte_len)
    }

    unsafe fn delete_tensor(&self, tensor: *mut TF_Tensor) {
        (self.fns.delete_tensor)(tensor)
    }

    unsafe fn tensor_type(&self, tensor: *const TF_Tensor) -> u32 {
        (self.fns.tensor_type)(tensor) as u32
    }

    unsafe fn tensor_dims(&self, tensor: *const TF_Tensor) -> Vec<i64> {
        let rank = (self.fns.num_dims)(tensor).max(0);
        (0..rank).map(|index| (self.fns.dim)(tensor, index)).collect()
    }

    unsafe fn tensor_byte_size(&self, tensor: *const TF_Tensor) -> usize {
        (self.fns.tensor_byte_size)(tensor)
    }

    unsafe fn tensor_data(&self, tensor: *const TF_Tensor) -> *mut c_void {
        (self.fns.tensor_data)(tensor)
    }
}

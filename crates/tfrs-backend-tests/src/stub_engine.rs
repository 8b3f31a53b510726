use std::collections::HashSet;
use std::ffi::CStr;
use std::os::raw::c_void;
use std::sync::Mutex;

use tfrs::api::EngineApi;
use tfrs::ffi::{
    TF_Graph, TF_Operation, TF_Output, TF_Session, TF_SessionOptions, TF_Status, TF_Tensor,
};
use tfrs::{Array, Code, DType, StringLayout};

use crate::graph_def::{GraphDef, OutputDef};

/// One value handed to the engine by a run.
#[derive(Debug, Clone, PartialEq)]
pub struct FedValue {
    pub name: String,
    pub dtype: u32,
    pub dims: Vec<i64>,
    pub bytes: Vec<u8>,
}

/// Everything a single `session_run` call received.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub feeds: Vec<FedValue>,
    pub fetches: Vec<String>,
    pub targets: Vec<String>,
}

/// Buffer the stub hands back for one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct StubOutput {
    pub dtype: u32,
    pub dims: Vec<i64>,
    pub bytes: Vec<u8>,
}

impl StubOutput {
    pub fn array(array: &Array) -> Self {
        Self {
            dtype: array.dtype().tag(),
            dims: array.dims().iter().map(|d| *d as i64).collect(),
            bytes: array.to_native_bytes(),
        }
    }

    pub fn raw(dtype: u32, dims: &[i64], bytes: Vec<u8>) -> Self {
        Self {
            dtype,
            dims: dims.to_vec(),
            bytes,
        }
    }
}

/// What the scripted responder wants a run to produce.
pub enum RunResponse {
    Outputs(Vec<StubOutput>),
    /// Reports failure; any outputs are still allocated into the slots.
    Fail {
        message: String,
        outputs: Vec<StubOutput>,
    },
}

type Responder = Box<dyn FnMut(&RunRequest) -> RunResponse + Send>;

struct StubStatus {
    code: i32,
    message: String,
}

#[derive(Default)]
struct StubOptions {
    target: Option<String>,
    config: Option<Vec<u8>>,
}

struct StubOp {
    name: String,
    outputs: Vec<OutputDef>,
}

#[derive(Default)]
struct StubGraph {
    ops: Vec<Box<StubOp>>,
}

struct StubSession {
    closed: bool,
}

struct StubTensor {
    dtype: u32,
    dims: Vec<i64>,
    data: Vec<u8>,
}

/// Settings the engine observed when a session was opened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenedSession {
    pub target: Option<String>,
    pub config: Option<Vec<u8>>,
}

#[derive(Default)]
struct StubState {
    statuses: HashSet<usize>,
    options: HashSet<usize>,
    graphs: HashSet<usize>,
    sessions: HashSet<usize>,
    tensors: HashSet<usize>,
    double_frees: usize,
    tensor_allocations: usize,
    extend_calls: usize,
    close_calls: usize,
    runs: Vec<RunRequest>,
    opened: Vec<OpenedSession>,
    responder: Option<Responder>,
    open_failure: Option<String>,
    close_failure: Option<String>,
    string_layout: Option<StringLayout>,
}

/// Test-only engine implemented in Rust.
///
/// Every native object it hands out is tracked, so tests can assert that the
/// session layer releases each one exactly once. Runs are recorded and answered
/// by a scripted responder (zero-filled outputs by default).
#[derive(Default)]
pub struct StubEngine {
    state: Mutex<StubState>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().expect("stub engine mutex poisoned")
    }

    /// Installs the closure that answers every subsequent run.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&RunRequest) -> RunResponse + Send + 'static,
    {
        self.state().responder = Some(Box::new(responder));
    }

    /// Makes the next `new_session` fail with `message`.
    pub fn fail_next_open(&self, message: &str) {
        self.state().open_failure = Some(message.to_string());
    }

    /// Reports `layout` as the engine's string tensor layout.
    pub fn set_string_layout(&self, layout: StringLayout) {
        self.state().string_layout = Some(layout);
    }

    /// Makes every `close_session` report `message`.
    pub fn fail_close(&self, message: &str) {
        self.state().close_failure = Some(message.to_string());
    }

    pub fn runs(&self) -> Vec<RunRequest> {
        self.state().runs.clone()
    }

    pub fn run_count(&self) -> usize {
        self.state().runs.len()
    }

    pub fn last_run(&self) -> Option<RunRequest> {
        self.state().runs.last().cloned()
    }

    pub fn opened_sessions(&self) -> Vec<OpenedSession> {
        self.state().opened.clone()
    }

    pub fn extend_calls(&self) -> usize {
        self.state().extend_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    pub fn tensor_allocations(&self) -> usize {
        self.state().tensor_allocations
    }

    pub fn live_tensors(&self) -> usize {
        self.state().tensors.len()
    }

    pub fn live_statuses(&self) -> usize {
        self.state().statuses.len()
    }

    pub fn live_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn live_options(&self) -> usize {
        self.state().options.len()
    }

    pub fn live_graphs(&self) -> usize {
        self.state().graphs.len()
    }

    /// Deletes of objects that were not live (double frees or foreign pointers).
    pub fn double_frees(&self) -> usize {
        self.state().double_frees
    }

    fn set_status(status: *mut TF_Status, code: Code, message: &str) {
        // SAFETY: statuses handed to the stub were created by `new_status`.
        let status = unsafe { &mut *(status as *mut StubStatus) };
        status.code = code.to_raw();
        status.message = message.to_string();
    }

    fn output_name(output: &TF_Output) -> String {
        // SAFETY: operations handed to the stub live inside a stub graph.
        let op = unsafe { &*(output.oper as *const StubOp) };
        format!("{}:{}", op.name, output.index)
    }

    fn allocate(state: &mut StubState, tensor: StubTensor) -> *mut TF_Tensor {
        let raw = Box::into_raw(Box::new(tensor)) as *mut TF_Tensor;
        state.tensors.insert(raw as usize);
        state.tensor_allocations += 1;
        raw
    }

    fn zero_output(output: &TF_Output) -> StubOutput {
        // SAFETY: see `output_name`.
        let op = unsafe { &*(output.oper as *const StubOp) };
        let def = &op.outputs[output.index as usize];
        let dims: Vec<i64> = match &def.shape {
            Some(dims) => dims.iter().map(|d| if *d < 0 { 1 } else { *d }).collect(),
            None => Vec::new(),
        };
        let count = dims.iter().product::<i64>() as usize;
        let bytes = match DType::from_tag(def.dtype) {
            Some(DType::String) => tfrs::strings::encode(&vec![String::new(); count]),
            Some(dtype) => vec![0u8; count * dtype.size_in_bytes().unwrap_or(1)],
            None => vec![0u8; count],
        };
        StubOutput::raw(def.dtype, &dims, bytes)
    }
}

fn release(live: &mut HashSet<usize>, double_frees: &mut usize, raw: usize) -> bool {
    if live.remove(&raw) {
        true
    } else {
        *double_frees += 1;
        false
    }
}

impl EngineApi for StubEngine {
    fn engine_name(&self) -> &str {
        "stub"
    }

    fn version(&self) -> String {
        "stub-1".to_string()
    }

    fn string_layout(&self) -> StringLayout {
        self.state()
            .string_layout
            .unwrap_or(StringLayout::OffsetTable)
    }

    fn new_status(&self) -> *mut TF_Status {
        let raw = Box::into_raw(Box::new(StubStatus {
            code: 0,
            message: String::new(),
        })) as *mut TF_Status;
        self.state().statuses.insert(raw as usize);
        raw
    }

    unsafe fn delete_status(&self, status: *mut TF_Status) {
        let mut state = self.state();
        let state = &mut *state;
        if release(&mut state.statuses, &mut state.double_frees, status as usize) {
            drop(Box::from_raw(status as *mut StubStatus));
        }
    }

    unsafe fn status_code(&self, status: *const TF_Status) -> i32 {
        (*(status as *const StubStatus)).code
    }

    unsafe fn status_message(&self, status: *const TF_Status) -> String {
        (*(status as *const StubStatus)).message.clone()
    }

    fn new_session_options(&self) -> *mut TF_SessionOptions {
        let raw = Box::into_raw(Box::<StubOptions>::default()) as *mut TF_SessionOptions;
        self.state().options.insert(raw as usize);
        raw
    }

    unsafe fn delete_session_options(&self, options: *mut TF_SessionOptions) {
        let mut state = self.state();
        let state = &mut *state;
        if release(&mut state.options, &mut state.double_frees, options as usize) {
            drop(Box::from_raw(options as *mut StubOptions));
        }
    }

    unsafe fn set_target(&self, options: *mut TF_SessionOptions, target: &CStr) {
        (*(options as *mut StubOptions)).target = Some(target.to_string_lossy().into_owned());
    }

    unsafe fn set_config(
        &self,
        options: *mut TF_SessionOptions,
        proto: &[u8],
        status: *mut TF_Status,
    ) {
        if proto.first() == Some(&0xff) {
            Self::set_status(status, Code::InvalidArgument, "unparseable config proto");
            return;
        }
        (*(options as *mut StubOptions)).config = Some(proto.to_vec());
        Self::set_status(status, Code::Ok, "");
    }

    fn new_graph(&self) -> *mut TF_Graph {
        let raw = Box::into_raw(Box::<StubGraph>::default()) as *mut TF_Graph;
        self.state().graphs.insert(raw as usize);
        raw
    }

    unsafe fn delete_graph(&self, graph: *mut TF_Graph) {
        let mut state = self.state();
        let state = &mut *state;
        if release(&mut state.graphs, &mut state.double_frees, graph as usize) {
            drop(Box::from_raw(graph as *mut StubGraph));
        }
    }

    unsafe fn import_graph_def(
        &self,
        graph: *mut TF_Graph,
        graph_def: &[u8],
        prefix: &CStr,
        status: *mut TF_Status,
    ) {
        let def = match GraphDef::from_bytes(graph_def) {
            Ok(def) => def,
            Err(err) => {
                Self::set_status(status, Code::InvalidArgument, &format!("bad graph def: {err}"));
                return;
            }
        };
        let graph = &mut *(graph as *mut StubGraph);
        let prefix = prefix.to_string_lossy();
        for op in def.ops {
            let name = if prefix.is_empty() {
                op.name
            } else {
                format!("{prefix}/{}", op.name)
            };
            if graph.ops.iter().any(|existing| existing.name == name) {
                Self::set_status(
                    status,
                    Code::AlreadyExists,
                    &format!("operation '{name}' already exists"),
                );
                return;
            }
            graph.ops.push(Box::new(StubOp {
                name,
                outputs: op.outputs,
            }));
        }
        Self::set_status(status, Code::Ok, "");
    }

    unsafe fn operation_by_name(&self, graph: *mut TF_Graph, name: &CStr) -> *mut TF_Operation {
        let graph = &*(graph as *const StubGraph);
        let name = name.to_string_lossy();
        graph
            .ops
            .iter()
            .find(|op| op.name == name)
            .map(|op| op.as_ref() as *const StubOp as *mut TF_Operation)
            .unwrap_or(std::ptr::null_mut())
    }

    unsafe fn operation_name(&self, operation: *mut TF_Operation) -> String {
        (*(operation as *const StubOp)).name.clone()
    }

    unsafe fn operation_num_outputs(&self, operation: *mut TF_Operation) -> i32 {
        (*(operation as *const StubOp)).outputs.len() as i32
    }

    unsafe fn output_type(&self, output: TF_Output) -> u32 {
        let op = &*(output.oper as *const StubOp);
        op.outputs[output.index as usize].dtype
    }

    unsafe fn output_shape(
        &self,
        _graph: *mut TF_Graph,
        output: TF_Output,
        status: *mut TF_Status,
    ) -> Option<Vec<i64>> {
        let op = &*(output.oper as *const StubOp);
        Self::set_status(status, Code::Ok, "");
        op.outputs[output.index as usize].shape.clone()
    }

    unsafe fn new_session(
        &self,
        _graph: *mut TF_Graph,
        options: *const TF_SessionOptions,
        status: *mut TF_Status,
    ) -> *mut TF_Session {
        let mut state = self.state();
        if let Some(message) = state.open_failure.take() {
            Self::set_status(status, Code::Unavailable, &message);
            return std::ptr::null_mut();
        }
        let options = &*(options as *const StubOptions);
        state.opened.push(OpenedSession {
            target: options.target.clone(),
            config: options.config.clone(),
        });
        let raw = Box::into_raw(Box::new(StubSession { closed: false })) as *mut TF_Session;
        state.sessions.insert(raw as usize);
        Self::set_status(status, Code::Ok, "");
        raw
    }

    unsafe fn extend_session(
        &self,
        _session: *mut TF_Session,
        _graph: *mut TF_Graph,
        status: *mut TF_Status,
    ) {
        self.state().extend_calls += 1;
        Self::set_status(status, Code::Ok, "");
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
        let mut state = self.state();
        let open = state.sessions.contains(&(session as usize))
            && !(*(session as *const StubSession)).closed;
        if !open {
            Self::set_status(status, Code::FailedPrecondition, "session is not open");
            return;
        }

        let feeds = inputs
            .iter()
            .zip(input_values)
            .map(|(output, value)| {
                let tensor = &*(*value as *const StubTensor);
                FedValue {
                    name: Self::output_name(output),
                    dtype: tensor.dtype,
                    dims: tensor.dims.clone(),
                    bytes: tensor.data.clone(),
                }
            })
            .collect();
        let request = RunRequest {
            feeds,
            fetches: outputs.iter().map(Self::output_name).collect(),
            targets: targets
                .iter()
                .map(|op| (*(*op as *const StubOp)).name.clone())
                .collect(),
        };
        state.runs.push(request.clone());

        let response = match state.responder.as_mut() {
            Some(responder) => responder(&request),
            None => RunResponse::Outputs(outputs.iter().map(Self::zero_output).collect()),
        };
        let (produced, failure) = match response {
            RunResponse::Outputs(produced) => (produced, None),
            RunResponse::Fail { message, outputs } => (outputs, Some(message)),
        };
        if failure.is_none() && produced.len() != output_values.len() {
            Self::set_status(
                status,
                Code::Internal,
                &format!(
                    "responder produced {} outputs for {} fetches",
                    produced.len(),
                    output_values.len()
                ),
            );
            return;
        }
        for (slot, output) in output_values.iter_mut().zip(produced) {
            *slot = Self::allocate(
                &mut state,
                StubTensor {
                    dtype: output.dtype,
                    dims: output.dims,
                    data: output.bytes,
                },
            );
        }
        match failure {
            Some(message) => Self::set_status(status, Code::Internal, &message),
            None => Self::set_status(status, Code::Ok, ""),
        }
    }

    unsafe fn close_session(&self, session: *mut TF_Session, status: *mut TF_Status) {
        let mut state = self.state();
        state.close_calls += 1;
        if !state.sessions.contains(&(session as usize)) {
            Self::set_status(status, Code::FailedPrecondition, "unknown session");
            return;
        }
        (*(session as *mut StubSession)).closed = true;
        match state.close_failure.clone() {
            Some(message) => Self::set_status(status, Code::Internal, &message),
            None => Self::set_status(status, Code::Ok, ""),
        }
    }

    unsafe fn delete_session(&self, session: *mut TF_Session, status: *mut TF_Status) {
        let mut state = self.state();
        let state = &mut *state;
        if release(&mut state.sessions, &mut state.double_frees, session as usize) {
            drop(Box::from_raw(session as *mut StubSession));
            Self::set_status(status, Code::Ok, "");
        } else {
            Self::set_status(status, Code::FailedPrecondition, "session already deleted");
        }
    }

    unsafe fn allocate_tensor(&self, dtype: u32, dims: &[i64], byte_len: usize) -> *mut TF_Tensor {
        let mut state = self.state();
        Self::allocate(
            &mut state,
            StubTensor {
                dtype,
                dims: dims.to_vec(),
                data: vec![0u8; byte_len],
            },
        )
    }

    unsafe fn delete_tensor(&self, tensor: *mut TF_Tensor) {
        let mut state = self.state();
        let state = &mut *state;
        if release(&mut state.tensors, &mut state.double_frees, tensor as usize) {
            drop(Box::from_raw(tensor as *mut StubTensor));
        }
    }

    unsafe fn tensor_type(&self, tensor: *const TF_Tensor) -> u32 {
        (*(tensor as *const StubTensor)).dtype
    }

    unsafe fn tensor_dims(&self, tensor: *const TF_Tensor) -> Vec<i64> {
        (*(tensor as *const StubTensor)).dims.clone()
    }

    unsafe fn tensor_byte_size(&self, tensor: *const TF_Tensor) -> usize {
        (*(tensor as *const StubTensor)).data.len()
    }

    unsafe fn tensor_data(&self, tensor: *const TF_Tensor) -> *mut c_void {
        (*(tensor as *mut StubTensor)).data.as_mut_ptr() as *mut c_void
    }
}

//! Execution context bound to one graph.
//!
//! A [`Session`] opens the engine's execution context once, runs steps through
//! it, and releases it on [`Session::close`] or drop. `run` blocks the calling
//! thread for the whole foreign step; there is no cancellation or timeout at
//! this layer.
//!
//! Sessions are `Send + Sync`. The native context is a single mutable handle, so
//! concurrent `run` calls on one session are serialized by an internal lock;
//! separate sessions over the same graph run independently.

use std::ffi::CString;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::api::EngineApi;
use crate::array::Array;
use crate::buffer::RawTensor;
use crate::decode;
use crate::env;
use crate::error::{Error, Result};
use crate::feed::{FeedDict, ResolvedFeeds};
use crate::fetch::{Fetch, FetchPlan, FetchResult};
use crate::ffi::{NativePtr, TF_Operation, TF_Output, TF_Session, TF_SessionOptions, TF_Tensor};
use crate::graph::{Graph, Tensor};
use crate::status::Status;

/// Per-session settings forwarded to the engine at open time.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Engine address. `None` defers to `TFRS_TARGET`; an empty string always
    /// means in-process.
    pub target: Option<String>,
    /// Serialized engine configuration, passed through untouched.
    pub config: Option<Vec<u8>>,
}

impl SessionConfig {
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_config(mut self, config: Vec<u8>) -> Self {
        self.config = Some(config);
        self
    }

    fn resolved_target(&self) -> &str {
        match self.target.as_deref() {
            Some(target) => target,
            None => env::default_target().unwrap_or(""),
        }
    }
}

struct OpenSession {
    raw: NativePtr<TF_Session>,
    status: Status,
    /// Graph version last pushed to the engine.
    extended_version: u64,
}

pub struct Session {
    api: Arc<dyn EngineApi>,
    graph: Arc<Graph>,
    state: Mutex<Option<OpenSession>>,
}

impl Session {
    /// Opens an execution context for `graph`.
    pub fn new(graph: Arc<Graph>, config: SessionConfig) -> Result<Self> {
        let api = Arc::clone(graph.api());
        let status = Status::new(Arc::clone(&api))?;
        let raw = {
            let options = SessionOptions::new(&api, &config, &status)?;
            // SAFETY: graph, options and status are live for the call.
            unsafe { api.new_session(graph.as_ptr(), options.as_ptr(), status.as_ptr()) }
        };

        if let Err(err) = status.check() {
            if !raw.is_null() {
                // SAFETY: the engine handed us a session despite failing; delete it once.
                unsafe { api.delete_session(raw, status.as_ptr()) };
            }
            return Err(Error::EngineOpen {
                message: err.message,
            });
        }
        let raw = NativePtr::new(raw).ok_or_else(|| Error::EngineOpen {
            message: "engine returned a null session".to_string(),
        })?;

        tracing::debug!(
            engine = api.engine_name(),
            graph = graph.id(),
            address = config.resolved_target(),
            "opened session"
        );
        let extended_version = graph.version();
        Ok(Self {
            api,
            graph,
            state: Mutex::new(Some(OpenSession {
                raw,
                status,
                extended_version,
            })),
        })
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn api(&self) -> &Arc<dyn EngineApi> {
        &self.api
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .expect("session state poisoned")
            .is_none()
    }

    /// Runs one step and returns the fetched values shaped like `fetch`.
    ///
    /// Feeds and fetches are validated before the engine is called. Either every
    /// requested value is returned or the call fails as a whole; output buffers
    /// are released before this returns on every path.
    pub fn run(&self, fetch: impl Into<Fetch>, feeds: &FeedDict) -> Result<FetchResult> {
        let mut state = self.state.lock().expect("session state poisoned");
        let open = state.as_mut().ok_or(Error::UseAfterClose)?;

        let inputs = feeds.resolve(&self.graph, &self.api)?;
        let plan = FetchPlan::resolve(&self.graph, fetch.into())?;

        let _movers = self.update_with_movers(&inputs);
        self.extend_graph(open)?;

        let started = Instant::now();
        let outputs = self.call_run(open, &plan, &inputs)?;
        let elapsed = started.elapsed();
        if env::trace_runs() {
            tracing::info!(
                feeds = inputs.len(),
                fetches = plan.fetches().len(),
                targets = plan.targets().len(),
                ?elapsed,
                "session run"
            );
        } else {
            tracing::debug!(
                feeds = inputs.len(),
                fetches = plan.fetches().len(),
                targets = plan.targets().len(),
                ?elapsed,
                "session run"
            );
        }

        let values = outputs
            .into_iter()
            .zip(plan.fetches())
            .map(|(raw, tensor)| decode::decode(raw).map_err(|err| err.for_tensor(&tensor.name())))
            .collect::<Result<Vec<_>>>()?;
        plan.rebuild(values)
    }

    /// Fetches a single tensor.
    pub fn eval(&self, tensor: &Tensor, feeds: &FeedDict) -> Result<Array> {
        self.run(tensor, feeds)?
            .into_array()
            .ok_or_else(|| Error::Decode {
                reason: "single tensor fetch produced no value".to_string(),
                tensor: Some(tensor.name()),
            })
    }

    /// Releases the native context. Closing twice is a no-op.
    ///
    /// The session counts as closed even when the engine reports a failure, so
    /// no native object is ever released twice.
    pub fn close(&self) -> Result<()> {
        let open = self.state.lock().expect("session state poisoned").take();
        match open {
            Some(open) => self.release(open),
            None => Ok(()),
        }
    }

    fn release(&self, open: OpenSession) -> Result<()> {
        let OpenSession { raw, status, .. } = open;
        // SAFETY: the session was opened by `api` and is closed and deleted once here.
        unsafe { self.api.close_session(raw.as_ptr(), status.as_ptr()) };
        let closed = status.check();
        // SAFETY: as above.
        unsafe { self.api.delete_session(raw.as_ptr(), status.as_ptr()) };
        let deleted = status.check();
        drop(status);
        tracing::debug!(graph = self.graph.id(), "closed session");
        closed.and(deleted).map_err(|err| Error::Close {
            message: err.message,
        })
    }

    /// Hook for moving fed tensors to the device their placeholder expects.
    ///
    /// The returned buffers must stay alive until the run completes; no engine
    /// currently needs a move, so nothing is produced.
    fn update_with_movers(&self, _inputs: &ResolvedFeeds) -> Vec<RawTensor> {
        Vec::new()
    }

    /// Pushes nodes added to the graph since the last run.
    fn extend_graph(&self, open: &mut OpenSession) -> Result<()> {
        let version = self.graph.version();
        if version == open.extended_version {
            return Ok(());
        }
        // SAFETY: session, graph and status are live.
        unsafe {
            self.api
                .extend_session(open.raw.as_ptr(), self.graph.as_ptr(), open.status.as_ptr())
        };
        open.status.check().map_err(|err| Error::Run {
            code: err.code,
            message: err.message,
        })?;
        tracing::debug!(
            graph = self.graph.id(),
            from = open.extended_version,
            to = version,
            "extended session graph"
        );
        open.extended_version = version;
        Ok(())
    }

    fn call_run(
        &self,
        open: &OpenSession,
        plan: &FetchPlan,
        inputs: &ResolvedFeeds,
    ) -> Result<Vec<RawTensor>> {
        let input_values = inputs.value_ptrs();
        let outputs: Vec<TF_Output> = plan.fetches().iter().map(Tensor::to_native).collect();
        let targets: Vec<*const TF_Operation> = plan
            .targets()
            .iter()
            .map(|operation| operation.as_ptr() as *const TF_Operation)
            .collect();
        let mut output_values: Vec<*mut TF_Tensor> = vec![ptr::null_mut(); outputs.len()];

        // SAFETY: every pointer comes from this engine and stays live for the
        // call; `output_values` has one slot per requested output.
        unsafe {
            self.api.session_run(
                open.raw.as_ptr(),
                inputs.outputs(),
                &input_values,
                &outputs,
                &mut output_values,
                &targets,
                open.status.as_ptr(),
            )
        };

        // Adopt before checking the status so nothing leaks on failure.
        let adopted: Vec<Option<RawTensor>> = output_values
            .into_iter()
            // SAFETY: non-null outputs are fresh tensors handed to the caller.
            .map(|raw| unsafe { RawTensor::owned(Arc::clone(&self.api), raw) })
            .collect();

        if let Err(err) = open.status.check() {
            return Err(Error::Run {
                code: err.code,
                message: err.message,
            });
        }

        adopted
            .into_iter()
            .zip(plan.fetches())
            .map(|(tensor, fetch)| {
                tensor.ok_or_else(|| Error::Decode {
                    reason: "engine produced no buffer".to_string(),
                    tensor: Some(fetch.name()),
                })
            })
            .collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let open = match self.state.get_mut() {
            Ok(state) => state.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(open) = open {
            if let Err(err) = self.release(open) {
                tracing::warn!(error = %err, "session close failed during drop");
            }
        }
    }
}

/// Native session options, deleted as soon as the session is open.
struct SessionOptions<'a> {
    api: &'a Arc<dyn EngineApi>,
    raw: NativePtr<TF_SessionOptions>,
}

impl<'a> SessionOptions<'a> {
    fn new(api: &'a Arc<dyn EngineApi>, config: &SessionConfig, status: &Status) -> Result<Self> {
        let raw = NativePtr::new(api.new_session_options()).ok_or_else(|| Error::EngineOpen {
            message: "engine returned null session options".to_string(),
        })?;
        let options = Self { api, raw };

        let target = config.resolved_target();
        if !target.is_empty() {
            let target = CString::new(target).map_err(|_| Error::EngineOpen {
                message: "session target contains a NUL byte".to_string(),
            })?;
            // SAFETY: options are live; the target is NUL-terminated.
            unsafe { api.set_target(options.as_ptr(), &target) };
        }
        if let Some(proto) = config.config.as_deref() {
            // SAFETY: options and status are live; the slice outlives the call.
            unsafe { api.set_config(options.as_ptr(), proto, status.as_ptr()) };
            status.check().map_err(|err| Error::EngineOpen {
                message: err.message,
            })?;
        }
        Ok(options)
    }

    fn as_ptr(&self) -> *mut TF_SessionOptions {
        self.raw.as_ptr()
    }
}

impl Drop for SessionOptions<'_> {
    fn drop(&mut self) {
        // SAFETY: options are owned by this guard and deleted once.
        unsafe { self.api.delete_session_options(self.raw.as_ptr()) };
    }
}

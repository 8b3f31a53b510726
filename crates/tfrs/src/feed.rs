//! Feed bindings and their conversion into native input buffers.

use std::sync::Arc;

use crate::api::EngineApi;
use crate::array::Array;
use crate::buffer::RawTensor;
use crate::error::{Error, Result};
use crate::ffi::{TF_Output, TF_Tensor};
use crate::graph::{Graph, Tensor};
use crate::shape;

/// Values bound to graph tensors for one run.
///
/// Each tensor appears at most once: inserting a key that is already present
/// replaces its value (last write wins) and keeps its original position.
#[derive(Debug, Clone, Default)]
pub struct FeedDict {
    entries: Vec<(Tensor, Array)>,
}

impl FeedDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `value` to `tensor`, returning the value it replaced.
    pub fn insert(&mut self, tensor: Tensor, value: Array) -> Option<Array> {
        match self.entries.iter_mut().find(|(key, _)| *key == tensor) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((tensor, value));
                None
            }
        }
    }

    /// Builder form of [`FeedDict::insert`].
    pub fn with(mut self, tensor: &Tensor, value: Array) -> Self {
        self.insert(tensor.clone(), value);
        self
    }

    pub fn get(&self, tensor: &Tensor) -> Option<&Array> {
        self.entries
            .iter()
            .find(|(key, _)| key == tensor)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tensor, &Array)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }

    /// Checks every binding against `graph` without touching the engine.
    pub fn validate(&self, graph: &Graph) -> Result<()> {
        for (tensor, value) in &self.entries {
            if !graph.owns(tensor.operation()) {
                return Err(Error::ForeignTensor {
                    name: tensor.name(),
                });
            }
            if value.dtype() != tensor.dtype() {
                return Err(Error::FeedType {
                    tensor: tensor.name(),
                    expected: tensor.dtype(),
                    provided: value.dtype(),
                });
            }
            if !shape::is_compatible(tensor.shape(), value.dims()) {
                return Err(Error::FeedShape {
                    tensor: tensor.name(),
                    expected: shape::display_declared(tensor.shape()),
                    provided: value.dims().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Validates the bindings and copies every value into an owned native buffer.
    pub fn resolve(&self, graph: &Graph, api: &Arc<dyn EngineApi>) -> Result<ResolvedFeeds> {
        self.validate(graph)?;
        let mut resolved = ResolvedFeeds {
            outputs: Vec::with_capacity(self.entries.len()),
            values: Vec::with_capacity(self.entries.len()),
        };
        for (tensor, value) in &self.entries {
            resolved.outputs.push(tensor.to_native());
            let buffer = RawTensor::from_array(Arc::clone(api), value)
                .map_err(|err| err.for_tensor(&tensor.name()))?;
            resolved.values.push(buffer);
        }
        Ok(resolved)
    }
}

/// Parallel lists of native outputs and the buffers fed into them.
///
/// The buffers stay owned here; the engine only reads them during the call.
#[derive(Debug)]
pub struct ResolvedFeeds {
    outputs: Vec<TF_Output>,
    values: Vec<RawTensor>,
}

impl ResolvedFeeds {
    pub fn outputs(&self) -> &[TF_Output] {
        &self.outputs
    }

    pub fn value_ptrs(&self) -> Vec<*mut TF_Tensor> {
        self.values.iter().map(RawTensor::as_ptr).collect()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

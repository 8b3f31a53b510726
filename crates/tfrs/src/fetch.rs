//! Fetch specifications: flattening for the foreign call and rebuilding results.

use std::collections::{BTreeMap, HashMap};

use crate::array::Array;
use crate::error::{Error, Result};
use crate::graph::{split_tensor_name, Graph, Operation, Tensor};

/// What a caller wants back from a run.
#[derive(Debug, Clone)]
pub enum Fetch {
    /// Value of one graph output.
    Tensor(Tensor),
    /// Run an operation for its side effect; its slot comes back empty.
    Operation(Operation),
    /// `"op:N"` names a tensor, a bare `"op"` names an operation.
    ///
    /// [`Graph::tensor_by_name`](crate::graph::Graph::tensor_by_name) reads a bare
    /// `"op"` as output 0 instead; spell out `"op:0"` to fetch that value here.
    Name(String),
    List(Vec<Fetch>),
    /// Keys are visited in sorted order when flattening.
    Dict(BTreeMap<String, Fetch>),
}

impl Fetch {
    pub fn name(name: impl Into<String>) -> Self {
        Fetch::Name(name.into())
    }

    pub fn list<I, F>(items: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Fetch>,
    {
        Fetch::List(items.into_iter().map(Into::into).collect())
    }

    pub fn dict<I, K, F>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, F)>,
        K: Into<String>,
        F: Into<Fetch>,
    {
        Fetch::Dict(
            items
                .into_iter()
                .map(|(key, fetch)| (key.into(), fetch.into()))
                .collect(),
        )
    }
}

impl From<Tensor> for Fetch {
    fn from(tensor: Tensor) -> Self {
        Fetch::Tensor(tensor)
    }
}

impl From<&Tensor> for Fetch {
    fn from(tensor: &Tensor) -> Self {
        Fetch::Tensor(tensor.clone())
    }
}

impl From<Operation> for Fetch {
    fn from(operation: Operation) -> Self {
        Fetch::Operation(operation)
    }
}

impl From<&Operation> for Fetch {
    fn from(operation: &Operation) -> Self {
        Fetch::Operation(operation.clone())
    }
}

impl From<&str> for Fetch {
    fn from(name: &str) -> Self {
        Fetch::Name(name.to_string())
    }
}

impl From<String> for Fetch {
    fn from(name: String) -> Self {
        Fetch::Name(name)
    }
}

impl<F: Into<Fetch>> From<Vec<F>> for Fetch {
    fn from(items: Vec<F>) -> Self {
        Fetch::list(items)
    }
}

/// Result of a run, shaped like the [`Fetch`] that requested it.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Value(Array),
    /// Slot of an operation fetch.
    Empty,
    List(Vec<FetchResult>),
    Dict(BTreeMap<String, FetchResult>),
}

impl FetchResult {
    pub fn as_array(&self) -> Option<&Array> {
        match self {
            FetchResult::Value(array) => Some(array),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Array> {
        match self {
            FetchResult::Value(array) => Some(array),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<FetchResult>> {
        match self {
            FetchResult::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<BTreeMap<String, FetchResult>> {
        match self {
            FetchResult::Dict(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FetchResult::Empty)
    }

    /// Collects every array in pre-order.
    pub fn flatten(self) -> Vec<Array> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(self, out: &mut Vec<Array>) {
        match self {
            FetchResult::Value(array) => out.push(array),
            FetchResult::Empty => {}
            FetchResult::List(items) => items.into_iter().for_each(|item| item.flatten_into(out)),
            FetchResult::Dict(items) => items
                .into_values()
                .for_each(|item| item.flatten_into(out)),
        }
    }
}

/// Reconstruction tree mirroring the original fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Value(usize),
    Target,
    List(Vec<Slot>),
    Dict(Vec<(String, Slot)>),
}

/// Flat fetch and target lists plus the plan to rebuild the requested shape.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    fetches: Vec<Tensor>,
    targets: Vec<Operation>,
    root: Slot,
}

impl FetchPlan {
    /// Flattens `fetch` against `graph`.
    ///
    /// Tensors are listed in pre-order of first appearance; a tensor requested
    /// twice occupies one fetch slot and is cloned into both result positions.
    /// Targets are de-duplicated the same way.
    pub fn resolve(graph: &Graph, fetch: Fetch) -> Result<Self> {
        let mut builder = PlanBuilder {
            graph,
            fetches: Vec::new(),
            fetch_slots: HashMap::new(),
            targets: Vec::new(),
        };
        let root = builder.visit(fetch)?;
        Ok(Self {
            fetches: builder.fetches,
            targets: builder.targets,
            root,
        })
    }

    pub fn fetches(&self) -> &[Tensor] {
        &self.fetches
    }

    pub fn targets(&self) -> &[Operation] {
        &self.targets
    }

    /// Rebuilds the requested shape from values decoded in `fetches()` order.
    pub fn rebuild(&self, values: Vec<Array>) -> Result<FetchResult> {
        if values.len() != self.fetches.len() {
            return Err(Error::Decode {
                reason: format!(
                    "expected {} fetched values, got {}",
                    self.fetches.len(),
                    values.len()
                ),
                tensor: None,
            });
        }
        let mut values: Vec<Option<Array>> = values.into_iter().map(Some).collect();
        let mut remaining = vec![0usize; values.len()];
        count_uses(&self.root, &mut remaining);
        Ok(build(&self.root, &mut values, &mut remaining))
    }
}

struct PlanBuilder<'g> {
    graph: &'g Graph,
    fetches: Vec<Tensor>,
    fetch_slots: HashMap<Tensor, usize>,
    targets: Vec<Operation>,
}

impl PlanBuilder<'_> {
    fn visit(&mut self, fetch: Fetch) -> Result<Slot> {
        match fetch {
            Fetch::Tensor(tensor) => self.push_tensor(tensor),
            Fetch::Operation(operation) => self.push_target(operation),
            Fetch::Name(name) => match split_tensor_name(&name) {
                Some(_) => {
                    let tensor = self.graph.tensor_by_name(&name)?;
                    self.push_tensor(tensor)
                }
                None => {
                    let operation = self.graph.operation(&name)?;
                    self.push_target(operation)
                }
            },
            Fetch::List(items) => items
                .into_iter()
                .map(|item| self.visit(item))
                .collect::<Result<Vec<_>>>()
                .map(Slot::List),
            Fetch::Dict(items) => items
                .into_iter()
                .map(|(key, item)| Ok((key, self.visit(item)?)))
                .collect::<Result<Vec<_>>>()
                .map(Slot::Dict),
        }
    }

    fn push_tensor(&mut self, tensor: Tensor) -> Result<Slot> {
        if !self.graph.owns(tensor.operation()) {
            return Err(Error::ForeignTensor {
                name: tensor.name(),
            });
        }
        if let Some(index) = self.fetch_slots.get(&tensor) {
            return Ok(Slot::Value(*index));
        }
        let index = self.fetches.len();
        self.fetch_slots.insert(tensor.clone(), index);
        self.fetches.push(tensor);
        Ok(Slot::Value(index))
    }

    fn push_target(&mut self, operation: Operation) -> Result<Slot> {
        if !self.graph.owns(&operation) {
            return Err(Error::ForeignTensor {
                name: operation.name().to_string(),
            });
        }
        if !self.targets.contains(&operation) {
            self.targets.push(operation);
        }
        Ok(Slot::Target)
    }
}

fn count_uses(slot: &Slot, uses: &mut [usize]) {
    match slot {
        Slot::Value(index) => uses[*index] += 1,
        Slot::Target => {}
        Slot::List(items) => items.iter().for_each(|item| count_uses(item, uses)),
        Slot::Dict(items) => items.iter().for_each(|(_, item)| count_uses(item, uses)),
    }
}

/// Moves each value into its last use and clones it for earlier ones.
fn build(slot: &Slot, values: &mut [Option<Array>], remaining: &mut [usize]) -> FetchResult {
    match slot {
        Slot::Value(index) => {
            remaining[*index] -= 1;
            let array = if remaining[*index] == 0 {
                values[*index].take()
            } else {
                values[*index].clone()
            };
            array.map(FetchResult::Value).unwrap_or(FetchResult::Empty)
        }
        Slot::Target => FetchResult::Empty,
        Slot::List(items) => FetchResult::List(
            items
                .iter()
                .map(|item| build(item, values, remaining))
                .collect(),
        ),
        Slot::Dict(items) => FetchResult::Dict(
            items
                .iter()
                .map(|(key, item)| (key.clone(), build(item, values, remaining)))
                .collect(),
        ),
    }
}

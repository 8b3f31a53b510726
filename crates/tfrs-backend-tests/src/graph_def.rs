//! JSON graph definitions understood by the stub engine.

use serde::{Deserialize, Serialize};
use tfrs::DType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDef {
    pub ops: Vec<OpDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpDef {
    pub name: String,
    #[serde(default)]
    pub outputs: Vec<OutputDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDef {
    /// Native dtype tag.
    pub dtype: u32,
    /// `None` for unknown rank; `-1` entries for unknown extents.
    #[serde(default)]
    pub shape: Option<Vec<i64>>,
}

impl GraphDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operation with a single output.
    pub fn tensor_op(self, name: &str, dtype: DType, shape: Option<&[i64]>) -> Self {
        self.op(name, &[(dtype, shape)])
    }

    /// Adds an operation without outputs (e.g. an initializer).
    pub fn target_op(self, name: &str) -> Self {
        self.op(name, &[])
    }

    pub fn op(mut self, name: &str, outputs: &[(DType, Option<&[i64]>)]) -> Self {
        self.ops.push(OpDef {
            name: name.to_string(),
            outputs: outputs
                .iter()
                .map(|(dtype, shape)| OutputDef {
                    dtype: dtype.tag(),
                    shape: shape.map(|dims| dims.to_vec()),
                })
                .collect(),
        });
        self
    }

    /// Adds an operation whose single output carries a raw, possibly unknown, tag.
    pub fn raw_op(mut self, name: &str, tag: u32, shape: Option<&[i64]>) -> Self {
        self.ops.push(OpDef {
            name: name.to_string(),
            outputs: vec![OutputDef {
                dtype: tag,
                shape: shape.map(|dims| dims.to_vec()),
            }],
        });
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("graph def serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

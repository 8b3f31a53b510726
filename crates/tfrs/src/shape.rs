//! Declared shapes of graph tensors.

use std::fmt;

/// Represents a single axis extent as declared by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Known(usize),
    /// Extent only fixed once the tensor is produced by a run.
    Unknown,
}

impl Dimension {
    /// Converts the engine's encoding, where `-1` marks an unknown extent.
    pub fn from_native(value: i64) -> Self {
        if value < 0 {
            Dimension::Unknown
        } else {
            Dimension::Known(value as usize)
        }
    }

    /// The declared extent, if fixed.
    pub fn known(self) -> Option<usize> {
        match self {
            Dimension::Known(value) => Some(value),
            Dimension::Unknown => None,
        }
    }

    /// Reports whether a concrete extent can fill this dimension.
    pub fn accepts(self, extent: usize) -> bool {
        self.known().map_or(true, |value| value == extent)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Known(value) => write!(f, "{value}"),
            Dimension::Unknown => f.write_str("?"),
        }
    }
}

/// Checks concrete dims against a declared shape; `None` means unknown rank.
pub fn is_compatible(declared: Option<&[Dimension]>, dims: &[usize]) -> bool {
    match declared {
        None => true,
        Some(declared) => {
            declared.len() == dims.len()
                && declared
                    .iter()
                    .zip(dims.iter())
                    .all(|(dim, extent)| dim.accepts(*extent))
        }
    }
}

/// Formats a declared shape as `[2, ?, 4]`, or `<unknown>` for unknown rank.
pub fn display_declared(declared: Option<&[Dimension]>) -> String {
    match declared {
        None => "<unknown>".to_string(),
        Some(dims) => {
            let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

/// Computes the element count implied by concrete dims; scalars hold one element.
pub fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

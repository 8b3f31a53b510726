//! Enumerates the element types the engine can tag a tensor with.

use std::fmt;

/// Element type identifier shared between graph handles, host arrays and native buffers.
///
/// Discriminants are the engine's `TF_DataType` tags, so `tag()` is the value that
/// crosses the FFI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE-754 float.
    Float,
    /// 64-bit IEEE-754 float.
    Double,
    Int32,
    UInt8,
    Int16,
    Int8,
    /// Variable-length byte strings, UTF-8 on the host side.
    String,
    Complex64,
    Int64,
    Bool,
    BFloat16,
    UInt16,
    Complex128,
    Half,
    Resource,
    Variant,
    UInt32,
    UInt64,
}

impl DType {
    /// Returns the native `TF_DataType` tag.
    pub fn tag(self) -> u32 {
        match self {
            DType::Float => 1,
            DType::Double => 2,
            DType::Int32 => 3,
            DType::UInt8 => 4,
            DType::Int16 => 5,
            DType::Int8 => 6,
            DType::String => 7,
            DType::Complex64 => 8,
            DType::Int64 => 9,
            DType::Bool => 10,
            DType::BFloat16 => 14,
            DType::UInt16 => 17,
            DType::Complex128 => 18,
            DType::Half => 19,
            DType::Resource => 20,
            DType::Variant => 21,
            DType::UInt32 => 22,
            DType::UInt64 => 23,
        }
    }

    /// Reconstructs a `DType` from its native tag.
    ///
    /// Quantized and unknown tags yield `None`.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(DType::Float),
            2 => Some(DType::Double),
            3 => Some(DType::Int32),
            4 => Some(DType::UInt8),
            5 => Some(DType::Int16),
            6 => Some(DType::Int8),
            7 => Some(DType::String),
            8 => Some(DType::Complex64),
            9 => Some(DType::Int64),
            10 => Some(DType::Bool),
            14 => Some(DType::BFloat16),
            17 => Some(DType::UInt16),
            18 => Some(DType::Complex128),
            19 => Some(DType::Half),
            20 => Some(DType::Resource),
            21 => Some(DType::Variant),
            22 => Some(DType::UInt32),
            23 => Some(DType::UInt64),
            _ => None,
        }
    }

    /// Returns the fixed element width in bytes, or `None` for variable-length types.
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            DType::Int8 | DType::UInt8 | DType::Bool => Some(1),
            DType::Int16 | DType::UInt16 | DType::Half | DType::BFloat16 => Some(2),
            DType::Int32 | DType::UInt32 | DType::Float => Some(4),
            DType::Int64 | DType::UInt64 | DType::Double | DType::Complex64 => Some(8),
            DType::Complex128 => Some(16),
            DType::String | DType::Resource | DType::Variant => None,
        }
    }

    /// Short lowercase name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            DType::Float => "float32",
            DType::Double => "float64",
            DType::Int32 => "int32",
            DType::UInt8 => "uint8",
            DType::Int16 => "int16",
            DType::Int8 => "int8",
            DType::String => "string",
            DType::Complex64 => "complex64",
            DType::Int64 => "int64",
            DType::Bool => "bool",
            DType::BFloat16 => "bfloat16",
            DType::UInt16 => "uint16",
            DType::Complex128 => "complex128",
            DType::Half => "float16",
            DType::Resource => "resource",
            DType::Variant => "variant",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Renders a raw tag for diagnostics, using the dtype name when the tag is known.
pub fn describe_tag(tag: u32) -> String {
    match DType::from_tag(tag) {
        Some(dtype) => dtype.name().to_string(),
        None => format!("dtype tag {tag}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_survive_the_boundary() {
        for tag in 0..32 {
            if let Some(dtype) = DType::from_tag(tag) {
                assert_eq!(dtype.tag(), tag);
            }
        }
        assert_eq!(DType::from_tag(11), None, "quantized int8 is not modelled");
    }

    #[test]
    fn unknown_tags_are_described_numerically() {
        assert_eq!(describe_tag(1), "float32");
        assert_eq!(describe_tag(99), "dtype tag 99");
    }
}

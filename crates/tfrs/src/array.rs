//! Host-owned, typed, shaped arrays used for feeds and decoded fetches.

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape;
use crate::strings;

/// Scalar types that can live in an [`Array`].
///
/// Implementations pin the element to one [`DType`] and describe how to move
/// it between the typed host vector and the engine's native-endian bytes.
pub trait Element: Copy + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    /// Width of one element in the native buffer.
    const SIZE: usize;

    /// Decodes one element from exactly `SIZE` native-endian bytes.
    fn read_ne(bytes: &[u8]) -> Self;

    /// Appends the native-endian encoding of `self`.
    fn write_ne(self, out: &mut Vec<u8>);

    fn wrap(values: Vec<Self>) -> ArrayData;

    fn unwrap(data: &ArrayData) -> Option<&[Self]>;
}

macro_rules! numeric_element {
    ($ty:ty, $dtype:ident, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$dtype;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn read_ne(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(raw)
            }

            fn write_ne(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }

            fn wrap(values: Vec<Self>) -> ArrayData {
                ArrayData::$variant(values)
            }

            fn unwrap(data: &ArrayData) -> Option<&[Self]> {
                match data {
                    ArrayData::$variant(values) => Some(values),
                    _ => None,
                }
            }
        }
    };
}

numeric_element!(i8, Int8, I8);
numeric_element!(u8, UInt8, U8);
numeric_element!(i16, Int16, I16);
numeric_element!(i32, Int32, I32);
numeric_element!(i64, Int64, I64);
numeric_element!(f32, Float, F32);
numeric_element!(f64, Double, F64);

impl Element for bool {
    const DTYPE: DType = DType::Bool;
    const SIZE: usize = 1;

    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write_ne(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn wrap(values: Vec<Self>) -> ArrayData {
        ArrayData::Bool(values)
    }

    fn unwrap(data: &ArrayData) -> Option<&[Self]> {
        match data {
            ArrayData::Bool(values) => Some(values),
            _ => None,
        }
    }
}

/// Typed element storage, one variant per supported dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    String(Vec<String>),
}

impl ArrayData {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::I8(_) => DType::Int8,
            ArrayData::U8(_) => DType::UInt8,
            ArrayData::I16(_) => DType::Int16,
            ArrayData::I32(_) => DType::Int32,
            ArrayData::I64(_) => DType::Int64,
            ArrayData::F32(_) => DType::Float,
            ArrayData::F64(_) => DType::Double,
            ArrayData::Bool(_) => DType::Bool,
            ArrayData::String(_) => DType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::I8(v) => v.len(),
            ArrayData::U8(v) => v.len(),
            ArrayData::I16(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
            ArrayData::Bool(v) => v.len(),
            ArrayData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dense row-major host array.
///
/// An empty `dims` slice denotes a scalar holding exactly one element.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    dims: Vec<usize>,
    data: ArrayData,
}

impl Array {
    /// Builds an array after checking that the payload fills the shape exactly.
    pub fn from_data(dims: impl Into<Vec<usize>>, data: ArrayData) -> Result<Self> {
        let dims = dims.into();
        let expected = shape::element_count(&dims)
            .ok_or_else(|| Error::InvalidArray(format!("shape {dims:?} overflows usize")))?;
        if data.len() != expected {
            return Err(Error::InvalidArray(format!(
                "{} elements do not fill shape {:?} ({} expected)",
                data.len(),
                dims,
                expected
            )));
        }
        Ok(Self { dims, data })
    }

    pub fn new<T: Element>(dims: impl Into<Vec<usize>>, values: Vec<T>) -> Result<Self> {
        Self::from_data(dims, T::wrap(values))
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        Self {
            dims: Vec::new(),
            data: T::wrap(vec![value]),
        }
    }

    pub fn from_strings(dims: impl Into<Vec<usize>>, values: Vec<String>) -> Result<Self> {
        Self::from_data(dims, ArrayData::String(values))
    }

    pub fn scalar_string(value: impl Into<String>) -> Self {
        Self {
            dims: Vec::new(),
            data: ArrayData::String(vec![value.into()]),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn into_data(self) -> ArrayData {
        self.data
    }

    /// Borrows the elements as `T`, or `None` when the dtype differs.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::unwrap(&self.data)
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match &self.data {
            ArrayData::String(values) => Some(values),
            _ => None,
        }
    }

    /// Returns the single element of a scalar (or one-element) array.
    pub fn to_scalar<T: Element>(&self) -> Option<T> {
        match self.as_slice::<T>()? {
            [value] => Some(*value),
            _ => None,
        }
    }

    /// Reinterprets the elements under new dims with the same element count.
    pub fn reshape(self, dims: impl Into<Vec<usize>>) -> Result<Self> {
        Self::from_data(dims, self.data)
    }

    /// Serializes the payload into the byte layout the engine expects.
    pub fn to_native_bytes(&self) -> Vec<u8> {
        fn pack<T: Element>(values: &[T]) -> Vec<u8> {
            let mut out = Vec::with_capacity(values.len() * T::SIZE);
            for value in values {
                value.write_ne(&mut out);
            }
            out
        }

        match &self.data {
            ArrayData::I8(v) => pack(v),
            ArrayData::U8(v) => v.clone(),
            ArrayData::I16(v) => pack(v),
            ArrayData::I32(v) => pack(v),
            ArrayData::I64(v) => pack(v),
            ArrayData::F32(v) => pack(v),
            ArrayData::F64(v) => pack(v),
            ArrayData::Bool(v) => pack(v),
            ArrayData::String(v) => strings::encode(v),
        }
    }
}

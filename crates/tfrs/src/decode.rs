//! Converts native output buffers into host arrays.

use crate::array::{Array, ArrayData, Element};
use crate::buffer::{BufferView, RawTensor};
use crate::dtype::{self, DType};
use crate::error::{Error, Result};
use crate::strings;

/// Decodes a native tensor into a host array, consuming the wrapper.
///
/// The buffer is released when this returns, on success and on failure alike.
pub fn decode(tensor: RawTensor) -> Result<Array> {
    decode_ref(&tensor)
}

/// Decodes without taking ownership; the caller keeps the buffer alive.
pub fn decode_ref(tensor: &RawTensor) -> Result<Array> {
    let tag = tensor.dtype_tag();
    let dtype = DType::from_tag(tag).ok_or_else(|| Error::UnsupportedDtype {
        dtype: dtype::describe_tag(tag),
        tensor: None,
    })?;
    let dims = tensor.dims()?;
    let count = tensor.element_count()?;
    let view = tensor.view();

    let data = match dtype {
        DType::Int8 => numeric::<i8>(view, count)?,
        DType::UInt8 => numeric::<u8>(view, count)?,
        DType::Int16 => numeric::<i16>(view, count)?,
        DType::Int32 => numeric::<i32>(view, count)?,
        DType::Int64 => numeric::<i64>(view, count)?,
        DType::Float => numeric::<f32>(view, count)?,
        DType::Double => numeric::<f64>(view, count)?,
        DType::Bool => numeric::<bool>(view, count)?,
        DType::String => {
            tensor.api().string_layout().require_supported()?;
            ArrayData::String(strings::decode(view.bytes(), count)?)
        }
        other => {
            return Err(Error::UnsupportedDtype {
                dtype: other.name().to_string(),
                tensor: None,
            })
        }
    };
    Array::from_data(dims, data)
}

fn numeric<T: Element>(view: BufferView<'_>, count: usize) -> Result<ArrayData> {
    Ok(T::wrap(view.elements::<T>(count)?))
}

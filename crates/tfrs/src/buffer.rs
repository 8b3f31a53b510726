//! Ownership-tracking wrapper around native tensor buffers.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::api::EngineApi;
use crate::array::{Array, Element};
use crate::dtype::DType;
use crate::error::{Error, NativeError, Result};
use crate::ffi::{NativePtr, TF_Tensor};
use crate::shape;
use crate::status::Code;

/// Native dims rarely exceed four axes; keep them inline.
pub type NativeDims = SmallVec<[i64; 4]>;

/// Who is responsible for releasing the native tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Deleted by this wrapper when dropped.
    Owned,
    /// Still owned by the engine (or another wrapper); never deleted here.
    Borrowed,
}

/// One native tensor plus its ownership mode.
pub struct RawTensor {
    api: Arc<dyn EngineApi>,
    raw: NativePtr<TF_Tensor>,
    ownership: Ownership,
}

impl RawTensor {
    /// Adopts a tensor this wrapper must delete.
    ///
    /// # Safety
    /// `raw` must have been allocated by `api`, be live, and not be owned by anyone else.
    pub unsafe fn owned(api: Arc<dyn EngineApi>, raw: *mut TF_Tensor) -> Option<Self> {
        Some(Self {
            api,
            raw: NativePtr::new(raw)?,
            ownership: Ownership::Owned,
        })
    }

    /// Wraps a tensor that stays owned elsewhere.
    ///
    /// # Safety
    /// `raw` must come from `api` and outlive the returned wrapper.
    pub unsafe fn borrowed(api: Arc<dyn EngineApi>, raw: *mut TF_Tensor) -> Option<Self> {
        Some(Self {
            api,
            raw: NativePtr::new(raw)?,
            ownership: Ownership::Borrowed,
        })
    }

    /// Allocates a native tensor and copies the host array into it.
    ///
    /// String arrays are refused before allocation unless the engine uses the
    /// offset-table layout.
    pub fn from_array(api: Arc<dyn EngineApi>, array: &Array) -> Result<Self> {
        if array.dtype() == DType::String {
            api.string_layout().require_supported()?;
        }
        let dims: NativeDims = array.dims().iter().map(|d| *d as i64).collect();
        let bytes = array.to_native_bytes();
        // SAFETY: dims and byte length describe the buffer we copy into below.
        let raw = unsafe { api.allocate_tensor(array.dtype().tag(), &dims, bytes.len()) };
        // SAFETY: a non-null tensor returned by `allocate_tensor` is ours to delete.
        let tensor = unsafe { Self::owned(api, raw) }.ok_or_else(|| Error::Native {
            call: "allocate_tensor",
            source: NativeError {
                code: Code::ResourceExhausted,
                message: format!(
                    "engine refused a {} tensor of {} bytes",
                    array.dtype(),
                    bytes.len()
                ),
            },
        })?;
        let capacity = tensor.byte_len();
        if capacity != bytes.len() {
            return Err(Error::Native {
                call: "allocate_tensor",
                source: NativeError {
                    code: Code::Internal,
                    message: format!(
                        "allocated {capacity} bytes, requested {}",
                        bytes.len()
                    ),
                },
            });
        }
        if !bytes.is_empty() {
            // SAFETY: the engine reported `capacity == bytes.len()` writable bytes.
            unsafe {
                let data = tensor.api.tensor_data(tensor.raw.as_ptr()) as *mut u8;
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
            }
        }
        Ok(tensor)
    }

    pub fn api(&self) -> &Arc<dyn EngineApi> {
        &self.api
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn as_ptr(&self) -> *mut TF_Tensor {
        self.raw.as_ptr()
    }

    /// Releases the pointer without deleting it; the caller becomes responsible.
    pub fn into_raw(self) -> *mut TF_Tensor {
        let raw = self.raw.as_ptr();
        std::mem::forget(self);
        raw
    }

    pub fn dtype_tag(&self) -> u32 {
        // SAFETY: `raw` is live for the lifetime of `self`.
        unsafe { self.api.tensor_type(self.raw.as_ptr()) }
    }

    pub fn dtype(&self) -> Option<DType> {
        DType::from_tag(self.dtype_tag())
    }

    pub fn native_dims(&self) -> Vec<i64> {
        // SAFETY: see `dtype_tag`.
        unsafe { self.api.tensor_dims(self.raw.as_ptr()) }
    }

    /// Dims as host extents; negative extents are rejected.
    pub fn dims(&self) -> Result<Vec<usize>> {
        self.native_dims()
            .into_iter()
            .map(|dim| {
                usize::try_from(dim)
                    .map_err(|_| Error::decode(format!("negative dimension {dim} in output")))
            })
            .collect()
    }

    pub fn element_count(&self) -> Result<usize> {
        let dims = self.dims()?;
        shape::element_count(&dims)
            .ok_or_else(|| Error::decode(format!("dims {dims:?} overflow usize")))
    }

    pub fn byte_len(&self) -> usize {
        // SAFETY: see `dtype_tag`.
        unsafe { self.api.tensor_byte_size(self.raw.as_ptr()) }
    }

    /// Borrows the native bytes. The slice is derived once here and every
    /// later access is bounds-checked against it.
    pub fn view(&self) -> BufferView<'_> {
        let len = self.byte_len();
        if len == 0 {
            return BufferView { bytes: &[] };
        }
        // SAFETY: the engine guarantees `byte_len` readable bytes at `tensor_data`
        // for as long as the tensor is live, which `&self` ensures.
        let bytes: &[u8] = unsafe {
            let data = self.api.tensor_data(self.raw.as_ptr()) as *const u8;
            if data.is_null() {
                &[]
            } else {
                std::slice::from_raw_parts(data, len)
            }
        };
        BufferView { bytes }
    }
}

impl fmt::Debug for RawTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTensor")
            .field("raw", &self.raw)
            .field("ownership", &self.ownership)
            .finish()
    }
}

impl Drop for RawTensor {
    fn drop(&mut self) {
        if self.ownership == Ownership::Owned {
            // SAFETY: owned tensors are deleted exactly once, here.
            unsafe { self.api.delete_tensor(self.raw.as_ptr()) };
        }
    }
}

/// Bounds-checked read access to a native buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferView<'a> {
    bytes: &'a [u8],
}

impl<'a> BufferView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Reads element `index` of a dense `T` buffer.
    pub fn get<T: Element>(&self, index: usize) -> Option<T> {
        let start = index.checked_mul(T::SIZE)?;
        let end = start.checked_add(T::SIZE)?;
        self.bytes.get(start..end).map(T::read_ne)
    }

    /// Reads exactly `count` elements, failing unless the buffer holds
    /// `count * T::SIZE` bytes.
    pub fn elements<T: Element>(&self, count: usize) -> Result<Vec<T>> {
        let expected = count
            .checked_mul(T::SIZE)
            .ok_or_else(|| Error::decode("element byte length overflows usize"))?;
        if expected != self.bytes.len() {
            return Err(Error::decode(format!(
                "{} buffer holds {} bytes, expected {expected} for {count} elements",
                T::DTYPE,
                self.bytes.len()
            )));
        }
        (0..count)
            .map(|index| {
                self.get::<T>(index)
                    .ok_or_else(|| Error::decode(format!("element {index} is out of bounds")))
            })
            .collect()
    }
}

//! C-compatible declarations shared by every engine implementation.
//!
//! The engine's objects are opaque: Rust only ever sees pointers to them. The
//! zero-sized `_private` field keeps the types unconstructible, so they only
//! exist behind a pointer handed out by the engine.

#![allow(non_camel_case_types)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::raw::c_int;
use std::ptr::NonNull;

macro_rules! opaque {
    ($($name:ident),* $(,)?) => {
        $(
            #[repr(C)]
            pub struct $name {
                _private: [u8; 0],
            }
        )*
    };
}

opaque!(
    TF_Status,
    TF_SessionOptions,
    TF_Graph,
    TF_Operation,
    TF_Session,
    TF_Tensor,
);

/// Names one output of an operation, laid out exactly like the C struct.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TF_Output {
    pub oper: *mut TF_Operation,
    pub index: c_int,
}

/// Non-null pointer to an engine-owned object.
///
/// Stored this way so handles can satisfy `Send`/`Sync`; the engine objects are
/// only mutated through the owning wrapper, which serializes access.
pub struct NativePtr<T>(NonNull<T>);

impl<T> NativePtr<T> {
    pub fn new(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut T {
        self.0.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl<T> Clone for NativePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NativePtr<T> {}

impl<T> PartialEq for NativePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for NativePtr<T> {}

impl<T> Hash for NativePtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<T> fmt::Debug for NativePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

// SAFETY: NativePtr is an address; every dereference goes through the engine,
// and the wrappers holding one guard mutation with a lock or exclusive borrow.
unsafe impl<T> Send for NativePtr<T> {}
unsafe impl<T> Sync for NativePtr<T> {}

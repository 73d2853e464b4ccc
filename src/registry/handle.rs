//! Native handles - non-null opaque pointers

use core::ffi::c_void;
use core::fmt;
use core::ptr::NonNull;

/// Opaque reference to native memory or a native object.
///
/// Null never becomes a handle; it maps to `Value::Null` instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(NonNull<c_void>);

impl NativeHandle {
    #[inline]
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    #[inline]
    pub fn from_addr(addr: usize) -> Option<Self> {
        Self::new(addr as *mut c_void)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

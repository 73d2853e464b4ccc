//! Managed wrappers - object instances and struct/boxed memory
//!
//! Design: a wrapper owns exactly one native obligation (a reference or a
//! block of memory). Dropping it queues that obligation; it never calls the
//! native side from `Drop`.

use super::class::WrapperClass;
use super::handle::NativeHandle;
use super::release::{PendingRelease, ReleaseQueue};
use crate::logging::trace;
use core::cell::Cell;
use core::ffi::c_void;
use core::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Wrapper bound to one GObject instance
pub struct NativeObject {
    handle: NativeHandle,
    class: Rc<WrapperClass>,
    attached: Cell<bool>,
    releases: Arc<ReleaseQueue>,
}

impl NativeObject {
    pub(crate) fn new(
        handle: NativeHandle,
        class: Rc<WrapperClass>,
        releases: Arc<ReleaseQueue>,
    ) -> Self {
        Self {
            handle,
            class,
            attached: Cell::new(true),
            releases,
        }
    }

    #[inline]
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        self.handle.as_ptr()
    }

    #[inline]
    pub fn class(&self) -> &Rc<WrapperClass> {
        &self.class
    }

    /// Still holds its native reference
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.get()
    }

    /// Forget the native reference without releasing it
    pub(crate) fn detach(&self) {
        self.attached.set(false);
    }

    /// Instance of `class_name` or one of its subclasses
    pub fn is_a(&self, class_name: &str) -> bool {
        self.class.is_subclass_of(class_name)
    }
}

impl Drop for NativeObject {
    fn drop(&mut self) {
        if self.attached.get() {
            trace!(handle = ?self.handle, class = self.class.name(), "wrapper dropped");
            self.releases.push(PendingRelease::Unref(self.handle.addr()));
        }
    }
}

impl fmt::Debug for NativeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeObject")
            .field("handle", &self.handle)
            .field("class", &self.class.name())
            .field("attached", &self.attached.get())
            .finish()
    }
}

/// What dropping a `NativeBox` owes the native side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxRelease {
    /// Borrowed memory
    None,
    /// Native-allocator memory
    Free,
    /// Boxed value of the given GType
    BoxedFree(usize),
}

/// Wrapper for struct or boxed memory
pub struct NativeBox {
    handle: NativeHandle,
    type_name: Arc<str>,
    /// `None` when the layout behind the pointer is unknown
    size: Option<usize>,
    release: BoxRelease,
    releases: Arc<ReleaseQueue>,
}

impl NativeBox {
    pub(crate) fn new(
        handle: NativeHandle,
        type_name: Arc<str>,
        size: Option<usize>,
        release: BoxRelease,
        releases: Arc<ReleaseQueue>,
    ) -> Self {
        Self {
            handle,
            type_name,
            size,
            release,
            releases,
        }
    }

    #[inline]
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        self.handle.as_ptr()
    }

    #[inline]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Size of the memory block when its layout is known
    #[inline]
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    #[inline]
    pub fn release_policy(&self) -> BoxRelease {
        self.release
    }

    /// Wrapper frees its memory on drop
    #[inline]
    pub fn owns_memory(&self) -> bool {
        self.release != BoxRelease::None
    }
}

impl Drop for NativeBox {
    fn drop(&mut self) {
        let address = self.handle.addr();
        match self.release {
            BoxRelease::None => {}
            BoxRelease::Free => self.releases.push(PendingRelease::Free(address)),
            BoxRelease::BoxedFree(gtype) => {
                self.releases.push(PendingRelease::BoxedFree { gtype, address })
            }
        }
    }
}

impl fmt::Debug for NativeBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBox")
            .field("handle", &self.handle)
            .field("type", &self.type_name)
            .field("release", &self.release)
            .finish()
    }
}

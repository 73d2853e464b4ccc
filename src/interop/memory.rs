//! Native memory - call-frame scratch and raw slot access
//!
//! Design: every call owns one `CallFrame`. Transient storage (argument
//! slots, `none` strings, ref cells, borrowed arrays) lives in the frame and
//! dies with it, so nested calls issued from a trampoline never share scratch
//! with the call they interrupted. A persistent frame hands out native
//! allocations instead, for values that must outlive the operation.
//!
//! Every `full` obligation created while marshalling (native copies, added
//! references, boxed copies, long-lived trampolines) is recorded in the
//! frame until the native side has received it. A frame abandoned before
//! that point gives each one back.

use crate::error::{Error, Result};
use crate::hooks::NativeHooks;
use crate::registry::PendingRelease;
use crate::types::{FfiType, IntWidth};
use crate::value::Value;
use core::cell::RefCell;
use core::ffi::{c_char, c_void};
use smallvec::SmallVec;
use std::ffi::CString;
use std::rc::Rc;

const WORD: usize = core::mem::size_of::<u64>();

/// Out-parameter cell awaiting read-back after the native call
pub(crate) struct PendingRef {
    pub cell: *mut u8,
    pub inner: FfiType,
    pub target: Rc<RefCell<Value>>,
}

/// Ownership created for the native side but not yet handed over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Obligation {
    Release(PendingRelease),
    /// Trampoline registration that outlives the call
    Callback(u64),
}

/// Per-call scratch storage
pub(crate) struct CallFrame {
    persistent: bool,
    scratch: Vec<Box<[u64]>>,
    strings: Vec<CString>,
    refs: Vec<PendingRef>,
    scoped: SmallVec<[u64; 2]>,
    obligations: Vec<Obligation>,
}

impl CallFrame {
    /// Storage released when the frame drops
    pub fn transient() -> Self {
        Self {
            persistent: false,
            scratch: Vec::new(),
            strings: Vec::new(),
            refs: Vec::new(),
            scoped: SmallVec::new(),
            obligations: Vec::new(),
        }
    }

    /// Storage handed to the native side for good
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Self::transient()
        }
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Zeroed, `align`-aligned storage of `size` bytes
    pub fn alloc(&mut self, hooks: &NativeHooks, size: usize, align: usize) -> Result<*mut u8> {
        if self.persistent {
            let ptr = native_alloc(hooks, size)?;
            self.owe(Obligation::Release(PendingRelease::Free(ptr as usize)));
            return Ok(ptr);
        }

        let align = align.max(1);
        let words = (size + align).div_ceil(WORD).max(1);
        let mut buf = vec![0u64; words].into_boxed_slice();
        let base = buf.as_mut_ptr() as *mut u8;
        let offset = base.align_offset(align);
        self.scratch.push(buf);

        // SAFETY: `offset < align` and the buffer holds `size + align` bytes.
        Ok(unsafe { base.add(offset) })
    }

    /// C string valid for the frame's lifetime
    pub fn keep_string(&mut self, hooks: &NativeHooks, s: CString) -> Result<*const c_char> {
        if self.persistent {
            let ptr = native_string(hooks, &s)?;
            self.owe(Obligation::Release(PendingRelease::Free(ptr as usize)));
            return Ok(ptr as *const c_char);
        }
        // The heap buffer of a CString does not move with the CString.
        let ptr = s.as_ptr();
        self.strings.push(s);
        Ok(ptr)
    }

    pub fn push_ref(&mut self, pending: PendingRef) {
        self.refs.push(pending);
    }

    pub fn take_refs(&mut self) -> Vec<PendingRef> {
        core::mem::take(&mut self.refs)
    }

    /// Record a call-scoped callback registration to retire after the call
    pub fn scope_callback(&mut self, registration: u64) {
        self.scoped.push(registration);
    }

    pub fn take_scoped(&mut self) -> SmallVec<[u64; 2]> {
        core::mem::take(&mut self.scoped)
    }

    /// Record ownership created for the native side
    pub fn owe(&mut self, obligation: Obligation) {
        self.obligations.push(obligation);
    }

    /// Obligations not yet handed over, most recent first
    pub fn take_obligations(&mut self) -> Vec<Obligation> {
        let mut owed = core::mem::take(&mut self.obligations);
        owed.reverse();
        owed
    }

    /// The native side received everything recorded so far
    pub fn settle(&mut self) {
        self.obligations.clear();
    }

    /// Bytes of transient scratch currently held
    pub fn scratch_bytes(&self) -> usize {
        self.scratch.iter().map(|b| b.len() * WORD).sum()
    }
}

/// Zeroed memory from the native allocator; the receiver owns it
pub(crate) fn native_alloc(hooks: &NativeHooks, size: usize) -> Result<*mut u8> {
    let ptr = hooks.alloc_zeroed(size);
    if ptr.is_null() {
        return Err(Error::marshal("native memory", format!("{} byte allocation failed", size)));
    }
    Ok(ptr)
}

/// Native-allocated copy of a C string
pub(crate) fn native_string(hooks: &NativeHooks, s: &CString) -> Result<*mut c_char> {
    let bytes = s.as_bytes_with_nul();
    let ptr = native_alloc(hooks, bytes.len())?;
    // SAFETY: `ptr` holds `bytes.len()` bytes and cannot overlap `s`.
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
    Ok(ptr as *mut c_char)
}

// ============================================================================
// Raw slot access (unaligned-safe)
// ============================================================================

/// Store the low `width` bits of `bits`
///
/// # Safety
/// `dst` must be writable for `width.bytes()` bytes.
#[inline]
pub(crate) unsafe fn write_int(dst: *mut u8, width: IntWidth, bits: u64) {
    match width {
        IntWidth::W8 => dst.write(bits as u8),
        IntWidth::W16 => (dst as *mut u16).write_unaligned(bits as u16),
        IntWidth::W32 => (dst as *mut u32).write_unaligned(bits as u32),
        IntWidth::W64 => (dst as *mut u64).write_unaligned(bits),
    }
}

/// Load an integer of `width`, sign- or zero-extended into a `Value`
///
/// # Safety
/// `src` must be readable for `width.bytes()` bytes.
#[inline]
pub(crate) unsafe fn read_int(src: *const u8, width: IntWidth, unsigned: bool) -> Value {
    match (width, unsigned) {
        (IntWidth::W8, false) => Value::Int((src as *const i8).read() as i64),
        (IntWidth::W8, true) => Value::UInt(src.read() as u64),
        (IntWidth::W16, false) => Value::Int((src as *const i16).read_unaligned() as i64),
        (IntWidth::W16, true) => Value::UInt((src as *const u16).read_unaligned() as u64),
        (IntWidth::W32, false) => Value::Int((src as *const i32).read_unaligned() as i64),
        (IntWidth::W32, true) => Value::UInt((src as *const u32).read_unaligned() as u64),
        (IntWidth::W64, false) => Value::Int((src as *const i64).read_unaligned()),
        (IntWidth::W64, true) => Value::UInt((src as *const u64).read_unaligned()),
    }
}

/// # Safety
/// `dst` must be writable for one pointer.
#[inline]
pub(crate) unsafe fn write_ptr(dst: *mut u8, ptr: *const c_void) {
    (dst as *mut *const c_void).write_unaligned(ptr)
}

/// # Safety
/// `src` must be readable for one pointer.
#[inline]
pub(crate) unsafe fn read_ptr(src: *const u8) -> *mut c_void {
    (src as *const *mut c_void).read_unaligned()
}

/// # Safety
/// `src` must be readable for `len` bytes.
#[inline]
pub(crate) unsafe fn is_zeroed(src: *const u8, len: usize) -> bool {
    core::slice::from_raw_parts(src, len).iter().all(|&b| b == 0)
}

//! Native hooks - allocator and object-lifecycle entry points
//!
//! Design: the marshaller never names a toolkit symbol directly. Every
//! native operation it needs for ownership (free, ref, unref, boxed copy)
//! goes through this table, resolved once per runtime from configuration
//! or supplied directly (test doubles, statically linked toolkits).

use crate::config::HookSymbols;
use crate::error::{Error, Result};
use crate::interop::LibraryCache;
use crate::logging::debug;
use core::ffi::{c_char, c_ulong, c_void};

pub type AllocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type RefFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
pub type UnrefFn = unsafe extern "C" fn(*mut c_void);
pub type BoxedCopyFn = unsafe extern "C" fn(usize, *const c_void) -> *mut c_void;
pub type BoxedFreeFn = unsafe extern "C" fn(usize, *mut c_void);
pub type TypeFromNameFn = unsafe extern "C" fn(*const c_char) -> usize;
pub type GetTypeFn = unsafe extern "C" fn() -> usize;
pub type TypeNameFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;
pub type ClosureNotifyFn = unsafe extern "C" fn(*mut c_void, *mut c_void);
pub type SignalConnectFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_char,
    *mut c_void,
    *mut c_void,
    Option<ClosureNotifyFn>,
    u32,
) -> c_ulong;
pub type SignalDisconnectFn = unsafe extern "C" fn(*mut c_void, c_ulong);

/// `G_CONNECT_AFTER`
pub const CONNECT_AFTER: u32 = 1;

/// Native entry points used for ownership management
#[derive(Clone, Copy)]
pub struct NativeHooks {
    /// Allocator whose memory the toolkit may free (`g_malloc` compatible)
    pub alloc: AllocFn,
    /// Releases strings, arrays and plain structs handed over with `full`
    pub free: FreeFn,
    pub object_ref: Option<RefFn>,
    /// Takes ownership of a floating reference (or adds a normal one)
    pub object_ref_sink: Option<RefFn>,
    pub object_unref: Option<UnrefFn>,
    pub boxed_copy: Option<BoxedCopyFn>,
    pub boxed_free: Option<BoxedFreeFn>,
    pub type_from_name: Option<TypeFromNameFn>,
    /// Runtime type name of an instance (`g_type_name_from_instance`)
    pub instance_type_name: Option<TypeNameFn>,
    pub signal_connect: Option<SignalConnectFn>,
    pub signal_disconnect: Option<SignalDisconnectFn>,
    /// Frees every cell of a `GList` (items untouched)
    pub list_free: Option<FreeFn>,
    /// Frees every cell of a `GSList` (items untouched)
    pub slist_free: Option<FreeFn>,
}

impl NativeHooks {
    /// libc allocator only; object lifecycle hooks unset
    pub fn libc() -> Self {
        Self {
            alloc: libc_malloc,
            free: libc_free,
            object_ref: None,
            object_ref_sink: None,
            object_unref: None,
            boxed_copy: None,
            boxed_free: None,
            type_from_name: None,
            instance_type_name: None,
            signal_connect: None,
            signal_disconnect: None,
            list_free: None,
            slist_free: None,
        }
    }

    /// Resolve hooks from shared libraries named in configuration.
    ///
    /// Missing libraries leave the corresponding hooks unset; operations
    /// that need them later fail with `Error::MissingHook`.
    pub fn resolve(symbols: &HookSymbols, libraries: &LibraryCache) -> Self {
        let mut hooks = Self::libc();

        let lookup = |library: &str, symbol: &str| -> Option<*const c_void> {
            match libraries.symbol(library, symbol) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    debug!(library, symbol, error = %err, "hook symbol unavailable");
                    None
                }
            }
        };

        // SAFETY: each symbol is transmuted to the C signature it has in GLib/GObject.
        unsafe {
            if let Some(p) = lookup(&symbols.glib, &symbols.free) {
                hooks.free = core::mem::transmute::<*const c_void, FreeFn>(p);
            }
            if let Some(p) = lookup(&symbols.glib, &symbols.alloc) {
                hooks.alloc = core::mem::transmute::<*const c_void, AllocFn>(p);
            }
            hooks.object_ref = lookup(&symbols.gobject, &symbols.object_ref)
                .map(|p| core::mem::transmute::<*const c_void, RefFn>(p));
            hooks.object_ref_sink = lookup(&symbols.gobject, &symbols.object_ref_sink)
                .map(|p| core::mem::transmute::<*const c_void, RefFn>(p));
            hooks.object_unref = lookup(&symbols.gobject, &symbols.object_unref)
                .map(|p| core::mem::transmute::<*const c_void, UnrefFn>(p));
            hooks.boxed_copy = lookup(&symbols.gobject, &symbols.boxed_copy)
                .map(|p| core::mem::transmute::<*const c_void, BoxedCopyFn>(p));
            hooks.boxed_free = lookup(&symbols.gobject, &symbols.boxed_free)
                .map(|p| core::mem::transmute::<*const c_void, BoxedFreeFn>(p));
            hooks.type_from_name = lookup(&symbols.gobject, &symbols.type_from_name)
                .map(|p| core::mem::transmute::<*const c_void, TypeFromNameFn>(p));
            hooks.instance_type_name = lookup(&symbols.gobject, &symbols.instance_type_name)
                .map(|p| core::mem::transmute::<*const c_void, TypeNameFn>(p));
            hooks.signal_connect = lookup(&symbols.gobject, &symbols.signal_connect)
                .map(|p| core::mem::transmute::<*const c_void, SignalConnectFn>(p));
            hooks.signal_disconnect = lookup(&symbols.gobject, &symbols.signal_disconnect)
                .map(|p| core::mem::transmute::<*const c_void, SignalDisconnectFn>(p));
            hooks.list_free = lookup(&symbols.glib, &symbols.list_free)
                .map(|p| core::mem::transmute::<*const c_void, FreeFn>(p));
            hooks.slist_free = lookup(&symbols.glib, &symbols.slist_free)
                .map(|p| core::mem::transmute::<*const c_void, FreeFn>(p));
        }

        hooks
    }

    pub(crate) fn require<T>(hook: Option<T>, name: &'static str) -> Result<T> {
        hook.ok_or(Error::MissingHook(name))
    }

    /// Allocate `size` zeroed bytes with the native allocator
    pub(crate) fn alloc_zeroed(&self, size: usize) -> *mut u8 {
        // SAFETY: alloc hook follows malloc semantics; size is never 0 here.
        unsafe {
            let ptr = (self.alloc)(size.max(1)) as *mut u8;
            if !ptr.is_null() {
                core::ptr::write_bytes(ptr, 0, size.max(1));
            }
            ptr
        }
    }
}

impl Default for NativeHooks {
    fn default() -> Self {
        Self::libc()
    }
}

impl core::fmt::Debug for NativeHooks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeHooks")
            .field("object_ref", &self.object_ref.is_some())
            .field("object_unref", &self.object_unref.is_some())
            .field("boxed_copy", &self.boxed_copy.is_some())
            .field("signal_connect", &self.signal_connect.is_some())
            .finish_non_exhaustive()
    }
}

unsafe extern "C" fn libc_malloc(size: usize) -> *mut c_void {
    libc::malloc(size)
}

unsafe extern "C" fn libc_free(ptr: *mut c_void) {
    libc::free(ptr)
}

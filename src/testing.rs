//! Native test doubles - a fake object system behind the hook table
//!
//! State is per thread, so tests running in parallel never see each
//! other's reference counts or signal connections.

use crate::config::RuntimeConfig;
use crate::hooks::{ClosureNotifyFn, NativeHooks};
use crate::runtime::Runtime;
use core::cell::RefCell;
use core::ffi::{c_char, c_ulong, c_void, CStr};
use std::collections::HashMap;

pub(crate) struct FakeConnection {
    pub instance: usize,
    pub signal: String,
    pub code: usize,
    pub data: usize,
    pub notify: Option<ClosureNotifyFn>,
    pub after: bool,
    pub id: c_ulong,
}

thread_local! {
    static REFS: RefCell<HashMap<usize, i64>> = RefCell::new(HashMap::new());
    static FREED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    static TYPE_NAMES: RefCell<HashMap<usize, &'static CStr>> = RefCell::new(HashMap::new());
    static CONNECTIONS: RefCell<Vec<FakeConnection>> = const { RefCell::new(Vec::new()) };
    static NEXT_ID: RefCell<c_ulong> = const { RefCell::new(1) };
}

/// Fresh fake instance holding one (floating) reference
pub(crate) fn new_instance() -> *mut c_void {
    let ptr = Box::into_raw(Box::new([0u64; 4])) as *mut c_void;
    REFS.with(|r| r.borrow_mut().insert(ptr as usize, 1));
    ptr
}

/// Fake instance whose runtime type is `type_name`
pub(crate) fn new_typed_instance(type_name: &'static CStr) -> *mut c_void {
    let ptr = new_instance();
    TYPE_NAMES.with(|t| t.borrow_mut().insert(ptr as usize, type_name));
    ptr
}

pub(crate) fn ref_count(ptr: *mut c_void) -> i64 {
    REFS.with(|r| r.borrow().get(&(ptr as usize)).copied().unwrap_or(0))
}

pub(crate) fn was_freed(ptr: *const c_void) -> bool {
    FREED.with(|f| f.borrow().contains(&(ptr as usize)))
}

pub(crate) fn free_count() -> usize {
    FREED.with(|f| f.borrow().len())
}

pub(crate) fn connection_count() -> usize {
    CONNECTIONS.with(|c| c.borrow().len())
}

/// Invoke every handler connected to `signal` on `instance` the way
/// `g_signal_emit` would for a `void (*)(GObject*, gint, gpointer)` signal.
pub(crate) fn emit(instance: *mut c_void, signal: &str, arg: i32) -> usize {
    let targets: Vec<(usize, usize)> = CONNECTIONS.with(|c| {
        c.borrow()
            .iter()
            .filter(|conn| conn.instance == instance as usize && conn.signal == signal)
            .map(|conn| (conn.code, conn.data))
            .collect()
    });
    for (code, data) in &targets {
        // SAFETY: connected handlers were declared with this signature.
        unsafe {
            let f: unsafe extern "C" fn(*mut c_void, i32, *mut c_void) =
                core::mem::transmute(*code as *const c_void);
            f(instance, arg, *data as *mut c_void);
        }
    }
    targets.len()
}

/// Whether the last connection was made with `G_CONNECT_AFTER`
pub(crate) fn last_connect_after() -> Option<bool> {
    CONNECTIONS.with(|c| c.borrow().last().map(|conn| conn.after))
}

unsafe extern "C" fn fake_ref(ptr: *mut c_void) -> *mut c_void {
    REFS.with(|r| *r.borrow_mut().entry(ptr as usize).or_insert(0) += 1);
    ptr
}

unsafe extern "C" fn fake_unref(ptr: *mut c_void) {
    REFS.with(|r| *r.borrow_mut().entry(ptr as usize).or_insert(0) -= 1);
}

pub(crate) unsafe extern "C" fn counting_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    FREED.with(|f| f.borrow_mut().push(ptr as usize));
    libc::free(ptr);
}

unsafe extern "C" fn fake_type_name(ptr: *mut c_void) -> *const c_char {
    TYPE_NAMES.with(|t| {
        t.borrow()
            .get(&(ptr as usize))
            .map_or(core::ptr::null(), |name| name.as_ptr())
    })
}

unsafe extern "C" fn fake_connect(
    instance: *mut c_void,
    signal: *const c_char,
    code: *mut c_void,
    data: *mut c_void,
    notify: Option<ClosureNotifyFn>,
    flags: u32,
) -> c_ulong {
    let signal = CStr::from_ptr(signal).to_string_lossy().into_owned();
    if signal == "no-such-signal" {
        return 0;
    }
    let id = NEXT_ID.with(|n| {
        let mut n = n.borrow_mut();
        let id = *n;
        *n += 1;
        id
    });
    CONNECTIONS.with(|c| {
        c.borrow_mut().push(FakeConnection {
            instance: instance as usize,
            signal,
            code: code as usize,
            data: data as usize,
            notify,
            after: flags & crate::hooks::CONNECT_AFTER != 0,
            id,
        })
    });
    id
}

unsafe extern "C" fn fake_disconnect(_instance: *mut c_void, id: c_ulong) {
    let removed = CONNECTIONS.with(|c| {
        let mut c = c.borrow_mut();
        let index = c.iter().position(|conn| conn.id == id)?;
        Some(c.remove(index))
    });
    if let Some(FakeConnection {
        notify: Some(notify),
        data,
        ..
    }) = removed
    {
        notify(data as *mut c_void, core::ptr::null_mut());
    }
}

/// Hook table backed by the fake object system
pub(crate) fn hooks() -> NativeHooks {
    NativeHooks {
        free: counting_free,
        object_ref: Some(fake_ref),
        object_ref_sink: Some(fake_ref),
        object_unref: Some(fake_unref),
        instance_type_name: Some(fake_type_name),
        signal_connect: Some(fake_connect),
        signal_disconnect: Some(fake_disconnect),
        ..NativeHooks::libc()
    }
}

/// Runtime wired to the fake object system, loading nothing
pub(crate) fn runtime() -> Runtime {
    Runtime::start_with_hooks(RuntimeConfig::detached(), hooks())
}

//! Callback trampolines - native-callable stubs for managed handlers
//!
//! Design: every registration gets one libffi closure whose code calls the
//! shared `dispatch` stub. The stub looks the handler up in a side table by
//! registration id, so disconnecting is a table removal: a native caller
//! still holding the code pointer reaches the stub, finds nothing, and
//! returns a zeroed value. Closure code is only freed once native code can
//! no longer call it (call scope ended, first async call done, GClosure
//! notify, or runtime stop) and never while it is on the stack.

use crate::error::{Error, Result};
use crate::interop::abi;
use crate::interop::marshal::{read_value, write_value, Transfer};
use crate::interop::memory::CallFrame;
use crate::logging::{debug, log_callback_error, trace, warn};
use crate::runtime::{Runtime, RuntimeInner};
use crate::types::{CallbackScope, CallbackType, FfiType, Trampoline};
use crate::value::Callback;
use core::cell::{Cell, RefCell};
use core::ffi::c_void;
use libffi::low::ffi_cif;
use libffi::middle::{Cif, Closure, Type};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Closure userdata: enough to find the runtime and the registration
pub(crate) struct TrampolineData {
    pub(crate) id: u64,
    pub(crate) runtime: Weak<RuntimeInner>,
    signature: Arc<CallbackType>,
}

/// Native entry points of a fresh registration
#[derive(Debug, Clone, Copy)]
pub(crate) struct Registered {
    pub id: u64,
    pub code: *const c_void,
    /// Value native code passes back as `user_data` (closure shape)
    pub user_data: *const c_void,
}

/// Connected handler
struct Registration {
    id: u64,
    signature: Arc<CallbackType>,
    handler: Callback,
    /// Storage backing the last returned value (borrowed strings etc.)
    retained: RefCell<Option<CallFrame>>,
}

/// libffi closure plus the userdata it points at
struct NativeClosure {
    closure: Option<Closure<'static>>,
    data: *mut TrampolineData,
}

impl Drop for NativeClosure {
    fn drop(&mut self) {
        // The closure refers to `data`; free it first.
        drop(self.closure.take());
        // SAFETY: `data` came from `Box::into_raw` in `register` and nothing
        // else frees it.
        drop(unsafe { Box::from_raw(self.data) });
    }
}

/// Dispatch side table and closure lifetimes for one runtime
pub struct TrampolineTable {
    next_id: Cell<u64>,
    handlers: RefCell<HashMap<u64, Rc<Registration>>>,
    closures: RefCell<HashMap<u64, NativeClosure>>,
    retiring: RefCell<Vec<u64>>,
    /// Registrations currently executing, innermost last
    active: RefCell<Vec<u64>>,
    errors: RefCell<VecDeque<Error>>,
}

impl TrampolineTable {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            handlers: RefCell::new(HashMap::new()),
            closures: RefCell::new(HashMap::new()),
            retiring: RefCell::new(Vec::new()),
            active: RefCell::new(Vec::new()),
            errors: RefCell::new(VecDeque::new()),
        }
    }

    /// Create a closure for `signature` that dispatches to `handler`
    pub(crate) fn register(
        &self,
        rt: &Runtime,
        signature: &Arc<CallbackType>,
        handler: Callback,
    ) -> Result<Registered> {
        let mut args = Vec::with_capacity(signature.native_arity());
        for ty in signature.arg_types() {
            args.push(abi::ffi_type(ty)?);
        }
        if signature.trampoline() == Trampoline::Closure {
            args.push(Type::pointer());
        }
        let cif = Cif::new(args, abi::ffi_type(signature.return_type())?);

        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let data = Box::into_raw(Box::new(TrampolineData {
            id,
            runtime: rt.downgrade(),
            signature: signature.clone(),
        }));
        // SAFETY: `data` outlives the closure; `NativeClosure` drops them in order.
        let closure = Closure::new(cif, dispatch, unsafe { &*data });
        let code = *closure.code_ptr() as usize as *const c_void;

        self.closures.borrow_mut().insert(
            id,
            NativeClosure {
                closure: Some(closure),
                data,
            },
        );
        self.handlers.borrow_mut().insert(
            id,
            Rc::new(Registration {
                id,
                signature: signature.clone(),
                handler,
                retained: RefCell::new(None),
            }),
        );

        debug!(
            registration = id,
            scope = ?signature.scope(),
            trampoline = ?signature.trampoline(),
            "callback registered"
        );

        Ok(Registered {
            id,
            code,
            user_data: data as *const c_void,
        })
    }

    /// Remove the handler from the side table; idempotent
    pub(crate) fn disconnect(&self, id: u64) -> bool {
        let removed = self.handlers.borrow_mut().remove(&id).is_some();
        if removed {
            trace!(registration = id, "callback disconnected");
        }
        removed
    }

    /// Disconnect and free the closure code at the next safe point
    pub(crate) fn retire(&self, id: u64) {
        self.disconnect(id);
        self.retiring.borrow_mut().push(id);
        self.collect();
    }

    /// Free closures scheduled for retirement that are not executing
    pub(crate) fn collect(&self) -> usize {
        let ready: Vec<u64> = {
            let active = self.active.borrow();
            let mut retiring = self.retiring.borrow_mut();
            let (ready, busy): (Vec<u64>, Vec<u64>) =
                retiring.drain(..).partition(|id| !active.contains(id));
            *retiring = busy;
            ready
        };

        let freed: Vec<NativeClosure> = {
            let mut closures = self.closures.borrow_mut();
            ready.iter().filter_map(|id| closures.remove(id)).collect()
        };
        let count = freed.len();
        drop(freed);
        count
    }

    pub fn is_connected(&self, id: u64) -> bool {
        self.handlers.borrow().contains_key(&id)
    }

    /// Handlers still reachable through the dispatch stub
    pub fn connected_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Closures whose code is still allocated
    pub fn closure_count(&self) -> usize {
        self.closures.borrow().len()
    }

    /// A trampoline is on the current stack
    pub fn in_dispatch(&self) -> bool {
        !self.active.borrow().is_empty()
    }

    pub fn pending_errors(&self) -> usize {
        self.errors.borrow().len()
    }

    /// Oldest deferred handler failure
    pub(crate) fn take_error(&self) -> Option<Error> {
        self.errors.borrow_mut().pop_front()
    }

    fn defer_error(&self, registration: u64, message: String) {
        log_callback_error(registration, &message);
        self.errors.borrow_mut().push_back(Error::Callback {
            registration,
            message,
        });
    }

    /// Drop every handler and closure (runtime stop)
    pub(crate) fn clear(&self) {
        let handlers: Vec<_> = self.handlers.borrow_mut().drain().collect();
        let closures: Vec<_> = self.closures.borrow_mut().drain().collect();
        self.retiring.borrow_mut().clear();
        drop(handlers);
        drop(closures);
    }

    /// Run the handler for `id` on behalf of a native caller
    fn invoke(&self, rt: &Runtime, id: u64, args: *const *const c_void, result: *mut u8) {
        let Some(registration) = self.handlers.borrow().get(&id).cloned() else {
            warn!(registration = id, "trampoline invoked after disconnect");
            zero_result(self.signature_of(id).as_deref(), result);
            return;
        };

        self.active.borrow_mut().push(id);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            run_handler(rt, &registration, args, result)
        }));
        self.active.borrow_mut().pop();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(Error::Callback { message, .. })) => Some(message),
            Ok(Err(err)) => Some(err.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        if let Some(message) = failure {
            zero_result(Some(&*registration.signature), result);
            self.defer_error(id, message);
        }

        if registration.signature.scope() == CallbackScope::Async {
            self.disconnect(id);
            self.retiring.borrow_mut().push(id);
        }
    }

    fn signature_of(&self, id: u64) -> Option<Arc<CallbackType>> {
        self.closures.borrow().get(&id).map(|c| {
            // SAFETY: `data` lives as long as its closure entry.
            unsafe { (*c.data).signature.clone() }
        })
    }
}

impl Default for TrampolineTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared stub every closure jumps to
unsafe extern "C" fn dispatch(
    _cif: &ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    data: &TrampolineData,
) {
    let result = result as *mut c_void as *mut u8;
    match data.runtime.upgrade() {
        Some(inner) => {
            let rt = Runtime::from_inner(inner);
            rt.trampolines().invoke(&rt, data.id, args, result);
        }
        None => {
            warn!(registration = data.id, "trampoline invoked after its runtime was dropped");
            zero_result(Some(&*data.signature), result);
        }
    }
}

fn run_handler(
    rt: &Runtime,
    registration: &Registration,
    args: *const *const c_void,
    result: *mut u8,
) -> Result<()> {
    let signature = &registration.signature;

    let mut values = Vec::with_capacity(signature.arg_types().len());
    for (i, ty) in signature.arg_types().iter().enumerate() {
        // SAFETY: libffi passes one pointer per declared argument.
        let slot = unsafe { *args.add(i) } as *const u8;
        values.push(read_value(rt, ty, slot, Transfer::Declared)?);
    }

    let returned = registration
        .handler
        .invoke(&values)
        .map_err(|err| Error::Callback {
            registration: registration.id,
            message: err.to_string(),
        })?;

    let return_type = signature.return_type();
    if matches!(return_type, FfiType::Void) {
        return Ok(());
    }

    zero_result(Some(&**signature), result);
    if returned.is_null() {
        return Ok(());
    }

    let mut frame = CallFrame::transient();
    if let Err(err) = write_value(rt, return_type, &returned, result, &mut frame) {
        rt.abandon(&mut frame);
        return Err(err);
    }
    frame.settle();
    // SAFETY: libffi's return buffer holds at least one `ffi_arg`.
    unsafe { abi::widen_return(return_type, result) };
    *registration.retained.borrow_mut() = Some(frame);
    Ok(())
}

fn zero_result(signature: Option<&CallbackType>, result: *mut u8) {
    let Some(signature) = signature else { return };
    let ty = signature.return_type();
    let size = match ty {
        FfiType::Void => return,
        FfiType::Boolean | FfiType::Int { .. } => abi::FFI_ARG_SIZE.max(ty.native_size()),
        other => other.native_size(),
    };
    // SAFETY: libffi sizes the return buffer for the declared return type.
    unsafe { core::ptr::write_bytes(result, 0, size) };
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

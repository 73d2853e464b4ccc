//! Signal connections - GObject signals on top of trampolines
//!
//! A connection keeps its instance's wrapper alive until it is
//! disconnected: connection lifetime is explicit, never tied to when the
//! last managed reference happens to drop.

use super::trampoline::{TrampolineData, TrampolineTable};
use crate::error::{Error, Result};
use crate::hooks::{NativeHooks, CONNECT_AFTER};
use crate::logging::{debug, trace};
use crate::registry::{NativeHandle, NativeObject};
use crate::runtime::Runtime;
use crate::types::{CallbackType, Trampoline};
use crate::value::Callback;
use core::cell::RefCell;
use core::ffi::{c_ulong, c_void};
use std::collections::HashMap;
use std::ffi::CString;
use std::rc::Rc;
use std::sync::Arc;

/// Handle returned by `Runtime::connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    registration: u64,
    native: c_ulong,
}

impl HandlerId {
    /// Trampoline registration backing the handler
    #[inline]
    pub fn registration(&self) -> u64 {
        self.registration
    }

    /// Id returned by `g_signal_connect_data`
    #[inline]
    pub fn native_id(&self) -> c_ulong {
        self.native
    }
}

struct Connection {
    object: Rc<NativeObject>,
    native: c_ulong,
    signal: String,
}

/// Live signal connections of one runtime, by registration id
#[derive(Default)]
pub struct SignalTable {
    connections: RefCell<HashMap<u64, Connection>>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connect(
        &self,
        rt: &Runtime,
        object: &Rc<NativeObject>,
        signal: &str,
        signature: &Arc<CallbackType>,
        handler: Callback,
        after: bool,
    ) -> Result<HandlerId> {
        let connect = NativeHooks::require(rt.hooks().signal_connect, "signal_connect")?;

        if signature.trampoline() != Trampoline::Closure {
            return Err(Error::descriptor(format!(
                "handler for '{}' must use the closure calling shape",
                signal
            )));
        }
        if !object.is_attached() {
            return Err(Error::Registry(format!(
                "cannot connect '{}' on a detached {} wrapper",
                signal,
                object.class().name()
            )));
        }
        let name = CString::new(signal)
            .map_err(|_| Error::descriptor(format!("signal name {:?} contains NUL", signal)))?;

        let registered = rt.trampolines().register(rt, signature, handler)?;
        let flags = if after { CONNECT_AFTER } else { 0 };

        // SAFETY: instance is alive (attached wrapper), code matches the
        // handler signature, user_data outlives the connection.
        let native = unsafe {
            connect(
                object.as_ptr(),
                name.as_ptr(),
                registered.code as *mut c_void,
                registered.user_data as *mut c_void,
                Some(closure_notify),
                flags,
            )
        };

        if native == 0 {
            rt.trampolines().retire(registered.id);
            return Err(Error::descriptor(format!(
                "{} has no signal '{}'",
                object.class().name(),
                signal
            )));
        }

        debug!(
            signal,
            class = object.class().name(),
            registration = registered.id,
            native_id = native as u64,
            after,
            "signal connected"
        );

        self.connections.borrow_mut().insert(
            registered.id,
            Connection {
                object: object.clone(),
                native,
                signal: signal.to_string(),
            },
        );

        Ok(HandlerId {
            registration: registered.id,
            native,
        })
    }

    /// Disconnect a handler; a second call for the same id is a no-op
    pub(crate) fn disconnect(&self, rt: &Runtime, id: HandlerId) -> bool {
        let Some(connection) = self.connections.borrow_mut().remove(&id.registration) else {
            return false;
        };
        rt.trampolines().disconnect(id.registration);
        disconnect_native(rt.hooks(), rt.trampolines(), id.registration, &connection);
        trace!(signal = %connection.signal, registration = id.registration, "signal disconnected");
        true
    }

    /// Disconnect every handler on an instance whose wrapper is released
    pub(crate) fn disconnect_instance(&self, rt: &Runtime, handle: NativeHandle) -> usize {
        let connections = self.take_instance(handle);
        for (id, connection) in &connections {
            rt.trampolines().disconnect(*id);
            disconnect_native(rt.hooks(), rt.trampolines(), *id, connection);
        }
        connections.len()
    }

    /// Drop connections of an instance the native side finalized
    pub(crate) fn forget_instance(&self, trampolines: &TrampolineTable, handle: NativeHandle) -> usize {
        let stale = self.take_instance(handle);
        for (id, _) in &stale {
            trampolines.retire(*id);
        }
        stale.len()
    }

    fn take_instance(&self, handle: NativeHandle) -> Vec<(u64, Connection)> {
        let mut connections = self.connections.borrow_mut();
        let ids: Vec<u64> = connections
            .iter()
            .filter(|(_, c)| c.object.handle() == handle)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| connections.remove(&id).map(|c| (id, c)))
            .collect()
    }

    /// Disconnect everything (runtime stop)
    pub(crate) fn disconnect_all(&self, hooks: &NativeHooks, trampolines: &TrampolineTable) {
        let all: Vec<(u64, Connection)> = self.connections.borrow_mut().drain().collect();
        for (id, connection) in &all {
            trampolines.disconnect(*id);
            disconnect_native(hooks, trampolines, *id, connection);
        }
    }

    /// Notify fired: native code will not call this registration again
    fn retired_by_native(&self, id: u64) -> Option<Rc<NativeObject>> {
        self.connections.borrow_mut().remove(&id).map(|c| c.object)
    }

    pub fn len(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.borrow().is_empty()
    }
}

fn disconnect_native(
    hooks: &NativeHooks,
    trampolines: &TrampolineTable,
    registration: u64,
    connection: &Connection,
) {
    match hooks.signal_disconnect {
        // SAFETY: the connection's wrapper keeps the instance alive.
        Some(disconnect) if connection.object.is_attached() => unsafe {
            disconnect(connection.object.as_ptr(), connection.native)
        },
        // Finalized instance: its handlers are already gone natively.
        _ if !connection.object.is_attached() => trampolines.retire(registration),
        // No native disconnect: the closure must stay callable.
        _ => {}
    }
}

/// `GClosureNotify` passed with every connection
unsafe extern "C" fn closure_notify(data: *mut c_void, _closure: *mut c_void) {
    let (id, runtime) = {
        let data = &*(data as *const TrampolineData);
        (data.id, data.runtime.clone())
    };
    let Some(inner) = runtime.upgrade() else { return };
    let rt = Runtime::from_inner(inner);

    // Dropping the wrapper only queues its release.
    drop(rt.signals().retired_by_native(id));
    rt.trampolines().retire(id);
}

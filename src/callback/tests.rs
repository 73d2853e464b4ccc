//! Trampoline dispatch, signal lifetime and deferred error tests

use crate::error::Error;
use crate::runtime::Runtime;
use crate::testing::{self, connection_count, emit, last_connect_after, new_instance, ref_count};
use crate::types::{CallbackScope, FfiType, Ownership, Trampoline};
use crate::value::{Callback, Value};
use core::cell::RefCell;
use std::rc::Rc;

fn signal_sig() -> FfiType {
    FfiType::callback(
        Trampoline::Closure,
        CallbackScope::Forever,
        vec![FfiType::object(Ownership::None), FfiType::i32()],
        FfiType::void(),
    )
    .unwrap()
}

fn recorder() -> (Callback, Rc<RefCell<Vec<Value>>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let handler = Callback::new(move |args: &[Value]| {
        sink.borrow_mut().extend(args.iter().cloned());
        Ok(Value::Null)
    });
    (handler, seen)
}

fn object(rt: &Runtime) -> Rc<crate::registry::NativeObject> {
    rt.get_native_object(new_instance(), None).unwrap().unwrap()
}

#[test]
fn test_signal_emission_reaches_handler() {
    let rt = testing::runtime();
    let button = object(&rt);
    let (handler, seen) = recorder();

    rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();
    assert_eq!(emit(button.as_ptr(), "clicked", 7), 1);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert!(Rc::ptr_eq(seen[0].as_object().unwrap(), &button));
    assert_eq!(seen[1], Value::Int(7));
    assert_eq!(last_connect_after(), Some(false));
}

#[test]
fn test_connect_after_flag() {
    let rt = testing::runtime();
    let button = object(&rt);
    let (handler, _) = recorder();
    rt.connect(&button, "clicked", &signal_sig(), handler, true).unwrap();
    assert_eq!(last_connect_after(), Some(true));
}

#[test]
fn test_disconnect_is_idempotent() {
    let rt = testing::runtime();
    let button = object(&rt);
    let (handler, seen) = recorder();

    let id = rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();
    assert!(rt.trampolines().is_connected(id.registration()));
    assert!(id.native_id() != 0);

    assert!(rt.disconnect(id));
    assert!(!rt.disconnect(id));

    assert_eq!(emit(button.as_ptr(), "clicked", 1), 0);
    assert!(seen.borrow().is_empty());
    // Native notify already ran: nothing left to free
    assert_eq!(rt.trampolines().closure_count(), 0);
    assert!(rt.signals().is_empty());
}

#[test]
fn test_connection_keeps_wrapper_alive() {
    let rt = testing::runtime();
    let ptr = new_instance();
    let button = rt.get_native_object(ptr, None).unwrap().unwrap();
    let (handler, _) = recorder();
    let id = rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();

    drop(button);
    assert_eq!(rt.live_objects(), 1);
    assert_eq!(rt.pending_releases(), 0);

    rt.disconnect(id);
    rt.tick().unwrap();
    assert_eq!(rt.live_objects(), 0);
    assert_eq!(ref_count(ptr), 1);
}

#[test]
fn test_unknown_signal_rejected() {
    let rt = testing::runtime();
    let button = object(&rt);
    let (handler, _) = recorder();

    let err = rt
        .connect(&button, "no-such-signal", &signal_sig(), handler, false)
        .unwrap_err();
    assert!(matches!(err, Error::Descriptor(_)));
    assert_eq!(rt.trampolines().closure_count(), 0);
    assert!(rt.signals().is_empty());
}

#[test]
fn test_signal_needs_closure_shape() {
    let rt = testing::runtime();
    let button = object(&rt);
    let (handler, _) = recorder();

    let plain = FfiType::callback(Trampoline::Plain, CallbackScope::Forever, vec![], FfiType::void()).unwrap();
    assert!(rt.connect(&button, "clicked", &plain, handler.clone(), false).is_err());
    assert!(rt.connect(&button, "clicked", &FfiType::i32(), handler, false).is_err());
}

#[test]
fn test_handler_error_deferred_to_tick() {
    let rt = testing::runtime();
    let button = object(&rt);
    let handler = Callback::new(|_: &[Value]| Err("boom".into()));
    let id = rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();

    emit(button.as_ptr(), "clicked", 0);
    emit(button.as_ptr(), "clicked", 0);
    assert_eq!(rt.trampolines().pending_errors(), 2);

    let err = rt.tick().unwrap_err();
    assert_eq!(
        err,
        Error::Callback {
            registration: id.registration(),
            message: "boom".into()
        }
    );
    assert!(rt.tick().is_err());
    assert!(rt.tick().is_ok());
}

#[test]
fn test_handler_panic_caught() {
    let rt = testing::runtime();
    let button = object(&rt);
    let handler = Callback::new(|_: &[Value]| -> crate::value::HandlerResult { panic!("kaboom") });
    rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();

    emit(button.as_ptr(), "clicked", 0);
    match rt.tick() {
        Err(Error::Callback { message, .. }) => assert!(message.contains("kaboom")),
        other => panic!("expected deferred panic, got {:?}", other),
    }
    assert!(!rt.trampolines().in_dispatch());
}

#[test]
fn test_async_scope_runs_once() {
    let rt = testing::runtime();
    let sig = FfiType::callback(
        Trampoline::Plain,
        CallbackScope::Async,
        vec![FfiType::i32()],
        FfiType::i32(),
    )
    .unwrap();
    let FfiType::Callback(sig) = sig else { unreachable!() };

    let handler = Callback::new(|args: &[Value]| Ok(Value::Int(args[0].as_i64().unwrap_or(0) + 1)));
    let registered = rt.trampolines().register(&rt, &sig, handler).unwrap();
    let f: extern "C" fn(i32) -> i32 = unsafe { core::mem::transmute(registered.code) };

    assert_eq!(f(41), 42);
    assert_eq!(rt.trampolines().connected_count(), 0);
    // Stale native caller: zeroed result, no handler
    assert_eq!(f(41), 0);
    assert_eq!(rt.trampolines().closure_count(), 1);

    rt.tick().unwrap();
    assert_eq!(rt.trampolines().closure_count(), 0);
}

#[test]
fn test_return_value_marshalled_to_native() {
    let rt = testing::runtime();
    let sig = FfiType::callback(
        Trampoline::Plain,
        CallbackScope::Forever,
        vec![FfiType::string(Ownership::None)],
        FfiType::string(Ownership::None),
    )
    .unwrap();
    let FfiType::Callback(sig) = sig else { unreachable!() };

    let handler = Callback::new(|args: &[Value]| {
        Ok(Value::String(format!("{}!", args[0].as_str().unwrap_or_default())))
    });
    let registered = rt.trampolines().register(&rt, &sig, handler).unwrap();
    let f: extern "C" fn(*const core::ffi::c_char) -> *const core::ffi::c_char =
        unsafe { core::mem::transmute(registered.code) };

    let out = f(b"hey\0".as_ptr() as *const _);
    let text = unsafe { core::ffi::CStr::from_ptr(out) }.to_str().unwrap().to_string();
    assert_eq!(text, "hey!");
}

#[test]
fn test_release_disconnects_handlers() {
    let rt = testing::runtime();
    let ptr = new_instance();
    let button = rt.get_native_object(ptr, None).unwrap().unwrap();
    let (handler, _) = recorder();
    rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();
    assert_eq!(connection_count(), 1);

    assert!(rt.release(&button).unwrap());
    assert!(!rt.release(&button).unwrap());
    assert_eq!(connection_count(), 0);
    assert!(rt.signals().is_empty());
    assert_eq!(ref_count(ptr), 1);
    assert_eq!(rt.live_objects(), 0);
}

#[test]
fn test_native_finalized_forgets_connections() {
    let rt = testing::runtime();
    let ptr = new_instance();
    let button = rt.get_native_object(ptr, None).unwrap().unwrap();
    let (handler, _) = recorder();
    rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();

    assert!(rt.native_finalized(ptr));
    assert!(!button.is_attached());
    assert!(rt.signals().is_empty());
    drop(button);
    assert_eq!(rt.pending_releases(), 0);
}

#[test]
fn test_stop_inside_handler_refused() {
    let rt = testing::runtime();
    let button = object(&rt);
    let weak = rt.downgrade();
    let outcome = Rc::new(RefCell::new(None));
    let sink = outcome.clone();
    let handler = Callback::new(move |_: &[Value]| {
        let rt = Runtime::upgrade(&weak).ok_or(Error::Stopped)?;
        *sink.borrow_mut() = Some(rt.stop());
        Ok(Value::Null)
    });
    rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();

    emit(button.as_ptr(), "clicked", 0);
    assert!(matches!(*outcome.borrow(), Some(Err(Error::Registry(_)))));
    assert!(rt.is_running());
}

#[test]
fn test_stop_disconnects_everything() {
    let rt = testing::runtime();
    let ptr = new_instance();
    let button = rt.get_native_object(ptr, None).unwrap().unwrap();
    for _ in 0..3 {
        let (handler, _) = recorder();
        rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();
    }
    assert_eq!(connection_count(), 3);

    rt.stop().unwrap();
    assert_eq!(connection_count(), 0);
    assert_eq!(rt.trampolines().closure_count(), 0);
    assert!(!button.is_attached());
    assert_eq!(ref_count(ptr), 1);

    rt.stop().unwrap();
    assert_eq!(rt.tick().unwrap_err(), Error::Stopped);
}

#[test]
fn test_dropping_runtime_disconnects() {
    let ptr = new_instance();
    {
        let rt = testing::runtime();
        let button = rt.get_native_object(ptr, None).unwrap().unwrap();
        let (handler, _) = recorder();
        rt.connect(&button, "clicked", &signal_sig(), handler, false).unwrap();
    }
    assert_eq!(connection_count(), 0);
    assert_eq!(ref_count(ptr), 1);
}

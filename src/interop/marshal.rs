//! Type marshalling - managed values ↔ native memory
//!
//! Design: one value at a time, against one descriptor, at one address.
//! The same two functions marshal call arguments, struct fields, array
//! items, out-parameter cells and callback returns. Ownership decides who
//! allocates on the way out and who frees on the way in:
//! - outbound `none`: storage borrowed from the call frame
//! - outbound `full`: native-allocated copy (or an added reference)
//! - inbound `full`: copy-and-free, or a wrapper that owns the release
//! - inbound `none`: copy or wrap, never release

use super::memory::{
    is_zeroed, native_alloc, native_string, read_int, read_ptr, write_int, write_ptr, CallFrame,
    Obligation, PendingRef,
};
use super::call::TypedArg;
use crate::error::{Error, Result};
use crate::hooks::NativeHooks;
use crate::logging::{trace, warn};
use crate::registry::{BoxRelease, NativeBox, NativeHandle, PendingRelease};
use crate::runtime::Runtime;
use crate::types::{
    ArrayLength, ArrayType, CallbackType, FfiType, FloatWidth, ListKind, Ownership, StructLayout,
    Trampoline,
};
use crate::value::{Callback, Record, Value};
use core::ffi::{c_char, c_void};
use std::ffi::{CStr, CString};
use std::rc::Rc;
use std::sync::Arc;

const PTR_SIZE: usize = core::mem::size_of::<*const c_void>();
const PTR_ALIGN: usize = core::mem::align_of::<*const c_void>();

/// Whose ownership tags apply when reading a native value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transfer {
    /// Honour the descriptor (returns, out-parameters, callback arguments)
    Declared,
    /// Treat everything as borrowed (raw field reads, borrowed containers)
    Borrowed,
}

impl Transfer {
    #[inline]
    fn owns(self, ownership: Ownership) -> bool {
        self == Self::Declared && ownership.is_full()
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Marshal `value` into the native slot at `dst` (`ty.native_size()` bytes)
pub(crate) fn write_value(
    rt: &Runtime,
    ty: &FfiType,
    value: &Value,
    dst: *mut u8,
    frame: &mut CallFrame,
) -> Result<()> {
    trace!(kind = ty.kind_name(), value = value.type_name(), "marshal out");
    let hooks = rt.hooks();

    // SAFETY (whole match): `dst` is a writable slot sized for `ty`.
    unsafe {
        match ty {
            FfiType::Void => Ok(()),

            FfiType::Boolean => {
                let truthy = match value {
                    Value::Bool(b) => *b,
                    Value::Int(_) | Value::UInt(_) => int_bits(value)? != 0,
                    other => return Err(Error::marshal("boolean", other.type_name())),
                };
                (dst as *mut i32).write_unaligned(truthy as i32);
                Ok(())
            }

            FfiType::Int { width, .. } => {
                write_int(dst, *width, int_bits(value)?);
                Ok(())
            }

            FfiType::Float(width) => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| Error::marshal("float", value.type_name()))?;
                match width {
                    FloatWidth::F32 => (dst as *mut f32).write_unaligned(v as f32),
                    FloatWidth::F64 => (dst as *mut f64).write_unaligned(v),
                }
                Ok(())
            }

            FfiType::String { ownership } => {
                let ptr: *const c_char = match value {
                    Value::Null => core::ptr::null(),
                    Value::String(s) => {
                        let c = to_cstring(s);
                        if ownership.is_full() {
                            let copy = native_string(hooks, &c)?;
                            frame.owe(Obligation::Release(PendingRelease::Free(copy as usize)));
                            copy as *const c_char
                        } else {
                            frame.keep_string(hooks, c)?
                        }
                    }
                    other => return Err(Error::marshal("string", other.type_name())),
                };
                write_ptr(dst, ptr as *const c_void);
                Ok(())
            }

            FfiType::Struct {
                layout,
                ownership,
                by_value,
            } => {
                if *by_value {
                    match value {
                        Value::Record(record) => write_record(rt, layout, record, dst, frame),
                        Value::Boxed(b) => {
                            copy_struct(layout, b, dst)?;
                            Ok(())
                        }
                        other => Err(Error::marshal("struct", other.type_name())),
                    }
                } else {
                    let ptr: *const c_void = match value {
                        Value::Null => core::ptr::null(),
                        Value::Record(record) => {
                            let buf = if ownership.is_full() {
                                owned_alloc(hooks, layout.size(), frame)?
                            } else {
                                frame.alloc(hooks, layout.size(), layout.align())?
                            };
                            write_record(rt, layout, record, buf, frame)?;
                            buf as *const c_void
                        }
                        Value::Boxed(b) if ownership.is_full() => {
                            let buf = owned_alloc(hooks, layout.size(), frame)?;
                            copy_struct(layout, b, buf)?;
                            buf as *const c_void
                        }
                        Value::Boxed(b) => b.as_ptr() as *const c_void,
                        other => return Err(Error::marshal("struct", other.type_name())),
                    };
                    write_ptr(dst, ptr);
                    Ok(())
                }
            }

            FfiType::Boxed { boxed, ownership } => {
                let ptr: *const c_void = match value {
                    Value::Null => core::ptr::null(),
                    Value::Boxed(b) if ownership.is_full() => {
                        let gtype = rt.boxed_gtype(boxed)?;
                        let copy = NativeHooks::require(hooks.boxed_copy, "boxed_copy")?;
                        let address = copy(gtype, b.as_ptr()) as usize;
                        if address != 0 {
                            frame.owe(Obligation::Release(PendingRelease::BoxedFree {
                                gtype,
                                address,
                            }));
                        }
                        address as *const c_void
                    }
                    Value::Boxed(b) => b.as_ptr() as *const c_void,
                    other => return Err(Error::marshal("boxed", other.type_name())),
                };
                write_ptr(dst, ptr);
                Ok(())
            }

            FfiType::Object { ownership, .. } => {
                let ptr: *const c_void = match value {
                    Value::Null => core::ptr::null(),
                    Value::Object(obj) => {
                        if !obj.is_attached() {
                            return Err(Error::Registry(format!(
                                "{} wrapper at {:?} no longer refers to a native instance",
                                obj.class().name(),
                                obj.handle()
                            )));
                        }
                        if ownership.is_full() {
                            let add_ref = NativeHooks::require(hooks.object_ref, "object_ref")?;
                            add_ref(obj.as_ptr());
                            frame.owe(Obligation::Release(PendingRelease::Unref(obj.as_ptr() as usize)));
                        }
                        obj.as_ptr() as *const c_void
                    }
                    other => return Err(Error::marshal("object", other.type_name())),
                };
                write_ptr(dst, ptr);
                Ok(())
            }

            FfiType::Array(array) => {
                let ptr = match value {
                    Value::Null => core::ptr::null_mut(),
                    Value::Array(items) => match array.list() {
                        ListKind::Array => write_c_array(rt, array, items, frame)?,
                        ListKind::GList | ListKind::GSList => {
                            write_list(rt, array, items, frame)?
                        }
                    },
                    other => return Err(Error::marshal("array", other.type_name())),
                };
                write_ptr(dst, ptr as *const c_void);
                Ok(())
            }

            FfiType::Ref(r) => {
                let ptr = match value {
                    Value::Null => core::ptr::null_mut(),
                    Value::Ref(target) => {
                        if frame.is_persistent() {
                            return Err(Error::descriptor(
                                "ref cells can only be passed as call arguments",
                            ));
                        }
                        let inner = r.inner();
                        let cell = frame.alloc(
                            hooks,
                            inner.native_size().max(PTR_SIZE),
                            inner.native_align().max(PTR_ALIGN),
                        )?;
                        let current = target.borrow().clone();
                        if !current.is_null() {
                            write_value(rt, inner, &current, cell, frame)?;
                        }
                        frame.push_ref(PendingRef {
                            cell,
                            inner: inner.clone(),
                            target: target.clone(),
                        });
                        cell
                    }
                    other => return Err(Error::marshal("ref", other.type_name())),
                };
                write_ptr(dst, ptr as *const c_void);
                Ok(())
            }

            FfiType::Callback(signature) => {
                if signature.trampoline() == Trampoline::Closure {
                    return Err(Error::descriptor(
                        "closure-shaped callbacks take a user_data slot and can only be call arguments",
                    ));
                }
                let (code, _) = register_callback(rt, signature, value, frame)?;
                write_ptr(dst, code);
                Ok(())
            }
        }
    }
}

/// Marshal a callback argument into its slot(s): the function pointer, then
/// `user_data` for closure-shaped callbacks.
pub(crate) fn write_callback_arg(
    rt: &Runtime,
    signature: &Arc<CallbackType>,
    value: &Value,
    dst: *mut u8,
    frame: &mut CallFrame,
) -> Result<()> {
    let (code, user_data) = register_callback(rt, signature, value, frame)?;
    // SAFETY: the dispatcher sized the slot with `abi::arg_slot_size`.
    unsafe {
        write_ptr(dst, code);
        if signature.trampoline() == Trampoline::Closure {
            write_ptr(dst.add(PTR_SIZE), user_data);
        }
    }
    Ok(())
}

fn register_callback(
    rt: &Runtime,
    signature: &Arc<CallbackType>,
    value: &Value,
    frame: &mut CallFrame,
) -> Result<(*const c_void, *const c_void)> {
    match value {
        Value::Null => Ok((core::ptr::null(), core::ptr::null())),
        Value::Callback(handler) => {
            let registered = rt.trampolines().register(rt, signature, handler.clone())?;
            if signature.scope() == crate::types::CallbackScope::Call && !frame.is_persistent() {
                frame.scope_callback(registered.id);
            } else {
                frame.owe(Obligation::Callback(registered.id));
            }
            Ok((registered.code, registered.user_data))
        }
        other => Err(Error::marshal("callback", other.type_name())),
    }
}

/// Native allocation handed to the callee; freed again if the frame is abandoned
fn owned_alloc(hooks: &NativeHooks, size: usize, frame: &mut CallFrame) -> Result<*mut u8> {
    let buf = native_alloc(hooks, size)?;
    frame.owe(Obligation::Release(PendingRelease::Free(buf as usize)));
    Ok(buf)
}

/// Integer view with the wrap policy: values keep their low bits, floats
/// truncate toward zero first.
fn int_bits(value: &Value) -> Result<u64> {
    match value {
        Value::Int(v) => Ok(*v as u64),
        Value::UInt(v) => Ok(*v),
        Value::Float(f) => Ok(f.trunc() as i64 as u64),
        Value::Bool(b) => Ok(*b as u64),
        other => Err(Error::marshal("int", other.type_name())),
    }
}

/// C string, cut at the first embedded NUL
fn to_cstring(s: &str) -> CString {
    match CString::new(s) {
        Ok(c) => c,
        Err(err) => {
            let position = err.nul_position();
            warn!(position, length = s.len(), "string truncated at embedded NUL");
            let mut bytes = err.into_vec();
            bytes.truncate(position);
            CString::new(bytes).unwrap_or_default()
        }
    }
}

fn write_record(
    rt: &Runtime,
    layout: &StructLayout,
    record: &Record,
    dst: *mut u8,
    frame: &mut CallFrame,
) -> Result<()> {
    for (name, value) in record.iter() {
        let field = layout.field(name).ok_or_else(|| Error::Marshal {
            expected: "struct field",
            found: format!("'{}' (not a field of {})", name, layout.name()),
        })?;
        // SAFETY: field offsets were validated against the layout size.
        write_value(rt, &field.ty, value, unsafe { dst.add(field.offset) }, frame)?;
    }
    Ok(())
}

fn copy_struct(layout: &StructLayout, source: &NativeBox, dst: *mut u8) -> Result<()> {
    if layout.size() == 0 {
        return Err(Error::descriptor(format!(
            "struct '{}' has no known size and cannot be copied",
            layout.name()
        )));
    }
    if let Some(available) = source.size() {
        if available < layout.size() {
            return Err(Error::Marshal {
                expected: "struct-sized buffer",
                found: format!(
                    "{}-byte {} for {}-byte '{}'",
                    available,
                    source.type_name(),
                    layout.size(),
                    layout.name()
                ),
            });
        }
    }
    // SAFETY: the box holds at least `layout.size()` bytes of this struct.
    unsafe { core::ptr::copy(source.as_ptr() as *const u8, dst, layout.size()) };
    Ok(())
}

fn write_c_array(
    rt: &Runtime,
    array: &ArrayType,
    items: &[Value],
    frame: &mut CallFrame,
) -> Result<*mut u8> {
    let slots = match array.length() {
        ArrayLength::ZeroTerminated => items.len() + 1,
        ArrayLength::Fixed(n) if n == items.len() => n,
        ArrayLength::Fixed(n) => {
            return Err(Error::Marshal {
                expected: "fixed-length array",
                found: format!("{} items for a length of {}", items.len(), n),
            })
        }
    };

    let stride = array.stride();
    let item = array.item();
    let bytes = stride * slots;
    let buf = if array.ownership().is_full() {
        owned_alloc(rt.hooks(), bytes, frame)?
    } else {
        frame.alloc(rt.hooks(), bytes, item.native_align())?
    };

    for (i, value) in items.iter().enumerate() {
        if value.is_null() && array.length() == ArrayLength::ZeroTerminated {
            return Err(Error::marshal("non-null item in a zero-terminated array", "null"));
        }
        // SAFETY: `i < slots` and each slot is `stride` bytes.
        write_value(rt, item, value, unsafe { buf.add(i * stride) }, frame)?;
    }
    Ok(buf)
}

fn write_list(
    rt: &Runtime,
    array: &ArrayType,
    items: &[Value],
    frame: &mut CallFrame,
) -> Result<*mut u8> {
    let doubly = array.list() == ListKind::GList;
    let cell_size = if doubly { 3 * PTR_SIZE } else { 2 * PTR_SIZE };
    let mut head: *mut u8 = core::ptr::null_mut();
    let mut prev: *mut u8 = core::ptr::null_mut();

    for value in items {
        let cell = if array.ownership().is_full() {
            owned_alloc(rt.hooks(), cell_size, frame)?
        } else {
            frame.alloc(rt.hooks(), cell_size, PTR_ALIGN)?
        };
        write_list_item(rt, array.item(), value, cell, frame)?;

        // SAFETY: cells are `cell_size` bytes laid out {data, next[, prev]}.
        unsafe {
            if prev.is_null() {
                head = cell;
            } else {
                write_ptr(prev.add(PTR_SIZE), cell as *const c_void);
            }
            if doubly {
                write_ptr(cell.add(2 * PTR_SIZE), prev as *const c_void);
            }
        }
        prev = cell;
    }
    Ok(head)
}

/// List data slots hold a pointer, or an integer stored as one
fn write_list_item(
    rt: &Runtime,
    item: &FfiType,
    value: &Value,
    slot: *mut u8,
    frame: &mut CallFrame,
) -> Result<()> {
    if item.is_pointer_shaped() {
        return write_value(rt, item, value, slot, frame);
    }
    let bits = match (item, value) {
        (FfiType::Boolean, Value::Bool(b)) => *b as u64,
        _ => int_bits(value)?,
    };
    // SAFETY: `slot` is the pointer-sized data field of a list cell.
    unsafe { write_ptr(slot, bits as isize as *const c_void) };
    Ok(())
}

// ============================================================================
// Inbound
// ============================================================================

/// Convert the native value at `src` into a managed one
pub(crate) fn read_value(
    rt: &Runtime,
    ty: &FfiType,
    src: *const u8,
    transfer: Transfer,
) -> Result<Value> {
    trace!(kind = ty.kind_name(), ?transfer, "marshal in");
    let hooks = rt.hooks();

    // SAFETY (whole match): `src` holds a native value of type `ty`.
    unsafe {
        match ty {
            FfiType::Void => Ok(Value::Null),
            FfiType::Boolean => Ok(Value::Bool((src as *const i32).read_unaligned() != 0)),
            FfiType::Int { width, unsigned } => Ok(read_int(src, *width, *unsigned)),
            FfiType::Float(FloatWidth::F32) => {
                Ok(Value::Float((src as *const f32).read_unaligned() as f64))
            }
            FfiType::Float(FloatWidth::F64) => Ok(Value::Float((src as *const f64).read_unaligned())),

            FfiType::String { ownership } => {
                let ptr = read_ptr(src);
                if ptr.is_null() {
                    return Ok(Value::Null);
                }
                let s = CStr::from_ptr(ptr as *const c_char).to_string_lossy().into_owned();
                if transfer.owns(*ownership) {
                    (hooks.free)(ptr);
                }
                Ok(Value::String(s))
            }

            FfiType::Struct {
                layout,
                ownership,
                by_value,
            } => {
                if *by_value {
                    return read_record(rt, layout, src).map(Value::Record);
                }
                let Some(handle) = NativeHandle::new(read_ptr(src)) else {
                    return Ok(Value::Null);
                };
                let release = if transfer.owns(*ownership) {
                    BoxRelease::Free
                } else {
                    BoxRelease::None
                };
                // Opaque layouts declared with size 0 do not bound the memory
                let size = Some(layout.size()).filter(|&n| n != 0);
                Ok(Value::Boxed(Rc::new(NativeBox::new(
                    handle,
                    layout.name().into(),
                    size,
                    release,
                    rt.releases().clone(),
                ))))
            }

            FfiType::Boxed { boxed, ownership } => {
                let Some(handle) = NativeHandle::new(read_ptr(src)) else {
                    return Ok(Value::Null);
                };
                let release = if transfer.owns(*ownership) {
                    BoxRelease::BoxedFree(rt.boxed_gtype(boxed)?)
                } else {
                    BoxRelease::None
                };
                Ok(Value::Boxed(Rc::new(NativeBox::new(
                    handle,
                    boxed.type_name.clone(),
                    None,
                    release,
                    rt.releases().clone(),
                ))))
            }

            FfiType::Object { ownership, class } => {
                let Some(handle) = NativeHandle::new(read_ptr(src)) else {
                    return Ok(Value::Null);
                };
                let ownership = if transfer.owns(*ownership) {
                    Ownership::Full
                } else {
                    Ownership::None
                };
                rt.registry()
                    .get_or_create(hooks, handle, ownership, class.as_deref(), None)
                    .map(Value::Object)
            }

            FfiType::Array(array) => {
                let head = read_ptr(src);
                if head.is_null() {
                    return Ok(Value::Null);
                }
                match array.list() {
                    ListKind::Array => read_c_array(rt, array, head as *mut u8, transfer),
                    ListKind::GList | ListKind::GSList => {
                        read_list(rt, array, head as *mut u8, transfer)
                    }
                }
            }

            FfiType::Ref(r) => {
                let cell = read_ptr(src);
                if cell.is_null() {
                    return Ok(Value::Null);
                }
                let inner = read_value(rt, r.inner(), cell as *const u8, transfer)?;
                Ok(Value::new_ref(inner))
            }

            FfiType::Callback(signature) => {
                let code = read_ptr(src);
                if code.is_null() {
                    return Ok(Value::Null);
                }
                native_callback(rt, signature, code).map(Value::Callback)
            }
        }
    }
}

fn read_record(rt: &Runtime, layout: &StructLayout, src: *const u8) -> Result<Record> {
    let mut record = Record::new();
    for field in layout.fields() {
        // SAFETY: field offsets lie inside the struct at `src`.
        let value = read_value(rt, &field.ty, unsafe { src.add(field.offset) }, Transfer::Borrowed)?;
        record.set(field.name.to_string(), value);
    }
    Ok(record)
}

/// Items of an owned container are owned per their own descriptor;
/// items of a borrowed one are borrowed.
fn item_transfer(array: &ArrayType, transfer: Transfer) -> Transfer {
    if transfer.owns(array.ownership()) {
        Transfer::Declared
    } else {
        Transfer::Borrowed
    }
}

fn read_c_array(
    rt: &Runtime,
    array: &ArrayType,
    base: *mut u8,
    transfer: Transfer,
) -> Result<Value> {
    let stride = array.stride();
    let item_transfer = item_transfer(array, transfer);
    let mut items = Vec::new();

    // SAFETY: `base` points to items of `stride` bytes, terminated or of
    // the declared fixed length.
    unsafe {
        match array.length() {
            ArrayLength::Fixed(n) => {
                items.reserve(n);
                for i in 0..n {
                    items.push(read_value(rt, array.item(), base.add(i * stride), item_transfer)?);
                }
            }
            ArrayLength::ZeroTerminated => {
                let mut slot = base as *const u8;
                while !is_zeroed(slot, stride) {
                    items.push(read_value(rt, array.item(), slot, item_transfer)?);
                    slot = slot.add(stride);
                }
            }
        }

        if transfer.owns(array.ownership()) {
            (rt.hooks().free)(base as *mut c_void);
        }
    }

    Ok(Value::Array(items))
}

fn read_list(
    rt: &Runtime,
    array: &ArrayType,
    head: *mut u8,
    transfer: Transfer,
) -> Result<Value> {
    let item_transfer = item_transfer(array, transfer);
    let mut items = Vec::new();
    let mut cells = Vec::new();
    let mut cell = head;

    // SAFETY: `head` starts a well-formed GList/GSList; `next` follows `data`.
    unsafe {
        while !cell.is_null() {
            items.push(read_list_item(rt, array.item(), cell, item_transfer)?);
            cells.push(cell);
            cell = read_ptr(cell.add(PTR_SIZE)) as *mut u8;
        }

        if transfer.owns(array.ownership()) {
            let hooks = rt.hooks();
            let free_list = match array.list() {
                ListKind::GList => hooks.list_free,
                _ => hooks.slist_free,
            };
            match free_list {
                Some(free_list) => free_list(head as *mut c_void),
                None => cells.into_iter().for_each(|c| (hooks.free)(c as *mut c_void)),
            }
        }
    }

    Ok(Value::Array(items))
}

fn read_list_item(rt: &Runtime, item: &FfiType, slot: *const u8, transfer: Transfer) -> Result<Value> {
    if item.is_pointer_shaped() {
        return read_value(rt, item, slot, transfer);
    }
    // SAFETY: `slot` is the pointer-sized data field of a list cell.
    let raw = unsafe { read_ptr(slot) } as isize;
    Ok(match item {
        FfiType::Boolean => Value::Bool(raw != 0),
        FfiType::Int { unsigned: true, .. } => Value::UInt(raw as usize as u64),
        _ => Value::Int(raw as i64),
    })
}

/// Managed callable for a native function pointer of a plain signature
fn native_callback(
    rt: &Runtime,
    signature: &Arc<CallbackType>,
    code: *mut c_void,
) -> Result<Callback> {
    if signature.trampoline() == Trampoline::Closure {
        return Err(Error::marshal(
            "plain function pointer",
            "closure-shaped native callback without its user_data",
        ));
    }

    let runtime = rt.downgrade();
    let signature = signature.clone();
    let code = code as usize;

    Ok(Callback::new(move |args: &[Value]| {
        let rt = Runtime::upgrade(&runtime).ok_or(Error::Stopped)?;
        if args.len() != signature.arg_types().len() {
            return Err(Error::Marshal {
                expected: "argument list",
                found: format!(
                    "{} arguments for a callback of {}",
                    args.len(),
                    signature.arg_types().len()
                ),
            }
            .into());
        }
        let typed: Vec<TypedArg> = signature
            .arg_types()
            .iter()
            .zip(args)
            .map(|(ty, value)| TypedArg::new(ty.clone(), value.clone()))
            .collect();
        // SAFETY: native code handed out this pointer under this signature.
        let value = unsafe { rt.call_ptr(code as *const c_void, &typed, signature.return_type())? };
        Ok(value)
    }))
}

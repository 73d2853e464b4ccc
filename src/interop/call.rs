//! Call dispatcher - one native call from typed managed arguments
//!
//! Design: every call builds its own `CallFrame`, so a handler that calls
//! back into native code from inside a trampoline gets fresh scratch and
//! never clobbers the frame of the call it interrupted. libffi does the
//! register/stack classification; descriptors only decide what bytes go in
//! each slot.

use super::abi::{self, CallingConvention, StructPassing};
use super::marshal::{read_value, write_callback_arg, write_value, Transfer};
use super::memory::CallFrame;
use crate::error::{Error, Result};
use crate::logging::{log_ffi_call, log_ffi_return, perf, trace};
use crate::runtime::Runtime;
use crate::types::{FfiType, Trampoline};
use crate::value::Value;
use core::ffi::c_void;
use libffi::middle::{Cif, CodePtr};
use libffi::raw;

const PTR_SIZE: usize = core::mem::size_of::<*const c_void>();
const PTR_ALIGN: usize = core::mem::align_of::<*const c_void>();

/// Argument value with the descriptor it is marshalled under
#[derive(Debug, Clone)]
pub struct TypedArg {
    pub ty: FfiType,
    pub value: Value,
}

impl TypedArg {
    #[inline]
    pub fn new(ty: FfiType, value: impl Into<Value>) -> Self {
        Self {
            ty,
            value: value.into(),
        }
    }
}

/// Deferred native call (property setters, batched updates)
#[derive(Debug, Clone)]
pub struct NativeCall {
    pub library: String,
    pub symbol: String,
    pub args: Vec<TypedArg>,
    pub return_type: FfiType,
}

impl NativeCall {
    /// Call returning `void`
    pub fn new(library: impl Into<String>, symbol: impl Into<String>, args: Vec<TypedArg>) -> Self {
        Self {
            library: library.into(),
            symbol: symbol.into(),
            args,
            return_type: FfiType::Void,
        }
    }

    pub fn returning(mut self, return_type: FfiType) -> Self {
        self.return_type = return_type;
        self
    }
}

impl Runtime {
    /// Call `symbol` in `library` and marshal its return value.
    ///
    /// Drains the deferred release queue first, so this is a safe point.
    pub fn call(
        &self,
        library: &str,
        symbol: &str,
        args: &[TypedArg],
        return_type: &FfiType,
    ) -> Result<Value> {
        self.ensure_running()?;
        self.drain_releases();

        let code = self.libraries().symbol(library, symbol)?;
        log_ffi_call(library, symbol, args.len());

        // SAFETY: the descriptors are the generator's statement of the
        // symbol's C signature.
        let value = unsafe { self.dispatch(code, args, return_type)? };
        log_ffi_return(symbol, return_type.kind_name());
        Ok(value)
    }

    /// Call an already-resolved entry point.
    ///
    /// # Safety
    /// `code` must be a function whose C signature matches `args` and
    /// `return_type`.
    pub unsafe fn call_ptr(
        &self,
        code: *const c_void,
        args: &[TypedArg],
        return_type: &FfiType,
    ) -> Result<Value> {
        self.ensure_running()?;
        if code.is_null() {
            return Err(Error::descriptor("call through a null function pointer"));
        }
        self.drain_releases();
        self.dispatch(code, args, return_type)
    }

    /// Issue several void calls in order, stopping at the first failure
    pub fn batch_call(&self, calls: &[NativeCall]) -> Result<()> {
        let _guard = perf::track("batch_call");
        for call in calls {
            self.call(&call.library, &call.symbol, &call.args, &call.return_type)?;
        }
        Ok(())
    }

    unsafe fn dispatch(
        &self,
        code: *const c_void,
        args: &[TypedArg],
        return_type: &FfiType,
    ) -> Result<Value> {
        let mut frame = CallFrame::transient();
        let result = self.invoke_in(&mut frame, code, args, return_type);

        // Call-scoped callbacks end with the call, failed or not.
        for registration in frame.take_scoped() {
            self.trampolines().retire(registration);
        }
        result
    }

    unsafe fn invoke_in(
        &self,
        frame: &mut CallFrame,
        code: *const c_void,
        args: &[TypedArg],
        return_type: &FfiType,
    ) -> Result<Value> {
        let mut types = Vec::with_capacity(args.len());
        for arg in args {
            abi::arg_types(&arg.ty, &mut types)?;
        }
        let cif = Cif::new(types, abi::ffi_type(return_type)?);

        let mut slots: Vec<*mut c_void> = Vec::with_capacity(args.len() + 1);
        let ret = match self.marshal_args(frame, args, return_type, &mut slots) {
            Ok(ret) => ret,
            Err(err) => {
                // Nothing reached the callee; take back every `full` transfer.
                self.abandon(frame);
                return Err(err);
            }
        };

        let code = CodePtr(code as *mut c_void);
        raw::ffi_call(
            cif.as_raw_ptr(),
            Some(*code.as_safe_fun()),
            ret as *mut c_void,
            slots.as_mut_ptr(),
        );
        frame.settle();
        abi::narrow_return(return_type, ret);

        let value = read_value(self, return_type, ret, Transfer::Declared)?;

        for pending in frame.take_refs() {
            let updated = read_value(self, &pending.inner, pending.cell, Transfer::Declared)?;
            *pending.target.borrow_mut() = updated;
        }

        Ok(value)
    }

    /// Fill one slot per native argument and return the return buffer
    unsafe fn marshal_args(
        &self,
        frame: &mut CallFrame,
        args: &[TypedArg],
        return_type: &FfiType,
        slots: &mut Vec<*mut c_void>,
    ) -> Result<*mut u8> {
        let hooks = self.hooks();
        for (index, arg) in args.iter().enumerate() {
            let size = abi::arg_slot_size(&arg.ty);
            let slot = frame.alloc(hooks, size, arg.ty.native_align().max(PTR_ALIGN))?;

            match &arg.ty {
                FfiType::Callback(signature) => {
                    write_callback_arg(self, signature, &arg.value, slot, frame)?;
                    slots.push(slot as *mut c_void);
                    if signature.trampoline() == Trampoline::Closure {
                        slots.push(slot.add(PTR_SIZE) as *mut c_void);
                    }
                }
                FfiType::Struct {
                    layout,
                    by_value: true,
                    ..
                } => {
                    let passing = CallingConvention::current().struct_passing(layout);
                    trace!(
                        index,
                        layout = layout.name(),
                        size = layout.size(),
                        hidden_pointer = passing == StructPassing::HiddenPointer,
                        "struct argument by value"
                    );
                    write_value(self, &arg.ty, &arg.value, slot, frame)?;
                    slots.push(slot as *mut c_void);
                }
                ty => {
                    write_value(self, ty, &arg.value, slot, frame)?;
                    slots.push(slot as *mut c_void);
                }
            }
        }

        frame.alloc(
            hooks,
            abi::return_slot_size(return_type),
            return_type.native_align().max(PTR_ALIGN),
        )
    }
}

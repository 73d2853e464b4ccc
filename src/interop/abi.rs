//! ABI mapping - descriptors to libffi types
//!
//! libffi performs the actual register/stack classification; this module
//! maps descriptors onto its type model, widens and narrows small integer
//! returns, and reports how the platform passes a struct by value.
//!
//! `CallingConvention::struct_passing` is diagnostic only. It feeds trace
//! output for by-value struct arguments and never decides how bytes are
//! laid out; the `Cif` built from `struct_type` does that.

use crate::error::{Error, Result};
use crate::types::{align_up, FfiType, FloatWidth, IntWidth, StructLayout, Trampoline};
use libffi::middle::Type;

const POINTER_SIZE: usize = core::mem::size_of::<*const ()>();

/// Size of libffi's widened integer return slot (`ffi_arg`)
pub const FFI_ARG_SIZE: usize = core::mem::size_of::<usize>();

/// Calling convention of the current target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallingConvention {
    /// C calling convention (platform default)
    C,
    /// System V AMD64 ABI (Unix x86-64)
    SysV,
    /// Microsoft x64 calling convention (Windows)
    Win64,
    /// ARM AAPCS (ARM 32-bit)
    Aapcs,
    /// ARM64 calling convention
    Aarch64,
}

impl CallingConvention {
    /// Convention libffi selects for this target
    #[inline]
    pub const fn current() -> Self {
        #[cfg(all(target_arch = "x86_64", target_os = "windows"))]
        return Self::Win64;

        #[cfg(all(target_arch = "x86_64", not(target_os = "windows")))]
        return Self::SysV;

        #[cfg(target_arch = "aarch64")]
        return Self::Aarch64;

        #[cfg(target_arch = "arm")]
        return Self::Aapcs;

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "arm"
        )))]
        return Self::C;
    }

    /// Size-based estimate of how a struct of `layout` travels as an
    /// argument or return value. Only logged; libffi classifies the real call.
    pub fn struct_passing(self, layout: &StructLayout) -> StructPassing {
        let size = layout.size();
        match self {
            Self::SysV if size <= 16 => StructPassing::Registers,
            Self::Win64 if matches!(size, 1 | 2 | 4 | 8) => StructPassing::Registers,
            Self::Aarch64 if size <= 16 || is_homogeneous_float(layout) => StructPassing::Registers,
            Self::Aapcs if size <= 4 => StructPassing::Registers,
            _ => StructPassing::HiddenPointer,
        }
    }
}

impl Default for CallingConvention {
    #[inline]
    fn default() -> Self {
        Self::current()
    }
}

/// Placement decision for a struct passed by value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructPassing {
    /// Packed into argument / return registers
    Registers,
    /// Copied to a temporary whose address is passed instead
    HiddenPointer,
}

/// Up to four float fields of one width (AArch64 HFA)
fn is_homogeneous_float(layout: &StructLayout) -> bool {
    let fields = layout.fields();
    if fields.is_empty() || fields.len() > 4 {
        return false;
    }
    let first = match &fields[0].ty {
        FfiType::Float(w) => *w,
        _ => return false,
    };
    fields.iter().all(|f| f.ty == FfiType::Float(first))
}

/// libffi type for one descriptor in a call frame
pub fn ffi_type(ty: &FfiType) -> Result<Type> {
    Ok(match ty {
        FfiType::Void => Type::void(),
        FfiType::Boolean => Type::i32(),
        FfiType::Int { width, unsigned } => int_type(*width, *unsigned),
        FfiType::Float(FloatWidth::F32) => Type::f32(),
        FfiType::Float(FloatWidth::F64) => Type::f64(),
        FfiType::Struct { layout, by_value: true, .. } => struct_type(layout)?,
        _ => Type::pointer(),
    })
}

fn int_type(width: IntWidth, unsigned: bool) -> Type {
    match (width, unsigned) {
        (IntWidth::W8, false) => Type::i8(),
        (IntWidth::W8, true) => Type::u8(),
        (IntWidth::W16, false) => Type::i16(),
        (IntWidth::W16, true) => Type::u16(),
        (IntWidth::W32, false) => Type::i32(),
        (IntWidth::W32, true) => Type::u32(),
        (IntWidth::W64, false) => Type::i64(),
        (IntWidth::W64, true) => Type::u64(),
    }
}

/// libffi struct type whose natural layout must reproduce `layout` exactly
pub fn struct_type(layout: &StructLayout) -> Result<Type> {
    let mut offset = 0usize;
    let mut members = Vec::with_capacity(layout.fields().len());

    for field in layout.fields() {
        offset = align_up(offset, field.ty.native_align());
        if offset != field.offset {
            return Err(Error::descriptor(format!(
                "struct '{}' places '{}' at {} but the C ABI would use {}",
                layout.name(),
                field.name,
                field.offset,
                offset
            )));
        }
        members.push(ffi_type(&field.ty)?);
        offset += field.ty.native_size();
    }

    if align_up(offset, layout.align()) != layout.size() {
        return Err(Error::descriptor(format!(
            "struct '{}' has trailing bytes the C ABI cannot express",
            layout.name()
        )));
    }

    Ok(Type::structure(members))
}

/// Native argument types for one declared argument
///
/// A closure-shaped callback supplies its function pointer and the
/// `user_data` pointer that follows it.
pub fn arg_types(ty: &FfiType, out: &mut Vec<Type>) -> Result<()> {
    match ty {
        FfiType::Void => Err(Error::descriptor("void is not an argument type")),
        FfiType::Callback(cb) if cb.trampoline() == Trampoline::Closure => {
            out.push(Type::pointer());
            out.push(Type::pointer());
            Ok(())
        }
        other => {
            out.push(ffi_type(other)?);
            Ok(())
        }
    }
}

/// Bytes occupied by an argument's slot(s) in the frame
pub fn arg_slot_size(ty: &FfiType) -> usize {
    match ty {
        FfiType::Callback(cb) if cb.trampoline() == Trampoline::Closure => 2 * POINTER_SIZE,
        other => other.native_size().max(1),
    }
}

/// Bytes to reserve for a return value (libffi writes at least one `ffi_arg`)
pub fn return_slot_size(ty: &FfiType) -> usize {
    ty.native_size().max(FFI_ARG_SIZE).max(core::mem::size_of::<u64>())
}

/// True when libffi widens this return type to a full `ffi_arg`
#[inline]
fn is_widened(ty: &FfiType) -> bool {
    match ty {
        FfiType::Boolean => 4 < FFI_ARG_SIZE,
        FfiType::Int { width, .. } => width.bytes() < FFI_ARG_SIZE,
        _ => false,
    }
}

/// Rewrite a widened integer return in place as its declared width
///
/// # Safety
/// `slot` must hold `return_slot_size(ty)` bytes written by `ffi_call`.
pub unsafe fn narrow_return(ty: &FfiType, slot: *mut u8) {
    if !is_widened(ty) {
        return;
    }
    let word = (slot as *const usize).read_unaligned() as u64;
    core::ptr::write_bytes(slot, 0, FFI_ARG_SIZE);
    let width = match ty {
        FfiType::Int { width, .. } => *width,
        _ => IntWidth::W32,
    };
    super::memory::write_int(slot, width, word);
}

/// Widen a declared-width integer into the `ffi_arg` a closure must return
///
/// # Safety
/// `slot` must hold at least `FFI_ARG_SIZE` bytes holding a value of `ty`.
pub unsafe fn widen_return(ty: &FfiType, slot: *mut u8) {
    if !is_widened(ty) {
        return;
    }
    let (width, unsigned) = match ty {
        FfiType::Int { width, unsigned } => (*width, *unsigned),
        _ => (IntWidth::W32, false),
    };
    let word = match super::memory::read_int(slot, width, unsigned) {
        crate::value::Value::Int(v) => v as isize as usize,
        crate::value::Value::UInt(v) => v as usize,
        _ => 0,
    };
    (slot as *mut usize).write_unaligned(word);
}

//! Interoperability - native calls driven by type descriptors
//!
//! Design: descriptors decide the bytes, libffi decides the registers.
//!
//! Architecture:
//! - `marshal.rs` - managed value ↔ native memory, per descriptor kind
//! - `memory.rs` - call frames, native allocation, raw slot access
//! - `abi.rs` - descriptor → libffi type, calling convention, return widening
//! - `library.rs` - shared library and symbol caches
//! - `call.rs` - `Runtime::call`, `call_ptr`, `batch_call`

pub mod abi;
mod call;
mod library;
pub(crate) mod marshal;
pub(crate) mod memory;

pub use abi::{CallingConvention, StructPassing};
pub use call::{NativeCall, TypedArg};
pub use library::{LibraryCache, SELF_LIBRARY};

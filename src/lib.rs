//! gir-bridge - FFI marshalling and ownership runtime for GObject toolkits
//!
//! Generated bindings describe every native value with an `FfiType` and
//! call through a `Runtime`, which marshals arguments, tracks object
//! identity and ownership, and routes native callbacks back to managed
//! handlers.

pub mod callback;
pub mod config;
pub mod error;
pub mod hooks;
pub mod interop;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod types;
pub mod value;

// Re-export commonly used items
pub use callback::HandlerId;
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use hooks::NativeHooks;
pub use interop::{NativeCall, TypedArg, SELF_LIBRARY};
pub use registry::{
    NativeBox, NativeHandle, NativeObject, PropertyAccessor, PropertyTable, WrapperClass,
};
pub use runtime::Runtime;
pub use types::{
    ArrayLength, BoxedType, CallbackScope, FfiType, IntWidth, ListKind, Ownership, StructLayout,
    Trampoline,
};
pub use value::{Callback, HandlerResult, Record, Value};

#[cfg(test)]
pub(crate) mod testing;

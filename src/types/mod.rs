//! Type descriptor model
//!
//! Pure data describing how one value crosses the native boundary:
//! - `descriptor.rs` - `FfiType` tagged union and factory helpers
//! - `layout.rs` - C struct layouts
//! - `raw.rs` - serialized (generator) form with fail-fast validation

mod descriptor;
mod layout;
mod raw;

pub use descriptor::{
    ArrayLength, ArrayType, BoxedType, CallbackScope, CallbackType, FfiType, FloatWidth, IntWidth,
    ListKind, Ownership, RefType, Trampoline,
};
pub use layout::{StructField, StructLayout};
pub use raw::{RawFfiType, RawField};

pub(crate) use layout::align_up;

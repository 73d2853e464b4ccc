//! Type descriptors - the marshalling rule for one value
//!
//! Design: closed tagged union, immutable once built. Composite variants
//! (`Array`, `Ref`, `Callback`) wrap private structs so the only way to get
//! one is through a validating constructor.

use super::layout::StructLayout;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const POINTER_SIZE: usize = core::mem::size_of::<*const ()>();
const POINTER_ALIGN: usize = core::mem::align_of::<*const ()>();

/// Ownership transfer tag carried by every pointer-shaped descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    /// Receiver must eventually release the value
    Full,
    /// Borrowed: receiver never releases it
    None,
}

impl Ownership {
    #[inline]
    pub const fn is_full(self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Integer bit width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IntWidth {
    W8 = 8,
    W16 = 16,
    W32 = 32,
    W64 = 64,
}

impl IntWidth {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            8 => Ok(Self::W8),
            16 => Ok(Self::W16),
            32 => Ok(Self::W32),
            64 => Ok(Self::W64),
            other => Err(Error::descriptor(format!("unsupported int width {}", other))),
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    #[inline]
    pub const fn bytes(self) -> usize {
        self as usize / 8
    }
}

/// Floating point width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatWidth {
    F32,
    F64,
}

impl FloatWidth {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            32 => Ok(Self::F32),
            64 => Ok(Self::F64),
            other => Err(Error::descriptor(format!("unsupported float width {}", other))),
        }
    }

    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Container traversal for array descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    /// Contiguous C array
    Array,
    /// Doubly linked `GList`
    GList,
    /// Singly linked `GSList`
    GSList,
}

/// How a C array's end is found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayLength {
    /// Terminated by a zero / null item
    ZeroTerminated,
    /// Exactly `n` items, no terminator
    Fixed(usize),
}

/// Native calling shape a callback is exposed as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trampoline {
    /// Native signature is exactly the declared argument list
    Plain,
    /// Declared arguments followed by a trailing `gpointer user_data`
    Closure,
}

/// How long a callback registration stays callable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackScope {
    /// Only during the call that receives it
    Call,
    /// Until its first invocation
    Async,
    /// Until explicitly disconnected or the runtime stops
    Forever,
}

/// GBoxed type identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoxedType {
    pub type_name: Arc<str>,
    /// Library holding `get_type`
    pub library: Option<Arc<str>>,
    /// `*_get_type` symbol; falls back to a by-name type lookup
    pub get_type: Option<Arc<str>>,
}

impl BoxedType {
    pub fn named(type_name: impl Into<Arc<str>>) -> Self {
        Self {
            type_name: type_name.into(),
            library: None,
            get_type: None,
        }
    }

    pub fn with_get_type(mut self, library: impl Into<Arc<str>>, symbol: impl Into<Arc<str>>) -> Self {
        self.library = Some(library.into());
        self.get_type = Some(symbol.into());
        self
    }
}

/// Array / list descriptor body
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayType {
    item: FfiType,
    list: ListKind,
    length: ArrayLength,
    ownership: Ownership,
}

impl ArrayType {
    #[inline]
    pub fn item(&self) -> &FfiType {
        &self.item
    }

    #[inline]
    pub fn list(&self) -> ListKind {
        self.list
    }

    #[inline]
    pub fn length(&self) -> ArrayLength {
        self.length
    }

    #[inline]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Distance between consecutive items of a C array
    #[inline]
    pub fn stride(&self) -> usize {
        self.item.native_size()
    }
}

/// Out-parameter descriptor body
#[derive(Debug, Clone, PartialEq)]
pub struct RefType {
    inner: FfiType,
}

impl RefType {
    #[inline]
    pub fn inner(&self) -> &FfiType {
        &self.inner
    }
}

/// Callback signature
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackType {
    trampoline: Trampoline,
    scope: CallbackScope,
    arg_types: Vec<FfiType>,
    return_type: FfiType,
}

impl CallbackType {
    #[inline]
    pub fn trampoline(&self) -> Trampoline {
        self.trampoline
    }

    #[inline]
    pub fn scope(&self) -> CallbackScope {
        self.scope
    }

    #[inline]
    pub fn arg_types(&self) -> &[FfiType] {
        &self.arg_types
    }

    #[inline]
    pub fn return_type(&self) -> &FfiType {
        &self.return_type
    }

    /// Argument count of the native signature, user data included
    pub fn native_arity(&self) -> usize {
        match self.trampoline {
            Trampoline::Plain => self.arg_types.len(),
            Trampoline::Closure => self.arg_types.len() + 1,
        }
    }
}

/// FFI type descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum FfiType {
    Void,
    /// `gboolean`: 32-bit int
    Boolean,
    Int { width: IntWidth, unsigned: bool },
    Float(FloatWidth),
    String { ownership: Ownership },
    Struct {
        layout: Arc<StructLayout>,
        ownership: Ownership,
        by_value: bool,
    },
    Boxed {
        boxed: Arc<BoxedType>,
        ownership: Ownership,
    },
    Object {
        ownership: Ownership,
        /// Wrapper class hint used when the runtime type is unknown
        class: Option<Arc<str>>,
    },
    Array(Arc<ArrayType>),
    Ref(Arc<RefType>),
    Callback(Arc<CallbackType>),
}

impl FfiType {
    // ------------------------------------------------------------------
    // Factory helpers
    // ------------------------------------------------------------------

    pub const fn void() -> Self {
        Self::Void
    }

    pub const fn boolean() -> Self {
        Self::Boolean
    }

    pub const fn int(width: IntWidth) -> Self {
        Self::Int { width, unsigned: false }
    }

    pub const fn uint(width: IntWidth) -> Self {
        Self::Int { width, unsigned: true }
    }

    pub const fn i32() -> Self {
        Self::int(IntWidth::W32)
    }

    pub const fn u32() -> Self {
        Self::uint(IntWidth::W32)
    }

    pub const fn i64() -> Self {
        Self::int(IntWidth::W64)
    }

    pub const fn u64() -> Self {
        Self::uint(IntWidth::W64)
    }

    pub const fn f32() -> Self {
        Self::Float(FloatWidth::F32)
    }

    pub const fn f64() -> Self {
        Self::Float(FloatWidth::F64)
    }

    pub const fn string(ownership: Ownership) -> Self {
        Self::String { ownership }
    }

    pub const fn object(ownership: Ownership) -> Self {
        Self::Object { ownership, class: None }
    }

    pub fn object_of(ownership: Ownership, class: impl Into<Arc<str>>) -> Self {
        Self::Object {
            ownership,
            class: Some(class.into()),
        }
    }

    pub fn boxed(boxed: BoxedType, ownership: Ownership) -> Self {
        Self::Boxed {
            boxed: Arc::new(boxed),
            ownership,
        }
    }

    /// Struct passed as a pointer to its memory
    pub fn struct_ptr(layout: Arc<StructLayout>, ownership: Ownership) -> Self {
        Self::Struct {
            layout,
            ownership,
            by_value: false,
        }
    }

    /// Struct copied into the call frame
    pub fn struct_value(layout: Arc<StructLayout>) -> Result<Self> {
        if layout.fields().is_empty() {
            return Err(Error::descriptor(format!(
                "struct '{}' has no field layout and cannot be passed by value",
                layout.name()
            )));
        }
        Ok(Self::Struct {
            layout,
            ownership: Ownership::None,
            by_value: true,
        })
    }

    /// Zero-terminated C array
    pub fn array(item: FfiType, ownership: Ownership) -> Result<Self> {
        Self::array_with(item, ListKind::Array, ArrayLength::ZeroTerminated, ownership)
    }

    /// C array of exactly `len` items
    pub fn fixed_array(item: FfiType, len: usize, ownership: Ownership) -> Result<Self> {
        Self::array_with(item, ListKind::Array, ArrayLength::Fixed(len), ownership)
    }

    pub fn glist(item: FfiType, ownership: Ownership) -> Result<Self> {
        Self::array_with(item, ListKind::GList, ArrayLength::ZeroTerminated, ownership)
    }

    pub fn gslist(item: FfiType, ownership: Ownership) -> Result<Self> {
        Self::array_with(item, ListKind::GSList, ArrayLength::ZeroTerminated, ownership)
    }

    pub fn array_with(
        item: FfiType,
        list: ListKind,
        length: ArrayLength,
        ownership: Ownership,
    ) -> Result<Self> {
        match &item {
            Self::Void => return Err(Error::descriptor("array item type cannot be void")),
            Self::Callback(_) => {
                return Err(Error::descriptor("arrays of callbacks are not supported"))
            }
            Self::Ref(_) => return Err(Error::descriptor("arrays of ref cells are not supported")),
            _ => {}
        }

        if list != ListKind::Array {
            if !(item.is_pointer_shaped() || matches!(item, Self::Int { .. } | Self::Boolean)) {
                return Err(Error::descriptor(format!(
                    "{:?} items cannot be stored in a linked list",
                    item.kind_name()
                )));
            }
            if length != ArrayLength::ZeroTerminated {
                return Err(Error::descriptor("linked lists have no fixed length"));
            }
        }

        Ok(Self::Array(Arc::new(ArrayType {
            item,
            list,
            length,
            ownership,
        })))
    }

    /// Out-parameter cell holding `inner`
    pub fn reference(inner: FfiType) -> Result<Self> {
        match inner {
            Self::Void => Err(Error::descriptor("ref of void")),
            Self::Callback(_) => Err(Error::descriptor("ref of callback is not supported")),
            inner => Ok(Self::Ref(Arc::new(RefType { inner }))),
        }
    }

    pub fn callback(
        trampoline: Trampoline,
        scope: CallbackScope,
        arg_types: Vec<FfiType>,
        return_type: FfiType,
    ) -> Result<Self> {
        for ty in arg_types.iter().chain(core::iter::once(&return_type)) {
            if let Self::Ref(_) = ty {
                return Err(Error::descriptor("callbacks cannot declare ref parameters"));
            }
        }
        if arg_types.iter().any(|t| matches!(t, Self::Void)) {
            return Err(Error::descriptor("callback argument cannot be void"));
        }
        Ok(Self::Callback(Arc::new(CallbackType {
            trampoline,
            scope,
            arg_types,
            return_type,
        })))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Short kind tag, as used by the serialized form
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Boolean => "boolean",
            Self::Int { .. } => "int",
            Self::Float(_) => "float",
            Self::String { .. } => "string",
            Self::Struct { .. } => "struct",
            Self::Boxed { .. } => "boxed",
            Self::Object { .. } => "object",
            Self::Array(_) => "array",
            Self::Ref(_) => "ref",
            Self::Callback(_) => "callback",
        }
    }

    /// Ownership tag, for kinds that carry one
    pub fn ownership(&self) -> Option<Ownership> {
        match self {
            Self::String { ownership }
            | Self::Struct { ownership, .. }
            | Self::Boxed { ownership, .. }
            | Self::Object { ownership, .. } => Some(*ownership),
            Self::Array(array) => Some(array.ownership),
            _ => None,
        }
    }

    /// Can be stored in a struct field by a raw memory write
    #[inline]
    pub const fn is_primitive_field(&self) -> bool {
        matches!(self, Self::Boolean | Self::Int { .. } | Self::Float(_))
    }

    /// Occupies one pointer in the native frame
    pub const fn is_pointer_shaped(&self) -> bool {
        match self {
            Self::String { .. }
            | Self::Boxed { .. }
            | Self::Object { .. }
            | Self::Array(_)
            | Self::Ref(_)
            | Self::Callback(_) => true,
            Self::Struct { by_value, .. } => !*by_value,
            _ => false,
        }
    }

    /// Size of the native representation in bytes
    pub fn native_size(&self) -> usize {
        match self {
            Self::Void => 0,
            Self::Boolean => 4,
            Self::Int { width, .. } => width.bytes(),
            Self::Float(width) => width.bytes(),
            Self::Struct { layout, by_value: true, .. } => layout.size(),
            _ => POINTER_SIZE,
        }
    }

    /// Alignment of the native representation
    pub fn native_align(&self) -> usize {
        match self {
            Self::Void => 1,
            Self::Boolean => 4,
            Self::Int { width: IntWidth::W64, .. } => core::mem::align_of::<u64>(),
            Self::Int { width, .. } => width.bytes(),
            Self::Float(FloatWidth::F64) => core::mem::align_of::<f64>(),
            Self::Float(FloatWidth::F32) => 4,
            Self::Struct { layout, by_value: true, .. } => layout.align(),
            _ => POINTER_ALIGN,
        }
    }
}

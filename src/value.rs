//! Managed values - the binding-side representation of native data
//!
//! Design: what a generated wrapper hands to `call` and gets back. Absence
//! (null pointers, void) is `Value::Null`; identity-bearing values are `Rc`s
//! so `Rc::ptr_eq` mirrors native identity.

use crate::registry::{NativeBox, NativeObject};
use core::cell::RefCell;
use core::fmt;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Result of a managed handler invoked from native code
pub type HandlerResult = Result<Value, Box<dyn std::error::Error>>;

/// Managed value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Object(Rc<NativeObject>),
    Boxed(Rc<NativeBox>),
    Record(Record),
    Array(Vec<Value>),
    Ref(Rc<RefCell<Value>>),
    Callback(Callback),
}

impl Value {
    /// Fresh ref cell for an out-parameter
    pub fn new_ref(initial: Value) -> Self {
        Self::Ref(Rc::new(RefCell::new(initial)))
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of any numeric value (floats truncate)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => Some(*v as i64),
            Self::Float(v) => Some(*v as i64),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(v) => Some(*v as u64),
            Self::UInt(v) => Some(*v),
            Self::Float(v) => Some(*v as u64),
            Self::Bool(b) => Some(*b as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Rc<NativeObject>> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_boxed(&self) -> Option<&Rc<NativeBox>> {
        match self {
            Self::Boxed(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Current content of a ref cell
    pub fn deref_cell(&self) -> Option<Value> {
        match self {
            Self::Ref(cell) => Some(cell.borrow().clone()),
            _ => None,
        }
    }

    /// Name used in marshalling errors and trace output
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Object(_) => "object",
            Self::Boxed(_) => "boxed",
            Self::Record(_) => "record",
            Self::Array(_) => "array",
            Self::Ref(_) => "ref",
            Self::Callback(_) => "callback",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(v) => write!(f, "Bool({})", v),
            Self::Int(v) => write!(f, "Int({})", v),
            Self::UInt(v) => write!(f, "UInt({})", v),
            Self::Float(v) => write!(f, "Float({})", v),
            Self::String(s) => write!(f, "String({:?})", s),
            Self::Object(obj) => write!(f, "Object({}@{:?})", obj.class().name(), obj.handle()),
            Self::Boxed(b) => write!(f, "Boxed({}@{:?})", b.type_name(), b.as_ptr()),
            Self::Record(r) => f.debug_map().entries(r.fields.iter()).finish(),
            Self::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Self::Ref(cell) => write!(f, "Ref({:?})", cell.borrow()),
            Self::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::Boxed(a), Self::Boxed(b)) => a.as_ptr() == b.as_ptr(),
            (Self::Record(a), Self::Record(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => Rc::ptr_eq(a, b),
            (Self::Callback(a), Self::Callback(b)) => Rc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

macro_rules! impl_from {
    ($($t:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(
            impl From<$t> for Value {
                #[inline]
                fn from(v: $t) -> Self {
                    Self::$variant(v as $conv)
                }
            }
        )*
    };
}

impl_from! {
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u8 => UInt as u64,
    u16 => UInt as u64,
    u32 => UInt as u64,
    u64 => UInt as u64,
    f32 => Float as f64,
    f64 => Float as f64,
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Rc<NativeObject>> for Value {
    fn from(v: Rc<NativeObject>) -> Self {
        Self::Object(v)
    }
}

impl From<Option<Rc<NativeObject>>> for Value {
    fn from(v: Option<Rc<NativeObject>>) -> Self {
        v.map_or(Self::Null, Self::Object)
    }
}

impl From<Rc<NativeBox>> for Value {
    fn from(v: Rc<NativeBox>) -> Self {
        Self::Boxed(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Self::Record(v)
    }
}

impl From<Callback> for Value {
    fn from(v: Callback) -> Self {
        Self::Callback(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Managed struct value: field name → value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Managed handler invoked through a trampoline
#[derive(Clone)]
pub struct Callback(pub(crate) Rc<dyn Fn(&[Value]) -> HandlerResult>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> HandlerResult + 'static,
    {
        Self(Rc::new(f))
    }

    #[inline]
    pub fn invoke(&self, args: &[Value]) -> HandlerResult {
        (self.0)(args)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Rc::as_ptr(&self.0) as *const ())
    }
}

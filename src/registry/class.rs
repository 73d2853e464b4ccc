//! Wrapper classes and property tables
//!
//! Design: property access is table-driven. A generator emits one
//! `PropertyTable` per class (name → getter/setter pair); the runtime never
//! looks accessors up by reflection. Setters describe the native call they
//! need instead of performing it, so several can share one `batch_call`.

use super::object::NativeObject;
use crate::error::Result;
use crate::interop::NativeCall;
use crate::runtime::Runtime;
use crate::value::Value;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Reads a property by calling its native getter
pub type PropertyGetter = fn(&Runtime, &Rc<NativeObject>) -> Result<Value>;

/// Describes the native call that stores a property value
pub type PropertySetter = fn(&Rc<NativeObject>, Value) -> NativeCall;

/// Getter/setter pair for one property
#[derive(Clone, Copy, Default)]
pub struct PropertyAccessor {
    pub getter: Option<PropertyGetter>,
    pub setter: Option<PropertySetter>,
}

impl PropertyAccessor {
    pub fn read_write(getter: PropertyGetter, setter: PropertySetter) -> Self {
        Self {
            getter: Some(getter),
            setter: Some(setter),
        }
    }

    pub fn read_only(getter: PropertyGetter) -> Self {
        Self {
            getter: Some(getter),
            setter: None,
        }
    }

    pub fn write_only(setter: PropertySetter) -> Self {
        Self {
            getter: None,
            setter: Some(setter),
        }
    }
}

impl core::fmt::Debug for PropertyAccessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PropertyAccessor")
            .field("readable", &self.getter.is_some())
            .field("writable", &self.setter.is_some())
            .finish()
    }
}

/// Property name → accessor pair
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    entries: HashMap<Arc<str>, PropertyAccessor>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<Arc<str>>, accessor: PropertyAccessor) {
        self.entries.insert(name.into(), accessor);
    }

    pub fn get(&self, name: &str) -> Option<&PropertyAccessor> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Managed class a native instance is wrapped as
#[derive(Debug)]
pub struct WrapperClass {
    name: Arc<str>,
    parent: Option<Rc<WrapperClass>>,
    properties: PropertyTable,
}

impl WrapperClass {
    /// Root class (no parent)
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            properties: PropertyTable::new(),
        }
    }

    pub fn with_parent(mut self, parent: Rc<WrapperClass>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_property(mut self, name: impl Into<Arc<str>>, accessor: PropertyAccessor) -> Self {
        self.properties.insert(name, accessor);
        self
    }

    pub fn with_properties(mut self, properties: PropertyTable) -> Self {
        self.properties = properties;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Rc<WrapperClass>> {
        self.parent.as_ref()
    }

    /// Own properties only
    pub fn properties(&self) -> &PropertyTable {
        &self.properties
    }

    /// Accessor for `name`, searching parent classes
    pub fn property(&self, name: &str) -> Option<&PropertyAccessor> {
        self.ancestors().find_map(|class| class.properties.get(name))
    }

    pub fn is_subclass_of(&self, name: &str) -> bool {
        self.ancestors().any(|class| &*class.name == name)
    }

    /// This class followed by its parents, nearest first
    pub fn ancestors(&self) -> impl Iterator<Item = &WrapperClass> {
        core::iter::successors(Some(self), |class| class.parent.as_deref())
    }
}

//! Object identity registry - one managed wrapper per native instance
//!
//! Design: the registry maps handles to *weak* wrapper references. A wrapper
//! alone owns its lifetime; the registry only answers "is there already a
//! wrapper for this pointer". Dead entries are replaced on the next lookup
//! or swept by `prune`.
//!
//! Architecture:
//! - `handle.rs` - non-null native pointer newtype
//! - `object.rs` - `NativeObject` and `NativeBox` wrappers
//! - `class.rs` - wrapper classes and property tables
//! - `release.rs` - deferred release queue fed by wrapper drops

mod class;
mod handle;
mod object;
mod release;

#[cfg(test)]
mod tests;

pub use class::{PropertyAccessor, PropertyGetter, PropertySetter, PropertyTable, WrapperClass};
pub use handle::NativeHandle;
pub use object::{BoxRelease, NativeBox, NativeObject};
pub use release::{PendingRelease, ReleaseQueue};

use crate::error::Result;
use crate::hooks::NativeHooks;
use crate::logging::{debug, trace};
use crate::types::Ownership;
use core::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CStr;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Name of the class used when nothing more specific is known
pub const ROOT_CLASS: &str = "GObject";

/// Handle → wrapper association and wrapper class lookup
pub struct IdentityRegistry {
    entries: RefCell<HashMap<NativeHandle, Weak<NativeObject>>>,
    classes: RefCell<HashMap<Arc<str>, Rc<WrapperClass>>>,
    root: Rc<WrapperClass>,
    releases: Arc<ReleaseQueue>,
}

impl IdentityRegistry {
    pub fn new(releases: Arc<ReleaseQueue>) -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
            classes: RefCell::new(HashMap::new()),
            root: Rc::new(WrapperClass::new(ROOT_CLASS)),
            releases,
        }
    }

    /// Make `class` the wrapper class for instances of that native type name
    pub fn register_class(&self, class: Rc<WrapperClass>) {
        let name: Arc<str> = class.name().into();
        self.classes.borrow_mut().insert(name, class);
    }

    pub fn class(&self, name: &str) -> Option<Rc<WrapperClass>> {
        self.classes.borrow().get(name).cloned()
    }

    #[inline]
    pub fn root_class(&self) -> &Rc<WrapperClass> {
        &self.root
    }

    /// Live wrapper for `handle`, if any
    pub fn lookup(&self, handle: NativeHandle) -> Option<Rc<NativeObject>> {
        self.entries.borrow().get(&handle).and_then(Weak::upgrade)
    }

    /// Return the wrapper for `handle`, creating it on first sight.
    ///
    /// `ownership` describes the reference the caller received:
    /// - `Full`: the caller owns one reference, which the wrapper adopts. If a
    ///   wrapper already exists it holds its own, so the extra is released.
    /// - `None`: borrowed; a new wrapper takes its own reference with
    ///   `ref_sink` (which also claims a floating reference).
    pub fn get_or_create(
        &self,
        hooks: &NativeHooks,
        handle: NativeHandle,
        ownership: Ownership,
        hint: Option<&str>,
        class: Option<&Rc<WrapperClass>>,
    ) -> Result<Rc<NativeObject>> {
        if let Some(existing) = self.lookup(handle) {
            if ownership.is_full() {
                self.releases.push(PendingRelease::Unref(handle.addr()));
            }
            return Ok(existing);
        }

        if !ownership.is_full() {
            let ref_sink = NativeHooks::require(hooks.object_ref_sink, "object_ref_sink")?;
            // SAFETY: `handle` is a live instance handed to us by native code.
            unsafe { ref_sink(handle.as_ptr()) };
        }

        let class = self.resolve_class(hooks, handle, hint, class);
        trace!(handle = ?handle, class = class.name(), ?ownership, "wrapper created");

        let wrapper = Rc::new(NativeObject::new(handle, class, self.releases.clone()));
        self.entries
            .borrow_mut()
            .insert(handle, Rc::downgrade(&wrapper));
        Ok(wrapper)
    }

    /// Class for a new wrapper: registered class of the instance's runtime
    /// type, then the descriptor hint, then the caller's class, then the root.
    fn resolve_class(
        &self,
        hooks: &NativeHooks,
        handle: NativeHandle,
        hint: Option<&str>,
        class: Option<&Rc<WrapperClass>>,
    ) -> Rc<WrapperClass> {
        if let Some(type_name) = hooks.instance_type_name {
            // SAFETY: the hook returns a static, NUL-terminated type name or null.
            let name = unsafe { type_name(handle.as_ptr()) };
            if !name.is_null() {
                let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();
                if let Some(found) = self.class(&name) {
                    return found;
                }
            }
        }

        hint.and_then(|name| self.class(name))
            .or_else(|| class.cloned())
            .unwrap_or_else(|| self.root.clone())
    }

    /// Drop the registry's association for `handle` and detach its wrapper.
    ///
    /// Returns the wrapper if it was still alive; the caller owes the
    /// reference the wrapper was holding.
    pub fn remove(&self, handle: NativeHandle) -> Option<Rc<NativeObject>> {
        let wrapper = self.entries.borrow_mut().remove(&handle)?.upgrade()?;
        wrapper.detach();
        Some(wrapper)
    }

    /// Native side finalized the instance: forget it without releasing
    pub fn native_finalized(&self, handle: NativeHandle) -> bool {
        match self.remove(handle) {
            Some(_) => {
                debug!(handle = ?handle, "native instance finalized under a live wrapper");
                true
            }
            None => false,
        }
    }

    /// Number of handles with a live wrapper
    pub fn live_count(&self) -> usize {
        self.entries
            .borrow()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Remove dead entries, returning how many were swept
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|_, w| w.strong_count() > 0);
        before - entries.len()
    }

    /// Detach every live wrapper (runtime shutdown).
    ///
    /// Returns the handles whose references the caller now owes.
    pub fn detach_all(&self) -> Vec<NativeHandle> {
        let entries: Vec<_> = self.entries.borrow_mut().drain().collect();
        entries
            .into_iter()
            .filter_map(|(handle, weak)| {
                let wrapper = weak.upgrade()?;
                wrapper.detach();
                Some(handle)
            })
            .collect()
    }
}

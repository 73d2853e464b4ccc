//! Runtime context - the single owner of every binding-side table
//!
//! Design: no globals. Library caches, the identity registry, the trampoline
//! side table and the deferred release queue all live in one `Runtime`, so
//! independent runtimes can coexist (tests do this constantly). `Runtime` is
//! a cheap `Rc` handle and deliberately `!Send`: every entry point runs on
//! the toolkit's UI thread.
//!
//! Safe points: `call`, `call_ptr` and `tick` drain the deferred release
//! queue before doing anything else. Wrapper drops only ever enqueue.

use crate::callback::{HandlerId, SignalTable, TrampolineTable};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::hooks::{GetTypeFn, NativeHooks};
use crate::interop::marshal::{read_value, write_value, Transfer};
use crate::interop::memory::{native_alloc, CallFrame, Obligation};
use crate::interop::LibraryCache;
use crate::logging::{debug, info, log_release, warn};
use crate::registry::{
    BoxRelease, IdentityRegistry, NativeBox, NativeHandle, NativeObject, PendingRelease,
    ReleaseQueue, WrapperClass,
};
use crate::types::{BoxedType, FfiType, Ownership};
use crate::value::{Callback, Value};
use core::cell::{Cell, RefCell};
use core::ffi::c_void;
use std::collections::HashMap;
use std::ffi::CString;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Handle to one binding runtime
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    hooks: NativeHooks,
    libraries: LibraryCache,
    registry: IdentityRegistry,
    trampolines: TrampolineTable,
    signals: SignalTable,
    releases: Arc<ReleaseQueue>,
    /// Boxed type name → GType
    gtypes: RefCell<HashMap<Arc<str>, usize>>,
    running: Cell<bool>,
}

impl Runtime {
    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start with configuration from `$GIR_BRIDGE_CONFIG` (or defaults)
    pub fn start() -> Result<Self> {
        Ok(Self::start_with_config(RuntimeConfig::from_env()?))
    }

    /// Start with explicit configuration, resolving hooks if it asks to
    pub fn start_with_config(config: RuntimeConfig) -> Self {
        config.logging.apply();
        let libraries = LibraryCache::new(config.libraries.clone());
        let hooks = if config.resolve_hooks {
            NativeHooks::resolve(&config.hooks, &libraries)
        } else {
            NativeHooks::libc()
        };
        Self::assemble(config, hooks, libraries)
    }

    /// Start with an injected hook table (test doubles, static toolkits)
    pub fn start_with_hooks(config: RuntimeConfig, hooks: NativeHooks) -> Self {
        config.logging.apply();
        let libraries = LibraryCache::new(config.libraries.clone());
        Self::assemble(config, hooks, libraries)
    }

    fn assemble(config: RuntimeConfig, hooks: NativeHooks, libraries: LibraryCache) -> Self {
        let releases = Arc::new(ReleaseQueue::new());
        info!(?hooks, libraries = config.libraries.len(), "runtime started");
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                hooks,
                libraries,
                registry: IdentityRegistry::new(releases.clone()),
                trampolines: TrampolineTable::new(),
                signals: SignalTable::new(),
                releases,
                gtypes: RefCell::new(HashMap::new()),
                running: Cell::new(true),
            }),
        }
    }

    /// Disconnect every signal, release every wrapper's reference and free
    /// every trampoline. Idempotent; refused while a handler is running.
    pub fn stop(&self) -> Result<()> {
        if !self.inner.running.get() {
            return Ok(());
        }
        if self.inner.trampolines.in_dispatch() {
            return Err(Error::Registry(
                "the runtime cannot stop from inside a native callback".into(),
            ));
        }
        self.inner.shutdown();
        Ok(())
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Event-loop safe point: drain releases, then surface the oldest
    /// handler failure queued since the last tick.
    pub fn tick(&self) -> Result<()> {
        self.ensure_running()?;
        self.drain_releases();
        self.inner.registry.prune();
        match self.inner.trampolines.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Native memory
    // ------------------------------------------------------------------

    /// Zeroed native buffer for a struct, freed when the box drops
    pub fn alloc(&self, size: usize, type_tag: &str) -> Result<Rc<NativeBox>> {
        self.ensure_running()?;
        let ptr = native_alloc(self.hooks(), size)?;
        let handle = NativeHandle::new(ptr as *mut c_void)
            .ok_or_else(|| Error::marshal("native memory", "null allocation"))?;
        debug!(size, type_tag, handle = ?handle, "struct buffer allocated");
        Ok(Rc::new(NativeBox::new(
            handle,
            type_tag.into(),
            Some(size),
            BoxRelease::Free,
            self.releases().clone(),
        )))
    }

    /// Read a field of `ty` at `offset`; nothing read is released
    pub fn read(&self, target: &NativeBox, ty: &FfiType, offset: usize) -> Result<Value> {
        self.ensure_running()?;
        check_bounds(target, ty, offset)?;
        // SAFETY: bounds checked against the box size when it is known;
        // unsized boxes come from native pointers of caller-declared type.
        let src = unsafe { (target.as_ptr() as *const u8).add(offset) };
        read_value(self, ty, src, Transfer::Borrowed)
    }

    /// Store `value` as a field of `ty` at `offset`.
    ///
    /// Pointers written into the struct (strings, arrays, records) are
    /// native allocations owned by the struct's owner from now on.
    pub fn write(&self, target: &NativeBox, ty: &FfiType, offset: usize, value: &Value) -> Result<()> {
        self.ensure_running()?;
        check_bounds(target, ty, offset)?;
        let mut frame = CallFrame::persistent();
        // SAFETY: bounds checked against the box size when it is known.
        let dst = unsafe { (target.as_ptr() as *mut u8).add(offset) };
        if let Err(err) = write_value(self, ty, value, dst, &mut frame) {
            self.abandon(&mut frame);
            return Err(err);
        }
        frame.settle();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Wrapper for a borrowed native instance pointer (null → `None`)
    pub fn get_native_object(
        &self,
        ptr: *mut c_void,
        class: Option<&Rc<WrapperClass>>,
    ) -> Result<Option<Rc<NativeObject>>> {
        self.ensure_running()?;
        let Some(handle) = NativeHandle::new(ptr) else {
            return Ok(None);
        };
        self.registry()
            .get_or_create(self.hooks(), handle, Ownership::None, None, class)
            .map(Some)
    }

    pub fn register_class(&self, class: Rc<WrapperClass>) {
        self.registry().register_class(class);
    }

    /// Give up the wrapper's native reference now and disconnect its
    /// signal handlers. Returns false for an already detached wrapper.
    pub fn release(&self, object: &Rc<NativeObject>) -> Result<bool> {
        self.ensure_running()?;
        if !object.is_attached() {
            return Ok(false);
        }
        let unref = NativeHooks::require(self.hooks().object_unref, "object_unref")?;

        let handle = object.handle();
        self.signals().disconnect_instance(self, handle);
        self.registry().remove(handle);
        object.detach();

        // SAFETY: the wrapper held exactly this reference until now.
        unsafe { unref(handle.as_ptr()) };
        log_release("unref", handle.as_ptr() as *const u8);
        Ok(true)
    }

    /// Native side finalized `ptr`; forget it without releasing anything
    pub fn native_finalized(&self, ptr: *mut c_void) -> bool {
        let Some(handle) = NativeHandle::new(ptr) else {
            return false;
        };
        let known = self.registry().native_finalized(handle);
        self.signals().forget_instance(self.trampolines(), handle);
        known
    }

    /// Native instances with a live wrapper
    pub fn live_objects(&self) -> usize {
        self.registry().live_count()
    }

    // ------------------------------------------------------------------
    // Signals and properties
    // ------------------------------------------------------------------

    /// Connect `handler` to `signal`; `signature` must be a closure-shaped
    /// callback descriptor.
    pub fn connect(
        &self,
        object: &Rc<NativeObject>,
        signal: &str,
        signature: &FfiType,
        handler: Callback,
        after: bool,
    ) -> Result<HandlerId> {
        self.ensure_running()?;
        let FfiType::Callback(signature) = signature else {
            return Err(Error::descriptor(format!(
                "signal '{}' needs a callback descriptor, got {}",
                signal,
                signature.kind_name()
            )));
        };
        self.signals()
            .connect(self, object, signal, signature, handler, after)
    }

    /// Stop `id` from running; calling it again is a no-op
    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.signals().disconnect(self, id)
    }

    pub fn set_property(&self, object: &Rc<NativeObject>, name: &str, value: Value) -> Result<()> {
        let call = property_setter(object, name)?(object, value);
        self.call(&call.library, &call.symbol, &call.args, &call.return_type)
            .map(drop)
    }

    pub fn get_property(&self, object: &Rc<NativeObject>, name: &str) -> Result<Value> {
        self.ensure_running()?;
        let getter = object
            .class()
            .property(name)
            .ok_or_else(|| unknown_property(object, name))?
            .getter
            .ok_or_else(|| {
                Error::descriptor(format!(
                    "property '{}' of {} is write-only",
                    name,
                    object.class().name()
                ))
            })?;
        getter(self, object)
    }

    /// Set several properties through one `batch_call`
    pub fn set_properties(&self, object: &Rc<NativeObject>, values: Vec<(&str, Value)>) -> Result<()> {
        let mut calls = Vec::with_capacity(values.len());
        for (name, value) in values {
            calls.push(property_setter(object, name)?(object, value));
        }
        self.batch_call(&calls)
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[inline]
    pub fn hooks(&self) -> &NativeHooks {
        &self.inner.hooks
    }

    #[inline]
    pub fn libraries(&self) -> &LibraryCache {
        &self.inner.libraries
    }

    #[inline]
    pub fn registry(&self) -> &IdentityRegistry {
        &self.inner.registry
    }

    #[inline]
    pub fn trampolines(&self) -> &TrampolineTable {
        &self.inner.trampolines
    }

    #[inline]
    pub fn signals(&self) -> &SignalTable {
        &self.inner.signals
    }

    #[inline]
    pub fn releases(&self) -> &Arc<ReleaseQueue> {
        &self.inner.releases
    }

    pub fn pending_releases(&self) -> usize {
        self.inner.releases.len()
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RuntimeInner>) -> Option<Self> {
        weak.upgrade().map(Self::from_inner)
    }

    pub(crate) fn from_inner(inner: Rc<RuntimeInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.inner.running.get() {
            Ok(())
        } else {
            Err(Error::Stopped)
        }
    }

    /// Perform every queued release; returns how many ran
    pub fn drain_releases(&self) -> usize {
        self.inner.drain_releases()
    }

    /// Give back what a failed marshal created for the native side
    pub(crate) fn abandon(&self, frame: &mut CallFrame) {
        let owed = frame.take_obligations();
        if owed.is_empty() {
            return;
        }
        debug!(count = owed.len(), "marshalling failed, undoing ownership transfers");
        for obligation in owed {
            match obligation {
                Obligation::Release(release) => self.releases().push(release),
                Obligation::Callback(id) => self.trampolines().retire(id),
            }
        }
        self.drain_releases();
    }

    /// GType of a boxed type, resolved once per runtime
    pub(crate) fn boxed_gtype(&self, boxed: &BoxedType) -> Result<usize> {
        if let Some(gtype) = self.inner.gtypes.borrow().get(&boxed.type_name) {
            return Ok(*gtype);
        }

        let gtype = match (&boxed.library, &boxed.get_type) {
            (Some(library), Some(symbol)) => {
                let ptr = self.libraries().symbol(library, symbol)?;
                // SAFETY: `*_get_type` functions take nothing and return a GType.
                unsafe { core::mem::transmute::<*const c_void, GetTypeFn>(ptr)() }
            }
            _ => {
                let lookup = NativeHooks::require(self.hooks().type_from_name, "type_from_name")?;
                let name = CString::new(&*boxed.type_name).map_err(|_| {
                    Error::descriptor(format!("boxed type name {:?} contains NUL", boxed.type_name))
                })?;
                // SAFETY: NUL-terminated type name.
                unsafe { lookup(name.as_ptr()) }
            }
        };

        if gtype == 0 {
            return Err(Error::descriptor(format!(
                "boxed type '{}' is not registered",
                boxed.type_name
            )));
        }
        self.inner
            .gtypes
            .borrow_mut()
            .insert(boxed.type_name.clone(), gtype);
        Ok(gtype)
    }
}

impl RuntimeInner {
    fn drain_releases(&self) -> usize {
        let mut performed = 0;
        // Releasing can finalize instances whose wrappers then queue more.
        loop {
            let batch = self.releases.drain();
            if batch.is_empty() {
                break;
            }
            for release in batch {
                self.perform(release);
                performed += 1;
            }
        }
        self.trampolines.collect();
        performed
    }

    fn perform(&self, release: PendingRelease) {
        let address = release.address() as *mut c_void;
        // SAFETY: each queued release is the single obligation its wrapper held.
        unsafe {
            match release {
                PendingRelease::Unref(_) => match self.hooks.object_unref {
                    Some(unref) => unref(address),
                    None => {
                        warn!(address = ?address, "no unref hook, reference leaked");
                        return;
                    }
                },
                PendingRelease::Free(_) => (self.hooks.free)(address),
                PendingRelease::BoxedFree { gtype, .. } => match self.hooks.boxed_free {
                    Some(boxed_free) => boxed_free(gtype, address),
                    None => {
                        warn!(address = ?address, gtype, "no boxed_free hook, value leaked");
                        return;
                    }
                },
            }
        }
        log_release(release.kind(), address as *const u8);
    }

    fn shutdown(&self) {
        self.running.set(false);

        self.signals.disconnect_all(&self.hooks, &self.trampolines);
        self.drain_releases();

        let handles = self.registry.detach_all();
        if let Some(unref) = self.hooks.object_unref {
            for handle in &handles {
                // SAFETY: each detached wrapper held one reference.
                unsafe { unref(handle.as_ptr()) };
                log_release("unref", handle.as_ptr() as *const u8);
            }
        }
        self.drain_releases();

        self.trampolines.clear();
        self.libraries.clear();
        info!(released = handles.len(), "runtime stopped");
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if self.running.get() {
            self.shutdown();
        }
    }
}

fn check_bounds(target: &NativeBox, ty: &FfiType, offset: usize) -> Result<()> {
    if matches!(ty, FfiType::Void) {
        return Err(Error::descriptor("void is not a field type"));
    }
    let Some(size) = target.size() else {
        return Ok(());
    };
    let end = offset.checked_add(ty.native_size());
    if end.map_or(true, |end| end > size) {
        return Err(Error::Marshal {
            expected: "field inside the struct",
            found: format!(
                "{} bytes at offset {} of a {}-byte {}",
                ty.native_size(),
                offset,
                size,
                target.type_name()
            ),
        });
    }
    Ok(())
}

fn unknown_property(object: &NativeObject, name: &str) -> Error {
    Error::descriptor(format!(
        "{} has no property '{}'",
        object.class().name(),
        name
    ))
}

fn property_setter(
    object: &Rc<NativeObject>,
    name: &str,
) -> Result<crate::registry::PropertySetter> {
    object
        .class()
        .property(name)
        .ok_or_else(|| unknown_property(object, name))?
        .setter
        .ok_or_else(|| {
            Error::descriptor(format!(
                "property '{}' of {} is read-only",
                name,
                object.class().name()
            ))
        })
}

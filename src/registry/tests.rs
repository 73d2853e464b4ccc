//! Identity registry and wrapper lifetime tests

use super::*;
use crate::testing::{self, new_instance, new_typed_instance, ref_count};
use crate::types::Ownership;

fn registry() -> (IdentityRegistry, Arc<ReleaseQueue>) {
    let releases = Arc::new(ReleaseQueue::new());
    (IdentityRegistry::new(releases.clone()), releases)
}

fn handle(ptr: *mut core::ffi::c_void) -> NativeHandle {
    NativeHandle::new(ptr).unwrap()
}

#[test]
fn test_null_is_never_a_handle() {
    assert!(NativeHandle::new(core::ptr::null_mut()).is_none());
    assert!(NativeHandle::from_addr(0).is_none());
    assert_eq!(NativeHandle::from_addr(0x40).unwrap().addr(), 0x40);
}

#[test]
fn test_same_pointer_same_wrapper() {
    let (registry, _) = registry();
    let hooks = testing::hooks();
    let h = handle(new_instance());

    let first = registry.get_or_create(&hooks, h, Ownership::None, None, None).unwrap();
    let second = registry.get_or_create(&hooks, h, Ownership::None, None, None).unwrap();

    assert!(Rc::ptr_eq(&first, &second));
    // Floating ref claimed once by the first wrapper, nothing more
    assert_eq!(ref_count(h.as_ptr()), 2);
    assert_eq!(registry.live_count(), 1);
}

#[test]
fn test_full_ownership_adopts_reference() {
    let (registry, releases) = registry();
    let hooks = testing::hooks();
    let h = handle(new_instance());

    let wrapper = registry.get_or_create(&hooks, h, Ownership::Full, None, None).unwrap();
    assert_eq!(ref_count(h.as_ptr()), 1);
    assert!(releases.is_empty());

    // Existing wrapper already holds a reference: the surplus is released
    let again = registry.get_or_create(&hooks, h, Ownership::Full, None, None).unwrap();
    assert!(Rc::ptr_eq(&wrapper, &again));
    assert_eq!(releases.drain(), vec![PendingRelease::Unref(h.addr())]);
}

#[test]
fn test_drop_queues_exactly_one_unref() {
    let (registry, releases) = registry();
    let hooks = testing::hooks();
    let h = handle(new_instance());

    let wrapper = registry.get_or_create(&hooks, h, Ownership::Full, None, None).unwrap();
    let clone = wrapper.clone();
    drop(wrapper);
    assert!(releases.is_empty());
    drop(clone);

    assert_eq!(releases.drain(), vec![PendingRelease::Unref(h.addr())]);
    assert!(registry.lookup(h).is_none());
    assert_eq!(registry.prune(), 1);
}

#[test]
fn test_dead_entry_replaced_with_fresh_wrapper() {
    let (registry, _) = registry();
    let hooks = testing::hooks();
    let h = handle(new_instance());

    drop(registry.get_or_create(&hooks, h, Ownership::Full, None, None).unwrap());

    let second = registry.get_or_create(&hooks, h, Ownership::Full, None, None).unwrap();
    assert!(second.is_attached());
    assert_eq!(registry.live_count(), 1);
}

#[test]
fn test_native_finalized_detaches() {
    let (registry, releases) = registry();
    let hooks = testing::hooks();
    let h = handle(new_instance());

    let wrapper = registry.get_or_create(&hooks, h, Ownership::Full, None, None).unwrap();
    assert!(registry.native_finalized(h));
    assert!(!wrapper.is_attached());
    drop(wrapper);

    assert!(releases.is_empty());
    assert!(!registry.native_finalized(h));
}

#[test]
fn test_class_resolution_order() {
    let (registry, _) = registry();
    let hooks = testing::hooks();

    let widget = Rc::new(WrapperClass::new("GtkWidget").with_parent(registry.root_class().clone()));
    let label = Rc::new(WrapperClass::new("GtkLabel").with_parent(widget.clone()));
    registry.register_class(widget.clone());
    registry.register_class(label.clone());

    // Runtime type name wins over the hint
    let typed = handle(new_typed_instance(core::ffi::CStr::from_bytes_with_nul(b"GtkLabel\0").unwrap()));
    let obj = registry
        .get_or_create(&hooks, typed, Ownership::Full, Some("GtkWidget"), None)
        .unwrap();
    assert_eq!(obj.class().name(), "GtkLabel");
    assert!(obj.is_a("GtkWidget"));
    assert!(obj.is_a(ROOT_CLASS));

    // Unknown runtime type: hint, then caller class, then root
    let hinted = handle(new_instance());
    let obj = registry
        .get_or_create(&hooks, hinted, Ownership::Full, Some("GtkWidget"), Some(&label))
        .unwrap();
    assert_eq!(obj.class().name(), "GtkWidget");

    let caller = handle(new_instance());
    let obj = registry
        .get_or_create(&hooks, caller, Ownership::Full, Some("Unknown"), Some(&label))
        .unwrap();
    assert_eq!(obj.class().name(), "GtkLabel");

    let plain = handle(new_instance());
    let obj = registry.get_or_create(&hooks, plain, Ownership::Full, None, None).unwrap();
    assert_eq!(obj.class().name(), ROOT_CLASS);
}

#[test]
fn test_borrowed_without_ref_sink_hook() {
    let (registry, _) = registry();
    let hooks = NativeHooks::libc();
    let h = handle(new_instance());

    let err = registry.get_or_create(&hooks, h, Ownership::None, None, None).unwrap_err();
    assert_eq!(err, crate::Error::MissingHook("object_ref_sink"));
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn test_detach_all_reports_live_handles() {
    let (registry, releases) = registry();
    let hooks = testing::hooks();
    let a = handle(new_instance());
    let b = handle(new_instance());

    let kept = registry.get_or_create(&hooks, a, Ownership::Full, None, None).unwrap();
    drop(registry.get_or_create(&hooks, b, Ownership::Full, None, None).unwrap());
    releases.drain();

    assert_eq!(registry.detach_all(), vec![a]);
    assert!(!kept.is_attached());
    drop(kept);
    assert!(releases.is_empty());
}

#[test]
fn test_box_release_policies() {
    let releases = Arc::new(ReleaseQueue::new());
    let a = handle(new_instance());
    let b = handle(new_instance());
    let c = handle(new_instance());

    drop(NativeBox::new(a, "Borrowed".into(), Some(8), BoxRelease::None, releases.clone()));
    drop(NativeBox::new(b, "Plain".into(), Some(8), BoxRelease::Free, releases.clone()));
    drop(NativeBox::new(c, "GdkRGBA".into(), None, BoxRelease::BoxedFree(77), releases.clone()));

    assert_eq!(
        releases.drain(),
        vec![
            PendingRelease::Free(b.addr()),
            PendingRelease::BoxedFree {
                gtype: 77,
                address: c.addr()
            },
        ]
    );
}

#[test]
fn test_property_lookup_walks_parents() {
    fn getter(_: &crate::Runtime, _: &Rc<NativeObject>) -> crate::Result<crate::Value> {
        Ok(crate::Value::Bool(true))
    }
    fn setter(obj: &Rc<NativeObject>, value: crate::Value) -> crate::interop::NativeCall {
        crate::interop::NativeCall::new(
            "gtk",
            "gtk_widget_set_visible",
            vec![
                crate::TypedArg::new(crate::FfiType::object(Ownership::None), obj.clone()),
                crate::TypedArg::new(crate::FfiType::boolean(), value),
            ],
        )
    }

    let widget = Rc::new(
        WrapperClass::new("GtkWidget")
            .with_property("visible", PropertyAccessor::read_write(getter, setter))
            .with_property("name", PropertyAccessor::read_only(getter)),
    );
    let label = WrapperClass::new("GtkLabel").with_parent(widget);

    assert!(label.properties().is_empty());
    let visible = label.property("visible").unwrap();
    assert!(visible.getter.is_some() && visible.setter.is_some());
    assert!(label.property("name").unwrap().setter.is_none());
    assert!(label.property("missing").is_none());
    assert_eq!(
        label.ancestors().map(|c| c.name().to_string()).collect::<Vec<_>>(),
        ["GtkLabel", "GtkWidget"]
    );
}

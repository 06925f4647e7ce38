//! Wrapper identity, ownership and handle moves.

mod common;

use common::{Widget, unique_name};
use gobind::runtime::{Instance, Type, TypeFlags};
use gobind::{Cancellable, IsObject, Object, ObjectBase, ObjectImpl, RefKind, WrapperRegistry, construct, wrap};
use std::sync::Arc;

fn same_wrapper(a: &Arc<dyn ObjectImpl>, b: &Arc<dyn ObjectImpl>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

// ============================================================================
// Uniqueness
// ============================================================================

#[test]
fn test_repeated_wrap_returns_same_wrapper() {
    let instance = Instance::new(Type::OBJECT).unwrap();
    let handle = instance.as_ptr();

    // SAFETY: `instance` keeps the handle alive.
    let first = unsafe { wrap(handle, true) }.unwrap();
    let second = unsafe { wrap(handle, true) }.unwrap();
    assert_eq!(first, second);
    assert_eq!(instance.ref_count(), 3);

    drop(first);
    drop(second);
    assert_eq!(instance.ref_count(), 1);
}

#[test]
fn test_wrap_finds_managed_wrapper() {
    let instance = Instance::new(Type::OBJECT).unwrap();
    let handle = instance.as_ptr();
    let managed = Object::take(instance);
    assert_eq!(managed.base().ref_kind(), RefKind::Owned);

    // SAFETY: `managed` owns a reference.
    let wrapped = unsafe { wrap(handle, true) }.unwrap();
    let managed_dyn: Arc<dyn ObjectImpl> = managed.clone();
    assert!(same_wrapper(wrapped.wrapper(), &managed_dyn));
}

#[test]
fn test_wrap_null_is_none() {
    // SAFETY: null is always accepted.
    assert!(unsafe { wrap(std::ptr::null_mut(), true) }.is_none());
}

#[test]
fn test_wrap_uses_nearest_factory() {
    let subtype = Type::register_static(
        Cancellable::static_type(),
        &unique_name("WrapTestCancellable"),
        TypeFlags::empty(),
    )
    .unwrap();
    let instance = Instance::new(subtype).unwrap();
    let wrapped = WrapperRegistry::global().wrap_instance(instance);
    assert!(wrapped.downcast_ref::<Cancellable>().is_some());
}

#[test]
fn test_custom_type_rewraps_to_itself() {
    let widget = construct(Widget::default()).unwrap();
    let wrapped = WrapperRegistry::global().wrap_instance(widget.instance().clone());
    assert_eq!(wrapped, widget);
    assert!(wrapped.downcast::<Widget>().is_ok());
}

// ============================================================================
// Ownership
// ============================================================================

#[test]
fn test_native_owned_wrapper_follows_instance() {
    let instance = Instance::new(Type::OBJECT).unwrap();
    // SAFETY: the reference moves into the RefPtr.
    let wrapped = unsafe { wrap(instance.into_raw(), false) }.unwrap();
    let weak = Arc::downgrade(wrapped.wrapper());
    let handle = wrapped.instance().as_ptr();

    drop(wrapped);
    assert!(weak.upgrade().is_none());
    assert!(WrapperRegistry::global().lookup(handle).is_none());
}

#[test]
fn test_managed_wrapper_releases_reference() {
    let instance = Instance::new(Type::OBJECT).unwrap();
    let observer = instance.clone();
    let managed = Object::take(instance);
    assert_eq!(observer.ref_count(), 2);

    drop(managed);
    assert_eq!(observer.ref_count(), 1);
    assert!(WrapperRegistry::global().lookup(observer.as_ptr()).is_none());
}

// ============================================================================
// Moves
// ============================================================================

#[test]
fn test_move_transfers_handle_and_registration() {
    let instance = Instance::new(Type::OBJECT).unwrap();
    let handle = instance.as_ptr();
    let a1 = Object::take(instance);
    let a2 = Arc::new(Object::uninit());

    ObjectBase::initialize_move(&a2, a1.base());

    assert!(!a1.base().is_bound());
    assert!(a1.base().as_ptr().is_null());
    assert_eq!(a2.base().as_ptr(), handle);
    assert_eq!(a2.base().ref_kind(), RefKind::Owned);

    let found = WrapperRegistry::global().lookup(handle).unwrap();
    let a2_dyn: Arc<dyn ObjectImpl> = a2.clone();
    assert!(same_wrapper(&found, &a2_dyn));

    // The moved-from wrapper no longer owns anything.
    drop(a1);
    assert_eq!(a2.base().ref_count(), 1);
}

#[test]
fn test_move_into_bound_wrapper_releases_old_handle() {
    let old = Instance::new(Type::OBJECT).unwrap();
    let old_observer = old.clone();
    let dest = Object::take(old);
    let src = Object::take(Instance::new(Type::OBJECT).unwrap());
    let handle = src.base().as_ptr();

    ObjectBase::initialize_move(&dest, src.base());
    assert_eq!(dest.base().as_ptr(), handle);
    assert_eq!(old_observer.ref_count(), 1);
    assert!(WrapperRegistry::global().lookup(old_observer.as_ptr()).is_none());
}

#[test]
fn test_move_across_registries_is_reported() {
    let private = WrapperRegistry::new();
    let dest = Arc::new(Object::uninit_in(&private));
    let src = Object::take(Instance::new(Type::OBJECT).unwrap());
    let handle = src.base().as_ptr();

    let ((), records) = gobind_log::capture(|| ObjectBase::initialize_move(&dest, src.base()));
    assert!(
        records
            .iter()
            .any(|r| r.level == gobind_log::Level::Warn && r.message.contains("keeps its own registry"))
    );
    assert_eq!(dest.base().as_ptr(), handle);
    assert!(WrapperRegistry::global().lookup(handle).is_some());
}

// ============================================================================
// Registries
// ============================================================================

#[test]
fn test_private_registry_is_separate() {
    let registry = WrapperRegistry::new();
    let wrapper = Arc::new(Object::uninit_in(&registry));
    let instance = Instance::new(Type::OBJECT).unwrap();
    let handle = instance.as_ptr();
    ObjectBase::initialize(&wrapper, instance);

    assert!(registry.lookup(handle).is_some());
    assert!(WrapperRegistry::global().lookup(handle).is_none());

    drop(wrapper);
    assert!(registry.is_empty());
}

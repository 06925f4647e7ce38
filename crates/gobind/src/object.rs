//! Wrapper traits, the root wrapper [`Object`] and the [`RefPtr`] handle.

use crate::error::Result;
use crate::object_base::ObjectBase;
use crate::runtime::{Instance, Type};
use crate::wrap::{Ownership, WrapperRegistry};
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Upcasts to `Any`, for downcasting wrappers behind `dyn ObjectImpl`.
pub trait AsAnyArc: Any + Send + Sync {
    /// `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
    /// `self` as `Arc<dyn Any>`.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A wrapper of a native instance.
///
/// # Thread Safety
///
/// Wrappers are `Send + Sync` because the native side may release them from
/// any thread. Using one from a thread other than the one running its main
/// context is the caller's responsibility.
pub trait ObjectImpl: AsAnyArc {
    /// The embedded base.
    fn base(&self) -> &ObjectBase;
}

/// A wrapper type with a fixed runtime type.
pub trait IsObject {
    /// The runtime type instances of this wrapper have (or derive from).
    fn static_type() -> Type;
}

/// The wrapper of the root object type.
///
/// Custom wrappers embed an `Object` and implement
/// [`CustomType`](crate::CustomType).
#[derive(Debug, Default)]
pub struct Object {
    base: ObjectBase,
}

impl Object {
    /// An unbound wrapper.
    #[must_use]
    pub fn uninit() -> Object {
        Object {
            base: ObjectBase::new(),
        }
    }

    /// An unbound wrapper registered with `registry` once bound.
    #[must_use]
    pub fn uninit_in(registry: &WrapperRegistry) -> Object {
        Object {
            base: ObjectBase::with_registry(registry),
        }
    }

    /// Creates a plain native object and its wrapper.
    ///
    /// # Errors
    ///
    /// Propagates instantiation errors.
    pub fn new() -> Result<RefPtr<Object>> {
        crate::init();
        let instance = Instance::new(Type::OBJECT)?;
        let wrapper = Arc::new(Object::uninit());
        Ok(bind_native(wrapper, instance))
    }

    /// Wraps `instance`, adopting its reference.
    #[must_use]
    pub fn take(instance: Instance) -> Arc<Object> {
        let wrapper = Arc::new(Object::uninit());
        ObjectBase::initialize(&wrapper, instance);
        wrapper
    }

    /// Wraps `instance`, adding a reference of its own.
    #[must_use]
    pub fn borrow(instance: &Instance) -> Arc<Object> {
        Self::take(instance.clone())
    }
}

impl ObjectImpl for Object {
    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

impl IsObject for Object {
    fn static_type() -> Type {
        Type::OBJECT
    }
}

pub(crate) fn object_factory() -> Arc<dyn ObjectImpl> {
    Arc::new(Object::uninit())
}

/// Attaches a freshly created instance to `wrapper` with native ownership.
pub(crate) fn bind_native<T: ObjectImpl>(wrapper: Arc<T>, instance: Instance) -> RefPtr<T> {
    let this: Arc<dyn ObjectImpl> = Arc::clone(&wrapper) as Arc<dyn ObjectImpl>;
    let registry = wrapper.base().registry().clone();
    wrapper
        .base()
        .attach(&registry, &this, instance.as_ptr(), crate::object_base::RefKind::Borrowed);
    registry.register(instance.as_ptr(), &this, Ownership::Native);
    RefPtr { wrapper, instance }
}

/// A wrapper together with one native reference.
///
/// This is how native-owned wrappers are handed out: the wrapper lives as
/// long as its native instance, and the `RefPtr` keeps that instance
/// alive. Two `RefPtr`s are equal when they point at the same wrapper.
pub struct RefPtr<T: ?Sized> {
    wrapper: Arc<T>,
    instance: Instance,
}

impl<T: ?Sized + ObjectImpl> RefPtr<T> {
    pub(crate) fn from_parts(wrapper: Arc<T>, instance: Instance) -> Self {
        RefPtr { wrapper, instance }
    }

    /// Builds a `RefPtr` for a bound wrapper.
    ///
    /// Returns `None` if the wrapper has no native instance.
    #[must_use]
    pub fn from_wrapper(wrapper: Arc<T>) -> Option<Self> {
        let instance = wrapper.base().try_instance()?;
        Some(RefPtr { wrapper, instance })
    }

    /// The wrapper.
    #[must_use]
    pub fn wrapper(&self) -> &Arc<T> {
        &self.wrapper
    }

    /// The native reference held by this pointer.
    #[must_use]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Splits into the wrapper and the native reference.
    #[must_use]
    pub fn into_parts(self) -> (Arc<T>, Instance) {
        (self.wrapper, self.instance)
    }
}

impl<T: ObjectImpl> RefPtr<T> {
    /// Erases the wrapper type.
    #[must_use]
    pub fn upcast(self) -> RefPtr<dyn ObjectImpl> {
        RefPtr {
            wrapper: self.wrapper as Arc<dyn ObjectImpl>,
            instance: self.instance,
        }
    }
}

impl RefPtr<dyn ObjectImpl> {
    /// Recovers the concrete wrapper type.
    ///
    /// # Errors
    ///
    /// Gives the pointer back if the wrapper is not a `U`.
    pub fn downcast<U: ObjectImpl>(self) -> std::result::Result<RefPtr<U>, RefPtr<dyn ObjectImpl>> {
        let RefPtr { wrapper, instance } = self;
        match Arc::clone(&wrapper).as_any_arc().downcast::<U>() {
            Ok(concrete) => Ok(RefPtr {
                wrapper: concrete,
                instance,
            }),
            Err(_) => Err(RefPtr { wrapper, instance }),
        }
    }

    /// Borrows the wrapper as a `U`.
    #[must_use]
    pub fn downcast_ref<U: ObjectImpl>(&self) -> Option<&U> {
        (*self.wrapper).as_any().downcast_ref::<U>()
    }
}

impl<T: ?Sized> Deref for RefPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.wrapper
    }
}

impl<T: ?Sized> Clone for RefPtr<T> {
    fn clone(&self) -> Self {
        RefPtr {
            wrapper: Arc::clone(&self.wrapper),
            instance: self.instance.clone(),
        }
    }
}

impl<T: ?Sized, U: ?Sized> PartialEq<RefPtr<U>> for RefPtr<T> {
    fn eq(&self, other: &RefPtr<U>) -> bool {
        Arc::as_ptr(&self.wrapper).cast::<()>() == Arc::as_ptr(&other.wrapper).cast::<()>()
    }
}

impl<T: ?Sized> Eq for RefPtr<T> {}

impl<T: ?Sized> fmt::Debug for RefPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefPtr")
            .field("wrapper", &Arc::as_ptr(&self.wrapper).cast::<()>())
            .field("instance", &self.instance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_object_is_native_owned() {
        let obj = Object::new().unwrap();
        assert_eq!(obj.base().type_(), Type::OBJECT);
        assert_eq!(obj.base().ref_kind(), crate::object_base::RefKind::Borrowed);

        let found = WrapperRegistry::global().lookup(obj.instance().as_ptr()).unwrap();
        assert!(std::ptr::eq(
            Arc::as_ptr(&found).cast::<()>(),
            Arc::as_ptr(obj.wrapper()).cast::<()>()
        ));
    }

    #[test]
    fn test_upcast_then_downcast() {
        let obj = Object::new().unwrap();
        let erased = obj.clone().upcast();
        assert_eq!(erased, obj);

        assert!(erased.downcast_ref::<Object>().is_some());
        let back = erased.downcast::<Object>().unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn test_native_owned_wrapper_dies_with_instance() {
        let obj = Object::new().unwrap();
        let weak = Arc::downgrade(obj.wrapper());
        drop(obj);
        assert!(weak.upgrade().is_none());
    }
}

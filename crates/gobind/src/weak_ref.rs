//! Weak references to wrapped objects.

use crate::object::{ObjectImpl, RefPtr};
use crate::object_base::ObjectBase;
use crate::runtime::{Instance, RawInstance};
use crate::wrap::WrapperRegistry;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

type Slot = Mutex<usize>;

fn lock(slot: &Slot) -> MutexGuard<'_, usize> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

unsafe extern "C" fn clear_slot(data: *const c_void, _where_the_object_was: *mut RawInstance) {
    // SAFETY: balances the Arc::into_raw in Registration::new.
    let slot = unsafe { Arc::from_raw(data.cast::<Slot>()) };
    *lock(&slot) = 0;
}

/// One native weak reference, shared by clones of a [`WeakRef`].
struct Registration {
    slot: Arc<Slot>,
    weak_id: u64,
}

impl Registration {
    fn new(instance: &Instance) -> Self {
        let slot = Arc::new(Mutex::new(instance.as_ptr() as usize));
        let data = Arc::into_raw(Arc::clone(&slot)).cast::<c_void>();
        // SAFETY: clear_slot only touches the mutex, from any thread.
        let weak_id = unsafe { instance.weak_ref(clear_slot, data) };
        Registration { slot, weak_id }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let handle = *lock(&self.slot);
        if handle == 0 {
            return;
        }
        // SAFETY: the slot is cleared before the instance goes away.
        let instance = unsafe { &*(handle as *const RawInstance) };
        if let Some(data) = instance.weak_unref(self.weak_id) {
            // SAFETY: the notify will not run; release its share here.
            drop(unsafe { Arc::from_raw(data.cast::<Slot>()) });
        }
    }
}

/// A reference that does not keep the object alive and reads empty once
/// the native instance has been disposed.
///
/// # Thread Safety
///
/// Upgrading on one thread while the last strong reference is dropped on
/// another is not supported.
///
/// # Example
///
/// ```rust
/// use gobind::{Object, WeakRef};
///
/// let obj = Object::new().unwrap();
/// let weak = WeakRef::new(&obj);
/// assert_eq!(weak.upgrade().as_ref(), Some(&obj));
///
/// drop(obj);
/// assert!(weak.upgrade().is_none());
/// ```
pub struct WeakRef<T> {
    registration: Arc<Registration>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ObjectImpl> WeakRef<T> {
    /// Watches the object behind `object`.
    #[must_use]
    pub fn new(object: &RefPtr<T>) -> Self {
        WeakRef {
            registration: Arc::new(Registration::new(object.instance())),
            _marker: PhantomData,
        }
    }

    /// Watches the object `base` is bound to.
    ///
    /// # Panics
    ///
    /// Panics (binding invariant) if `base` is unbound.
    #[must_use]
    pub fn from_base(base: &ObjectBase) -> Self {
        WeakRef {
            registration: Arc::new(Registration::new(&base.instance())),
            _marker: PhantomData,
        }
    }

    /// Returns true while the instance exists.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        *lock(&self.registration.slot) != 0
    }

    /// Returns a strong reference, or `None` if the instance is gone or its
    /// wrapper is not a `T`.
    #[must_use]
    pub fn upgrade(&self) -> Option<RefPtr<T>> {
        let instance = {
            let slot = lock(&self.registration.slot);
            if *slot == 0 {
                return None;
            }
            // SAFETY: a non-zero slot means the weak notify has not run.
            unsafe { Instance::from_raw_none(*slot as *mut RawInstance) }
        };
        WrapperRegistry::global().wrap_instance(instance).downcast::<T>().ok()
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        WeakRef {
            registration: Arc::clone(&self.registration),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRef")
            .field("alive", &(*lock(&self.registration.slot) != 0))
            .finish()
    }
}

impl<T: ObjectImpl> RefPtr<T> {
    /// A weak reference to this object.
    #[must_use]
    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef::new(self)
    }
}

//! Reference-counted native instances.
//!
//! # Architecture
//!
//! A [`RawInstance`] is heap allocated with an atomic reference count, the
//! way native object systems lay out their instances. It is never moved and
//! is addressed by raw pointer everywhere outside this module:
//!
//! - [`Instance`] is one strong reference (Clone = ref, Drop = unref)
//! - dropping the last reference first *disposes* the instance (weak
//!   references are notified and signal handlers released, with the count
//!   held at one so callbacks may resurrect it), then *finalizes* it (qdata
//!   destroy notifies run and the memory is freed)
//! - qdata entries carry a destroy notify, which is how wrappers learn that
//!   their native instance is gone
//!
//! Per-instance state (qdata, property values, handlers, weak references)
//! sits behind a mutex that is never held while user code runs.
//!
//! # Thread Safety
//!
//! `ref`/`unref` are atomic. Instances may be released from any thread.

use crate::error::{Error, Result};
use crate::runtime::closure::Closure;
use crate::runtime::param::ParamSpec;
use crate::runtime::signal::{self, SignalId};
use crate::runtime::types::Type;
use crate::runtime::value::Value;
use fxhash::FxHashMap;
use gobind_log::trace;
use gobind_mem::Quark;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Destroy notify of a qdata entry.
pub type QDataDestroy = unsafe extern "C" fn(data: *mut c_void);

/// Called when a weakly referenced instance is disposed.
///
/// `where_the_object_was` must only be used as an identity; the instance is
/// being torn down.
pub type WeakNotify = unsafe extern "C" fn(data: *const c_void, where_the_object_was: *mut RawInstance);

static DEBUG_REFCOUNT: AtomicBool = AtomicBool::new(false);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Enables trace logging of every ref and unref.
pub fn set_debug_refcounting(enabled: bool) {
    DEBUG_REFCOUNT.store(enabled, Ordering::Relaxed);
}

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A connected signal handler.
pub(crate) struct Handler {
    pub(crate) id: u64,
    pub(crate) signal: SignalId,
    pub(crate) detail: Option<Quark>,
    pub(crate) closure: Arc<Closure>,
    pub(crate) after: bool,
    pub(crate) blocked: u32,
}

/// One in-flight emission on this instance.
pub(crate) struct Emission {
    pub(crate) signal: SignalId,
    pub(crate) stopped: bool,
}

struct WeakRefEntry {
    id: u64,
    notify: WeakNotify,
    data: usize,
}

#[derive(Default)]
pub(crate) struct InstanceState {
    qdata: FxHashMap<Quark, (usize, Option<QDataDestroy>)>,
    properties: FxHashMap<&'static str, Value>,
    notify_freeze: u32,
    notify_queue: Vec<Arc<ParamSpec>>,
    pub(crate) handlers: Vec<Handler>,
    pub(crate) emissions: Vec<Emission>,
    weak_refs: Vec<WeakRefEntry>,
}

/// A native instance.
#[repr(C)]
pub struct RawInstance {
    type_: Type,
    refcount: AtomicU32,
    state: Mutex<InstanceState>,
}

impl RawInstance {
    pub(crate) fn state(&self) -> MutexGuard<'_, InstanceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn as_mut_ptr(&self) -> *mut RawInstance {
        std::ptr::from_ref(self).cast_mut()
    }

    /// Returns the instance's runtime type.
    #[must_use]
    pub fn type_(&self) -> Type {
        self.type_
    }

    /// Returns the current reference count.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Adds a reference.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live instance.
    ///
    /// # Panics
    ///
    /// Panics if the reference count overflows.
    pub unsafe fn ref_raw(ptr: *mut RawInstance) {
        // SAFETY: the caller guarantees ptr is live.
        let inst = unsafe { &*ptr };
        let old = inst.refcount.fetch_add(1, Ordering::AcqRel);

        if old == u32::MAX {
            panic!("Reference count overflow in RawInstance::ref_raw");
        }
        if DEBUG_REFCOUNT.load(Ordering::Relaxed) {
            trace!("ref {:p} ({}): {} -> {}", ptr, inst.type_, old, old + 1);
        }
    }

    /// Drops a reference, disposing and finalizing the instance when it
    /// was the last one.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live instance and the caller must own the
    /// reference being dropped.
    pub unsafe fn unref_raw(ptr: *mut RawInstance) {
        // SAFETY: the caller owns a reference, so ptr is live.
        let inst = unsafe { &*ptr };

        let mut old = inst.refcount.load(Ordering::Acquire);
        while old > 1 {
            match inst.refcount.compare_exchange_weak(
                old,
                old - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if DEBUG_REFCOUNT.load(Ordering::Relaxed) {
                        trace!("unref {:p} ({}): {} -> {}", ptr, inst.type_, old, old - 1);
                    }
                    return;
                }
                Err(current) => old = current,
            }
        }

        // Last reference: dispose with the count still held at one.
        inst.dispose();

        let old = inst.refcount.fetch_sub(1, Ordering::AcqRel);
        if DEBUG_REFCOUNT.load(Ordering::Relaxed) {
            trace!("unref {:p} ({}): {} -> {}", ptr, inst.type_, old, old - 1);
        }
        if old == 1 {
            // SAFETY: the count reached zero, nobody else can reach ptr.
            unsafe { Self::finalize(ptr) };
        }
    }

    fn dispose(&self) {
        let ptr = self.as_mut_ptr();

        // Weak notifies run first, while handlers can still be disconnected
        // normally.
        let weak_refs = std::mem::take(&mut self.state().weak_refs);
        for entry in weak_refs {
            // SAFETY: the notify was registered together with its data.
            unsafe { (entry.notify)(entry.data as *const c_void, ptr) };
        }

        // Closure destroy notifies run here, outside the lock.
        let handlers = std::mem::take(&mut self.state().handlers);
        drop(handlers);
    }

    unsafe fn finalize(ptr: *mut RawInstance) {
        // SAFETY: the caller guarantees the count is zero.
        let inst = unsafe { &*ptr };
        if DEBUG_REFCOUNT.load(Ordering::Relaxed) {
            trace!("finalize {:p} ({})", ptr, inst.type_);
        }

        let qdata = std::mem::take(&mut inst.state().qdata);
        for (data, destroy) in qdata.into_values() {
            if let Some(destroy) = destroy {
                // SAFETY: destroy was registered together with its data.
                unsafe { destroy(data as *mut c_void) };
            }
        }

        // SAFETY: allocated by Box::into_raw in Instance::new.
        drop(unsafe { Box::from_raw(ptr) });
    }

    /// Attaches data under `key`, replacing (and destroying) any previous
    /// entry.
    ///
    /// # Safety
    ///
    /// `destroy`, if any, must be safe to call with `data` from any thread.
    pub unsafe fn set_qdata_full(&self, key: Quark, data: *mut c_void, destroy: Option<QDataDestroy>) {
        let old = self.state().qdata.insert(key, (data as usize, destroy));
        if let Some((old_data, Some(old_destroy))) = old {
            // SAFETY: registered together with its data.
            unsafe { old_destroy(old_data as *mut c_void) };
        }
    }

    /// Reads qdata.
    #[must_use]
    pub fn qdata(&self, key: Quark) -> Option<*mut c_void> {
        self.state().qdata.get(&key).map(|(data, _)| *data as *mut c_void)
    }

    /// Removes qdata without running its destroy notify.
    pub fn steal_qdata(&self, key: Quark) -> Option<*mut c_void> {
        self.state()
            .qdata
            .remove(&key)
            .map(|(data, _)| data as *mut c_void)
    }

    /// Adds a weak reference. `notify` runs once when the instance is
    /// disposed, unless removed first with [`RawInstance::weak_unref`].
    ///
    /// # Safety
    ///
    /// `notify` must be safe to call with `data` from any thread.
    pub unsafe fn weak_ref(&self, notify: WeakNotify, data: *const c_void) -> u64 {
        let id = next_id();
        self.state().weak_refs.push(WeakRefEntry {
            id,
            notify,
            data: data as usize,
        });
        id
    }

    /// Removes a weak reference, returning its data if it was still present.
    pub fn weak_unref(&self, id: u64) -> Option<*const c_void> {
        let mut state = self.state();
        let index = state.weak_refs.iter().position(|w| w.id == id)?;
        Some(state.weak_refs.remove(index).data as *const c_void)
    }

    fn find_property(&self, name: &str) -> Result<Arc<ParamSpec>> {
        self.type_
            .find_property(name)
            .ok_or_else(|| Error::UnknownProperty {
                type_name: self.type_.name().to_owned(),
                property: name.to_owned(),
            })
    }

    /// Sets a property and emits `notify` for it.
    ///
    /// The value is converted to the property's type when needed. The
    /// notification is delivered synchronously before this returns, unless
    /// notifications are frozen.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownProperty`] if the type has no such property
    /// - [`Error::PropertyNotWritable`] for read-only properties
    /// - [`Error::ValueTypeMismatch`] if the value cannot be converted
    pub fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let spec = self.find_property(name)?;
        if !spec.is_writable() {
            return Err(Error::PropertyNotWritable {
                property: spec.name().to_owned(),
            });
        }

        let value = value
            .transform(spec.value_type())
            .ok_or_else(|| Error::ValueTypeMismatch {
                expected: spec.value_type().name().to_owned(),
                found: value.type_().name().to_owned(),
            })?;

        // The previous value may hold the last reference to another
        // instance, so it is dropped after the lock is released.
        let previous = self.state().properties.insert(spec.name(), value);
        drop(previous);

        if !spec.flags().contains(crate::runtime::param::ParamFlags::EXPLICIT_NOTIFY) {
            self.queue_notify(spec);
        }
        Ok(())
    }

    /// Reads a property, returning its default if it was never set.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownProperty`] if the type has no such property
    /// - [`Error::PropertyNotReadable`] for write-only properties
    pub fn get_property(&self, name: &str) -> Result<Value> {
        let spec = self.find_property(name)?;
        if !spec.is_readable() {
            return Err(Error::PropertyNotReadable {
                property: spec.name().to_owned(),
            });
        }

        let stored = self.state().properties.get(spec.name()).cloned();
        Ok(stored.unwrap_or_else(|| spec.default_value().clone()))
    }

    /// Emits `notify` for a property, honoring freezes.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownProperty`] if the type has no such property.
    pub fn notify(&self, name: &str) -> Result<()> {
        let spec = self.find_property(name)?;
        self.queue_notify(spec);
        Ok(())
    }

    fn queue_notify(&self, spec: Arc<ParamSpec>) {
        {
            let mut state = self.state();
            if state.notify_freeze > 0 {
                if !state.notify_queue.iter().any(|p| p.name() == spec.name()) {
                    state.notify_queue.push(spec);
                }
                return;
            }
        }
        signal::emit_notify(self.as_mut_ptr(), &spec);
    }

    /// Queues `notify` emissions until the matching
    /// [`RawInstance::thaw_notify`]. Repeated changes of one property are
    /// delivered once.
    pub fn freeze_notify(&self) {
        self.state().notify_freeze += 1;
    }

    /// Undoes one [`RawInstance::freeze_notify`], delivering queued
    /// notifications when the last freeze is lifted.
    pub fn thaw_notify(&self) {
        let queued = {
            let mut state = self.state();
            if state.notify_freeze == 0 {
                gobind_log::warn!("thaw_notify(): {} is not frozen", self.type_);
                return;
            }
            state.notify_freeze -= 1;
            if state.notify_freeze > 0 {
                return;
            }
            std::mem::take(&mut state.notify_queue)
        };

        for spec in queued {
            signal::emit_notify(self.as_mut_ptr(), &spec);
        }
    }
}

impl fmt::Debug for RawInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawInstance")
            .field("type", &self.type_)
            .field("refcount", &self.ref_count())
            .finish_non_exhaustive()
    }
}

/// One strong reference to a native instance.
///
/// # Example
///
/// ```rust
/// use gobind::runtime::{Instance, Type};
///
/// let obj = Instance::new(Type::OBJECT).unwrap();
/// let other = obj.clone();
///
/// assert_eq!(obj.ref_count(), 2);
/// drop(other);
/// assert_eq!(obj.ref_count(), 1);
/// ```
pub struct Instance {
    ptr: NonNull<RawInstance>,
}

impl Instance {
    /// Creates an instance of `type_` with reference count one.
    ///
    /// # Errors
    ///
    /// [`Error::NotInstantiable`] for abstract, interface and fundamental
    /// types.
    pub fn new(type_: Type) -> Result<Instance> {
        if !type_.is_instantiatable() {
            return Err(Error::NotInstantiable {
                type_name: type_.name().to_owned(),
            });
        }

        let raw = Box::new(RawInstance {
            type_,
            refcount: AtomicU32::new(1),
            state: Mutex::new(InstanceState::default()),
        });

        let ptr = Box::into_raw(raw);
        if DEBUG_REFCOUNT.load(Ordering::Relaxed) {
            trace!("new {:p} ({})", ptr, type_);
        }

        // SAFETY: Box::into_raw never returns null.
        Ok(Instance {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        })
    }

    /// Takes ownership of a reference the caller already holds.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null and live, and the caller must own one
    /// reference, which moves into the returned `Instance`.
    #[must_use]
    pub unsafe fn from_raw_full(ptr: *mut RawInstance) -> Instance {
        // SAFETY: non-null per the contract.
        Instance {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    /// Adds a new reference to a borrowed pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null and live.
    #[must_use]
    pub unsafe fn from_raw_none(ptr: *mut RawInstance) -> Instance {
        // SAFETY: live per the contract.
        unsafe { RawInstance::ref_raw(ptr) };
        // SAFETY: non-null per the contract.
        unsafe { Self::from_raw_full(ptr) }
    }

    /// Gives up the reference without dropping it.
    #[must_use]
    pub fn into_raw(self) -> *mut RawInstance {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }

    /// Returns the pointer without affecting the count.
    #[must_use]
    pub fn as_ptr(&self) -> *mut RawInstance {
        self.ptr.as_ptr()
    }
}

impl std::ops::Deref for Instance {
    type Target = RawInstance;

    fn deref(&self) -> &RawInstance {
        // SAFETY: an Instance owns a reference, so the pointee is live.
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for Instance {
    fn clone(&self) -> Self {
        // SAFETY: self owns a reference, so ptr is live.
        unsafe { Instance::from_raw_none(self.ptr.as_ptr()) }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        // SAFETY: self owns the reference being released.
        unsafe { RawInstance::unref_raw(self.ptr.as_ptr()) }
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for Instance {}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance({:p}, {})", self.ptr, self.type_())
    }
}

// SAFETY: reference counting is atomic and all mutable state is behind the
// instance mutex.
unsafe impl Send for Instance {}
// SAFETY: see above.
unsafe impl Sync for Instance {}
// SAFETY: see above.
unsafe impl Send for RawInstance {}
// SAFETY: see above.
unsafe impl Sync for RawInstance {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::param::ParamFlags;
    use crate::runtime::types::TypeFlags;
    use std::sync::atomic::AtomicUsize;

    static FREED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_free(data: *mut c_void) {
        // SAFETY: tests store a Box<u32> here.
        drop(unsafe { Box::from_raw(data.cast::<u32>()) });
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_refcount_and_finalize() {
        let obj = Instance::new(Type::OBJECT).unwrap();
        let key = Quark::from_str("instance-test-finalize");
        unsafe {
            obj.set_qdata_full(key, Box::into_raw(Box::new(7_u32)).cast(), Some(count_free));
        }

        let clone = obj.clone();
        assert_eq!(obj.ref_count(), 2);

        let before = FREED.load(Ordering::SeqCst);
        drop(obj);
        assert_eq!(FREED.load(Ordering::SeqCst), before);
        drop(clone);
        assert_eq!(FREED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_qdata_replace_and_steal() {
        let obj = Instance::new(Type::OBJECT).unwrap();
        let key = Quark::from_str("instance-test-replace");
        let before = FREED.load(Ordering::SeqCst);

        unsafe {
            obj.set_qdata_full(key, Box::into_raw(Box::new(1_u32)).cast(), Some(count_free));
            obj.set_qdata_full(key, Box::into_raw(Box::new(2_u32)).cast(), Some(count_free));
        }
        assert_eq!(FREED.load(Ordering::SeqCst), before + 1);

        let stolen = obj.steal_qdata(key).unwrap();
        assert!(obj.qdata(key).is_none());
        // SAFETY: stolen data is ours to free.
        unsafe { count_free(stolen) };
        drop(obj);
        assert_eq!(FREED.load(Ordering::SeqCst), before + 2);
    }

    #[test]
    fn test_abstract_types_are_not_instantiable() {
        let t = Type::register_static(Type::OBJECT, "InstanceTestAbstract", TypeFlags::ABSTRACT).unwrap();
        assert!(matches!(Instance::new(t), Err(Error::NotInstantiable { .. })));
        assert!(matches!(Instance::new(Type::I32), Err(Error::NotInstantiable { .. })));
    }

    #[test]
    fn test_weak_ref_notified_on_dispose() {
        static NOTIFIED: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn on_gone(_data: *const c_void, _where: *mut RawInstance) {
            NOTIFIED.fetch_add(1, Ordering::SeqCst);
        }

        let obj = Instance::new(Type::OBJECT).unwrap();
        let kept = unsafe { obj.weak_ref(on_gone, std::ptr::null()) };
        let removed = unsafe { obj.weak_ref(on_gone, std::ptr::null()) };
        assert!(obj.weak_unref(removed).is_some());
        assert!(obj.weak_unref(removed).is_none());
        assert_ne!(kept, removed);

        drop(obj);
        assert_eq!(NOTIFIED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_property_storage() {
        let t = Type::register_static(Type::OBJECT, "InstanceTestProps", TypeFlags::empty()).unwrap();
        t.install_property(
            ParamSpec::new("count", Type::I32, Value::from_i32(3), ParamFlags::READWRITE).unwrap(),
        )
        .unwrap();
        t.install_property(
            ParamSpec::new("secret", Type::STRING, Value::new(Type::STRING), ParamFlags::WRITABLE).unwrap(),
        )
        .unwrap();

        let obj = Instance::new(t).unwrap();
        assert_eq!(obj.get_property("count").unwrap().get_i32(), Some(3));

        obj.set_property("count", Value::from_i32(9)).unwrap();
        assert_eq!(obj.get_property("count").unwrap().get_i32(), Some(9));

        obj.set_property("count", Value::from_f64(4.0)).unwrap();
        assert_eq!(obj.get_property("count").unwrap().get_i32(), Some(4));

        assert!(matches!(
            obj.get_property("secret"),
            Err(Error::PropertyNotReadable { .. })
        ));
        assert!(matches!(
            obj.set_property("count", Value::from_string("x")),
            Err(Error::ValueTypeMismatch { .. })
        ));
        assert!(matches!(
            obj.get_property("missing"),
            Err(Error::UnknownProperty { .. })
        ));
    }
}

//! The wrapper registry: native handle to Rust wrapper.
//!
//! Every bound [`ObjectBase`](crate::ObjectBase) is recorded here under its
//! native handle, so a handle coming back from native code (a signal
//! argument, a property value) resolves to the wrapper that already exists
//! for it instead of a second one.
//!
//! # Ownership
//!
//! - [`Ownership::Native`]: the native instance owns the wrapper. The
//!   registry keeps the wrapper's `Arc` alive until the instance is
//!   finalized. Handles wrapped by [`WrapperRegistry::wrap`] and objects made
//!   with [`construct`](crate::construct) are native owned.
//! - [`Ownership::Managed`]: the wrapper owns one native reference and the
//!   registry only keeps a `Weak`. Dropping the last `Arc` releases the
//!   native reference.
//!
//! Either way the handle carries a qdata *ticket*; when the instance is
//! finalized the ticket's destroy notify tells the registry, which clears
//! the wrapper's handle before anything can use it.
//!
//! # Thread Safety
//!
//! The table is behind a mutex that is held only while inserting, removing
//! or looking up. No callback and no wrapper drop runs under it. Two threads
//! wrapping the *same* handle at once is outside the contract.

use crate::error::invariant_violation;
use crate::exception::catch_boundary;
use crate::object::{Object, ObjectImpl, RefPtr};
use crate::object_base::RefKind;
use crate::runtime::{Instance, RawInstance, Type};
use fxhash::FxHashMap;
use gobind_log::{debug, warn};
use gobind_mem::Quark;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak};

/// Who keeps a wrapper alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The native instance owns the wrapper.
    Native,
    /// The wrapper owns a native reference.
    Managed,
}

/// Creates an unbound wrapper shell for a native type.
pub type WrapperFactory = fn() -> Arc<dyn ObjectImpl>;

struct Entry {
    wrapper: Weak<dyn ObjectImpl>,
    /// Keeps a native-owned wrapper alive until its handle is finalized.
    _owner: Option<Arc<dyn ObjectImpl>>,
}

struct RegistryInner {
    entries: Mutex<FxHashMap<usize, Entry>>,
    ticket_key: Quark,
}

/// Handle-to-wrapper table.
///
/// Cloning shares the table. [`WrapperRegistry::global`] is the table every
/// wrapper uses unless it was bound to another one explicitly.
#[derive(Clone)]
pub struct WrapperRegistry {
    inner: Arc<RegistryInner>,
}

struct Ticket {
    registry: WrapperRegistry,
    handle: usize,
}

unsafe extern "C" fn ticket_destroy(data: *mut c_void) {
    // SAFETY: the ticket was leaked by install_ticket and is destroyed once.
    let ticket = unsafe { Box::from_raw(data.cast::<Ticket>()) };
    catch_boundary(|| {
        ticket.registry.on_native_teardown(ticket.handle as *mut RawInstance);
        Ok(())
    });
}

fn same_wrapper(a: &Weak<dyn ObjectImpl>, b: &Weak<dyn ObjectImpl>) -> bool {
    Weak::ptr_eq(a, b)
}

impl WrapperRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let serial = NEXT.fetch_add(1, Ordering::Relaxed);
        WrapperRegistry {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(FxHashMap::default()),
                ticket_key: Quark::from_str(&format!("gobind-wrapper-{serial}")),
            }),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static WrapperRegistry {
        static GLOBAL: OnceLock<WrapperRegistry> = OnceLock::new();
        GLOBAL.get_or_init(WrapperRegistry::new)
    }

    fn entries(&self) -> MutexGuard<'_, FxHashMap<usize, Entry>> {
        match self.inner.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns true if both values share one table.
    #[must_use]
    pub fn ptr_eq(&self, other: &WrapperRegistry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Records `wrapper` as the wrapper of `handle`.
    ///
    /// Registering the same wrapper again updates its ownership.
    ///
    /// # Panics
    ///
    /// Panics (binding invariant) if `handle` is bound to a different live
    /// wrapper.
    pub fn register(&self, handle: *mut RawInstance, wrapper: &Arc<dyn ObjectImpl>, ownership: Ownership) {
        let identity = Arc::downgrade(wrapper);
        let owner = (ownership == Ownership::Native).then(|| Arc::clone(wrapper));

        let replaced = {
            let mut entries = self.entries();
            if let Some(entry) = entries.get(&(handle as usize)) {
                if entry.wrapper.strong_count() > 0 && !same_wrapper(&entry.wrapper, &identity) {
                    drop(entries);
                    invariant_violation(format_args!(
                        "handle {handle:p} is already bound to another wrapper"
                    ));
                }
            }
            entries.insert(
                handle as usize,
                Entry {
                    wrapper: identity,
                    _owner: owner,
                },
            )
        };
        // A stale entry may hold the last reference to an old wrapper.
        drop(replaced);

        self.install_ticket(handle);
    }

    fn install_ticket(&self, handle: *mut RawInstance) {
        // SAFETY: register is only called with live handles.
        let instance = unsafe { &*handle };
        if instance.qdata(self.inner.ticket_key).is_some() {
            return;
        }

        let ticket = Box::new(Ticket {
            registry: self.clone(),
            handle: handle as usize,
        });
        // SAFETY: ticket_destroy frees exactly this box.
        unsafe {
            instance.set_qdata_full(
                self.inner.ticket_key,
                Box::into_raw(ticket).cast(),
                Some(ticket_destroy),
            );
        }
    }

    /// Returns the live wrapper of `handle`.
    #[must_use]
    pub fn lookup(&self, handle: *mut RawInstance) -> Option<Arc<dyn ObjectImpl>> {
        self.entries()
            .get(&(handle as usize))
            .and_then(|e| e.wrapper.upgrade())
    }

    /// Removes the entry of `handle` if it still belongs to `wrapper`, and
    /// detaches the teardown ticket.
    ///
    /// Called once from wrapper teardown. The handle must still be live.
    pub fn unregister(&self, handle: *mut RawInstance, wrapper: &Weak<dyn ObjectImpl>) {
        let removed = {
            let mut entries = self.entries();
            match entries.get(&(handle as usize)) {
                Some(entry) if same_wrapper(&entry.wrapper, wrapper) => {
                    entries.remove(&(handle as usize))
                }
                _ => None,
            }
        };

        if removed.is_some() {
            // SAFETY: the caller guarantees handle is live.
            let instance = unsafe { &*handle };
            if let Some(ticket) = instance.steal_qdata(self.inner.ticket_key) {
                // SAFETY: stolen tickets are ours to free.
                drop(unsafe { Box::from_raw(ticket.cast::<Ticket>()) });
            }
        }
        drop(removed);
    }

    /// Points the entry of `handle` at `dest`, which takes over from `src`.
    ///
    /// The old entry's owning `Arc` (if any) is released after the lock.
    pub(crate) fn rebind(
        &self,
        handle: *mut RawInstance,
        src: &Weak<dyn ObjectImpl>,
        dest: &Arc<dyn ObjectImpl>,
        ownership: Ownership,
    ) {
        let replaced = {
            let mut entries = self.entries();
            if let Some(entry) = entries.get(&(handle as usize)) {
                if entry.wrapper.strong_count() > 0 && !same_wrapper(&entry.wrapper, src) {
                    drop(entries);
                    invariant_violation(format_args!(
                        "moving handle {handle:p} away from a wrapper it is not bound to"
                    ));
                }
            }
            entries.insert(
                handle as usize,
                Entry {
                    wrapper: Arc::downgrade(dest),
                    _owner: (ownership == Ownership::Native).then(|| Arc::clone(dest)),
                },
            )
        };
        drop(replaced);
        self.install_ticket(handle);
    }

    fn on_native_teardown(&self, handle: *mut RawInstance) {
        let removed = self.entries().remove(&(handle as usize));
        let Some(entry) = removed else {
            return;
        };

        if let Some(wrapper) = entry.wrapper.upgrade() {
            wrapper.base().native_teardown(handle);
        }
        debug!("wrapper of {:p} released by native teardown", handle);
        // Dropping the owner may drop the wrapper itself.
        drop(entry);
    }

    /// Number of registered handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns true if no handle is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bind_shell(&self, shell: &Arc<dyn ObjectImpl>, handle: *mut RawInstance) {
        shell.base().attach(self, shell, handle, RefKind::Borrowed);
        self.register(handle, shell, Ownership::Native);
    }

    /// Returns the wrapper for `handle`, creating one if needed.
    ///
    /// A new wrapper comes from the factory of the handle's most derived
    /// type that has one, falling back to [`Object`]. It is native owned.
    ///
    /// # Arguments
    ///
    /// * `handle` - native handle, may be null
    /// * `take_copy` - `true` to add a reference for the returned `RefPtr`,
    ///   `false` to adopt one the caller owns
    ///
    /// # Safety
    ///
    /// `handle` must be null or live; with `take_copy == false` the caller
    /// must own a reference, which moves into the result.
    #[must_use]
    pub unsafe fn wrap(&self, handle: *mut RawInstance, take_copy: bool) -> Option<RefPtr<dyn ObjectImpl>> {
        if handle.is_null() {
            return None;
        }
        crate::init();

        // SAFETY: forwarded from the caller.
        let instance = unsafe {
            if take_copy {
                Instance::from_raw_none(handle)
            } else {
                Instance::from_raw_full(handle)
            }
        };
        Some(self.wrap_instance(instance))
    }

    /// Like [`WrapperRegistry::wrap`], for an owned reference.
    #[must_use]
    pub fn wrap_instance(&self, instance: Instance) -> RefPtr<dyn ObjectImpl> {
        if let Some(existing) = self.lookup(instance.as_ptr()) {
            return RefPtr::from_parts(existing, instance);
        }

        let type_ = instance.type_();
        let shell = match type_.ancestors().find_map(factory_for) {
            Some(factory) => factory(),
            None => {
                warn!("wrap(): no wrapper factory for '{}', using GObject", type_);
                Arc::new(Object::uninit()) as Arc<dyn ObjectImpl>
            }
        };

        self.bind_shell(&shell, instance.as_ptr());
        RefPtr::from_parts(shell, instance)
    }

    /// Wraps `handle` as an implementation of interface `iface`.
    ///
    /// Only factories of types implementing `iface` are considered, most
    /// derived first, then the interface's own factory. Returns `None`, with
    /// a warning, if the handle's type does not implement `iface` or no
    /// factory fits.
    ///
    /// # Safety
    ///
    /// Same as [`WrapperRegistry::wrap`].
    #[must_use]
    pub unsafe fn wrap_interface(
        &self,
        handle: *mut RawInstance,
        iface: Type,
        take_copy: bool,
    ) -> Option<RefPtr<dyn ObjectImpl>> {
        if handle.is_null() {
            return None;
        }
        crate::init();

        // SAFETY: forwarded from the caller.
        let instance = unsafe {
            if take_copy {
                Instance::from_raw_none(handle)
            } else {
                Instance::from_raw_full(handle)
            }
        };

        let type_ = instance.type_();
        if !type_.is_a(iface) {
            warn!("wrap_interface(): '{}' does not implement '{}'", type_, iface);
            return None;
        }

        if let Some(existing) = self.lookup(instance.as_ptr()) {
            return Some(RefPtr::from_parts(existing, instance));
        }

        let factory = type_
            .ancestors()
            .filter(|t| t.is_a(iface))
            .find_map(factory_for)
            .or_else(|| factory_for(iface));

        let Some(factory) = factory else {
            warn!("wrap_interface(): no wrapper factory for '{}' or '{}'", type_, iface);
            return None;
        };

        let shell = factory();
        self.bind_shell(&shell, instance.as_ptr());
        Some(RefPtr::from_parts(shell, instance))
    }
}

impl Default for WrapperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn factories() -> &'static RwLock<Vec<WrapperFactory>> {
    static FACTORIES: OnceLock<RwLock<Vec<WrapperFactory>>> = OnceLock::new();
    FACTORIES.get_or_init(|| RwLock::new(Vec::new()))
}

fn factory_key() -> Quark {
    Quark::from_str("gobind-wrapper-factory")
}

fn factory_for(type_: Type) -> Option<WrapperFactory> {
    let index = type_.qdata(factory_key())?;
    let factories = match factories().read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    factories.get(index).copied()
}

/// Registers the wrapper factory used by `wrap()` for handles of `type_`
/// (and of subtypes without their own factory).
///
/// Registering again replaces the earlier factory.
pub fn register_wrapped_type(type_: Type, factory: WrapperFactory) {
    let mut factories = match factories().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let index = factories.len();
    factories.push(factory);
    drop(factories);

    type_.set_qdata(factory_key(), index);
    debug!("registered wrapper factory for '{}'", type_);
}

/// Wraps `handle` with the global registry.
///
/// # Safety
///
/// Same as [`WrapperRegistry::wrap`].
#[must_use]
pub unsafe fn wrap(handle: *mut RawInstance, take_copy: bool) -> Option<RefPtr<dyn ObjectImpl>> {
    // SAFETY: forwarded.
    unsafe { WrapperRegistry::global().wrap(handle, take_copy) }
}

//! The native handle owned by every wrapper.
//!
//! # Architecture
//!
//! [`ObjectBase`] stores the handle in an `AtomicPtr`. Whoever swaps it to
//! null first owns the teardown:
//!
//! - the wrapper's `Drop` (managed side) unregisters the wrapper and, for an
//!   owned reference, releases it
//! - the native instance's finalization (native side) reaches the wrapper
//!   through the registry ticket and only clears the pointer
//!
//! The loser sees null and does nothing, so the reference is released
//! exactly once and a finalized handle is never dereferenced.
//!
//! # Construction
//!
//! A wrapper is built unbound (`Object::uninit()`, or a custom type's own
//! constructor) and bound afterwards, because binding needs the wrapper's
//! `Arc`:
//!
//! - [`ObjectBase::initialize`] adopts an existing native reference
//! - [`construct`](crate::construct) creates a new instance of a custom
//!   type
//! - [`WrapperRegistry::wrap`](crate::WrapperRegistry::wrap) builds one for
//!   a handle coming from native code
//! - [`ObjectBase::initialize_move`] moves the handle from another wrapper

use crate::connection::Connection;
use crate::error::{Result, invariant_violation};
use crate::interface::{Interface, InterfaceView};
use crate::object::ObjectImpl;
use crate::property::{PropertyProxy, PropertyProxyReadOnly, PropertyProxyWriteOnly};
use crate::runtime::{Instance, RawInstance, Type, Value};
use crate::signal_proxy::{SignalArgs, SignalProxy, SignalReturn};
use crate::value::ValueType;
use crate::wrap::{Ownership, WrapperRegistry};
use gobind_log::{debug, warn};
use std::borrow::Cow;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Whether the wrapper owns a reference on its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefKind {
    /// The wrapper is a view; native code keeps the instance alive.
    Borrowed = 0,
    /// The wrapper holds one reference, released when it is dropped.
    Owned = 1,
}

impl RefKind {
    const fn from_u8(raw: u8) -> RefKind {
        match raw {
            1 => RefKind::Owned,
            _ => RefKind::Borrowed,
        }
    }
}

/// How the wrapper's runtime type came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomTypeName {
    /// A wrapper for a native type.
    NotDerived,
    /// A custom type registered under a generated name.
    Anonymous,
    /// A custom type registered under its own name.
    Named(&'static str),
}

/// The managed end of a native instance.
///
/// Embedded (through [`Object`](crate::Object)) in every wrapper.
pub struct ObjectBase {
    handle: AtomicPtr<RawInstance>,
    ref_kind: AtomicU8,
    custom_type: OnceLock<CustomTypeName>,
    this: OnceLock<Weak<dyn ObjectImpl>>,
    registry: OnceLock<WrapperRegistry>,
}

impl ObjectBase {
    /// An unbound base using the global registry.
    #[must_use]
    pub fn new() -> Self {
        ObjectBase {
            handle: AtomicPtr::new(ptr::null_mut()),
            ref_kind: AtomicU8::new(RefKind::Borrowed as u8),
            custom_type: OnceLock::new(),
            this: OnceLock::new(),
            registry: OnceLock::new(),
        }
    }

    /// An unbound base that registers with `registry` instead of the global
    /// one.
    #[must_use]
    pub fn with_registry(registry: &WrapperRegistry) -> Self {
        let base = Self::new();
        let _ = base.registry.set(registry.clone());
        base
    }

    /// The registry this wrapper is recorded in.
    pub fn registry(&self) -> &WrapperRegistry {
        self.registry.get_or_init(|| WrapperRegistry::global().clone())
    }

    /// Binds an unbound wrapper to `instance`, adopting its reference.
    ///
    /// The wrapper owns the reference and the registry keeps only a weak
    /// link ([`Ownership::Managed`]).
    ///
    /// Binding again to the same handle logs at debug level and drops the
    /// passed reference. A wrapper already bound to another handle keeps it;
    /// the call logs a warning and drops `instance`.
    pub fn initialize<W: ObjectImpl>(wrapper: &Arc<W>, instance: Instance) {
        let base = wrapper.base();
        let current = base.handle.load(Ordering::Acquire);

        if current == instance.as_ptr() {
            debug!("initialize(): wrapper already bound to {:p}", current);
            return;
        }
        if !current.is_null() {
            warn!(
                "initialize(): wrapper is bound to {:p}; ignoring {:p}",
                current,
                instance.as_ptr()
            );
            return;
        }

        let this: Arc<dyn ObjectImpl> = Arc::clone(wrapper) as Arc<dyn ObjectImpl>;
        let registry = base.registry().clone();
        let handle = instance.into_raw();
        base.attach(&registry, &this, handle, RefKind::Owned);
        registry.register(handle, &this, Ownership::Managed);
    }

    /// Moves the handle of `src` into `dest`.
    ///
    /// Afterwards `src` holds no handle and the registry resolves the
    /// handle to `dest`. The reference kind moves along. A handle `dest`
    /// held before is released first.
    pub fn initialize_move<W: ObjectImpl>(dest: &Arc<W>, src: &ObjectBase) {
        let dest_base = dest.base();
        if ptr::eq(dest_base, src) {
            return;
        }

        let Some(src_this) = src.this.get().cloned() else {
            warn!("initialize_move(): source wrapper was never bound");
            return;
        };
        let handle = src.claim_handle();
        if handle.is_null() {
            warn!("initialize_move(): source wrapper has no native object");
            return;
        }
        let kind = src.ref_kind();

        dest_base.release_handle();

        let this: Arc<dyn ObjectImpl> = Arc::clone(dest) as Arc<dyn ObjectImpl>;
        let registry = src.registry().clone();
        dest_base.attach(&registry, &this, handle, kind);

        let ownership = match kind {
            RefKind::Owned => Ownership::Managed,
            RefKind::Borrowed => Ownership::Native,
        };
        registry.rebind(handle, &src_this, &this, ownership);
    }

    /// Stores the handle and identity of a freshly bound wrapper.
    pub(crate) fn attach(
        &self,
        registry: &WrapperRegistry,
        this: &Arc<dyn ObjectImpl>,
        handle: *mut RawInstance,
        kind: RefKind,
    ) {
        if let Err(rejected) = self.registry.set(registry.clone()) {
            if !rejected.ptr_eq(self.registry()) {
                warn!("wrapper for {handle:p} keeps its own registry; the handle is recorded in another one");
            }
        }
        let _ = self.this.set(Arc::downgrade(this));
        self.ref_kind.store(kind as u8, Ordering::Release);

        if self
            .handle
            .compare_exchange(ptr::null_mut(), handle, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            invariant_violation(format_args!(
                "wrapper bound to {handle:p} while already holding a native object"
            ));
        }
    }

    pub(crate) fn set_custom_type(&self, name: CustomTypeName) {
        let _ = self.custom_type.set(name);
    }

    /// Takes the handle, leaving null. Only the caller that gets a non-null
    /// pointer may tear it down.
    fn claim_handle(&self) -> *mut RawInstance {
        self.handle.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Called from the registry when `handle` is being finalized.
    pub(crate) fn native_teardown(&self, handle: *mut RawInstance) {
        let _ = self.handle.compare_exchange(
            handle,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn release_handle(&self) {
        let handle = self.claim_handle();
        if handle.is_null() {
            return;
        }

        if let Some(this) = self.this.get() {
            self.registry().unregister(handle, this);
        }
        if self.ref_kind() == RefKind::Owned {
            // SAFETY: the claim gave us the handle together with the
            // reference it owns.
            unsafe { RawInstance::unref_raw(handle) };
        }
    }

    /// Current reference kind.
    #[must_use]
    pub fn ref_kind(&self) -> RefKind {
        RefKind::from_u8(self.ref_kind.load(Ordering::Acquire))
    }

    /// The raw handle, null once unbound.
    #[must_use]
    pub fn as_ptr(&self) -> *mut RawInstance {
        self.handle.load(Ordering::Acquire)
    }

    /// Returns true while a native instance is attached.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        !self.as_ptr().is_null()
    }

    /// A new reference to the native instance, or `None` if unbound.
    #[must_use]
    pub fn try_instance(&self) -> Option<Instance> {
        let handle = self.as_ptr();
        if handle.is_null() {
            return None;
        }
        // SAFETY: a non-null handle is kept alive by this wrapper (owned)
        // or by native code until teardown clears it (borrowed).
        Some(unsafe { Instance::from_raw_none(handle) })
    }

    /// A new reference to the native instance.
    ///
    /// # Panics
    ///
    /// Panics (binding invariant) if the wrapper has no native instance.
    #[must_use]
    pub fn instance(&self) -> Instance {
        match self.try_instance() {
            Some(instance) => instance,
            None => invariant_violation(format_args!(
                "use of a wrapper whose native object is gone"
            )),
        }
    }

    /// The instance's runtime type.
    #[must_use]
    pub fn type_(&self) -> Type {
        self.instance().type_()
    }

    /// The runtime type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_().name()
    }

    /// Returns true if the instance's type is or derives from `type_`.
    #[must_use]
    pub fn is_a(&self, type_: Type) -> bool {
        self.type_().is_a(type_)
    }

    /// Returns true for a custom type registered without a name.
    #[must_use]
    pub fn is_anonymous_custom(&self) -> bool {
        self.custom_type.get() == Some(&CustomTypeName::Anonymous)
    }

    /// Returns true for any custom type.
    #[must_use]
    pub fn is_derived(&self) -> bool {
        matches!(
            self.custom_type.get(),
            Some(CustomTypeName::Anonymous | CustomTypeName::Named(_))
        )
    }

    /// How the wrapper's type came about.
    #[must_use]
    pub fn custom_type(&self) -> CustomTypeName {
        self.custom_type
            .get()
            .copied()
            .unwrap_or(CustomTypeName::NotDerived)
    }

    /// The native reference count, or 0 once unbound.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        let handle = self.as_ptr();
        if handle.is_null() {
            return 0;
        }
        // SAFETY: see try_instance.
        unsafe { (*handle).ref_count() }
    }

    /// Typed read/write proxy for a property.
    #[must_use]
    pub fn property<'a, T: ValueType>(&'a self, name: &'a str) -> PropertyProxy<'a, T> {
        PropertyProxy::new(self, name)
    }

    /// Typed read-only proxy for a property.
    #[must_use]
    pub fn property_read_only<'a, T: ValueType>(&'a self, name: &'a str) -> PropertyProxyReadOnly<'a, T> {
        PropertyProxyReadOnly::new(self, name)
    }

    /// Typed write-only proxy for a property.
    #[must_use]
    pub fn property_write_only<'a, T: ValueType>(&'a self, name: &'a str) -> PropertyProxyWriteOnly<'a, T> {
        PropertyProxyWriteOnly::new(self, name)
    }

    /// Typed proxy for a signal, by (possibly detailed) name.
    #[must_use]
    pub fn signal<'a, Args: SignalArgs, R: SignalReturn>(
        &'a self,
        name: impl Into<Cow<'a, str>>,
    ) -> SignalProxy<'a, Args, R> {
        SignalProxy::new(self, name)
    }

    /// Sets a property from an untyped value.
    ///
    /// # Errors
    ///
    /// See [`RawInstance::set_property`].
    pub fn set_property_value(&self, name: &str, value: Value) -> Result<()> {
        self.instance().set_property(name, value)
    }

    /// Reads a property as an untyped value.
    ///
    /// # Errors
    ///
    /// See [`RawInstance::get_property`].
    pub fn get_property_value(&self, name: &str) -> Result<Value> {
        self.instance().get_property(name)
    }

    /// Calls `f` whenever the property changes.
    pub fn connect_property_changed(
        &self,
        name: &str,
        f: impl Fn() + Send + Sync + 'static,
    ) -> Connection {
        self.signal::<(), ()>(format!("notify::{name}")).connect(f, false)
    }

    /// Queues change notifications until [`ObjectBase::thaw_notify`].
    pub fn freeze_notify(&self) {
        self.instance().freeze_notify();
    }

    /// Delivers notifications queued since [`ObjectBase::freeze_notify`].
    pub fn thaw_notify(&self) {
        self.instance().thaw_notify();
    }

    /// Emits a change notification for a property.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownProperty`](crate::Error::UnknownProperty) if there is
    /// no such property.
    pub fn notify(&self, name: &str) -> Result<()> {
        self.instance().notify(name)
    }

    /// Untyped view of an implemented interface.
    ///
    /// # Errors
    ///
    /// See [`Interface::new`].
    pub fn as_interface(&self, iface: Type) -> Result<Interface<'_>> {
        Interface::new(self, iface)
    }

    /// Typed view of an implemented interface.
    ///
    /// # Errors
    ///
    /// See [`Interface::new`].
    pub fn interface<'a, I: InterfaceView<'a>>(&'a self) -> Result<I> {
        Interface::new(self, I::static_type()).map(I::from_interface)
    }
}

impl Default for ObjectBase {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ObjectBase {
    fn drop(&mut self) {
        self.release_handle();
    }
}

impl fmt::Debug for ObjectBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle = self.as_ptr();
        let mut s = f.debug_struct("ObjectBase");
        s.field("handle", &handle);
        if !handle.is_null() {
            // SAFETY: see try_instance.
            s.field("type", &unsafe { (*handle).type_() });
        }
        s.field("ref_kind", &self.ref_kind())
            .field("custom_type", &self.custom_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;

    #[test]
    fn test_initialize_adopts_reference() {
        let registry = WrapperRegistry::new();
        let instance = Instance::new(Type::OBJECT).unwrap();
        let probe = instance.clone();

        let wrapper = Arc::new(Object::uninit_in(&registry));
        ObjectBase::initialize(&wrapper, instance);

        assert_eq!(wrapper.base().ref_kind(), RefKind::Owned);
        assert_eq!(probe.ref_count(), 2);
        assert!(!wrapper.base().is_derived());

        drop(wrapper);
        assert_eq!(probe.ref_count(), 1);
        assert!(registry.lookup(probe.as_ptr()).is_none());
    }

    #[test]
    fn test_initialize_twice_same_handle_drops_extra_ref() {
        let registry = WrapperRegistry::new();
        let instance = Instance::new(Type::OBJECT).unwrap();
        let wrapper = Arc::new(Object::uninit_in(&registry));

        ObjectBase::initialize(&wrapper, instance.clone());
        let ((), records) = gobind_log::capture(|| ObjectBase::initialize(&wrapper, instance.clone()));

        assert_eq!(instance.ref_count(), 2);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, gobind_log::Level::Debug);
    }

    #[test]
    fn test_initialize_other_handle_is_ignored() {
        let registry = WrapperRegistry::new();
        let first = Instance::new(Type::OBJECT).unwrap();
        let second = Instance::new(Type::OBJECT).unwrap();
        let wrapper = Arc::new(Object::uninit_in(&registry));

        ObjectBase::initialize(&wrapper, first.clone());
        let ((), records) = gobind_log::capture(|| ObjectBase::initialize(&wrapper, second.clone()));

        assert_eq!(wrapper.base().as_ptr(), first.as_ptr());
        assert_eq!(second.ref_count(), 1);
        assert_eq!(records[0].level, gobind_log::Level::Warn);
    }

    #[test]
    fn test_unbound_wrapper_reports_zero_refs() {
        let wrapper = Object::uninit();
        assert!(!wrapper.base().is_bound());
        assert_eq!(wrapper.base().ref_count(), 0);
        assert!(wrapper.base().try_instance().is_none());
    }

    #[test]
    #[should_panic(expected = "binding invariant violated")]
    fn test_instance_of_unbound_wrapper_panics() {
        let wrapper = Object::uninit();
        let _ = wrapper.base().instance();
    }
}

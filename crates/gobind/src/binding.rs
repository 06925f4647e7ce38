//! Property bindings.
//!
//! A [`Binding`] keeps a target property in step with a source property,
//! and with [`BindingFlags::BIDIRECTIONAL`] the other way round too. The
//! binding holds a reference on its own native instance, so it lives until
//! [`Binding::unbind`] is called or either end is disposed; dropping the
//! returned [`RefPtr`] does not end it.
//!
//! Both ends are tracked with native weak references. The weak notify of
//! whichever end goes first unbinds, which disconnects the change handlers
//! and drops the self reference.

use crate::connection::Connection;
use crate::error::{Error, Result, invariant_violation};
use crate::exception::catch_boundary;
use crate::object::{IsObject, Object, ObjectImpl, RefPtr, bind_native};
use crate::object_base::ObjectBase;
use crate::runtime::{Instance, ParamSpec, RawInstance, Type, TypeFlags, Value};
use crate::value::ValueType;
use crate::wrap::WrapperRegistry;
use bitflags::bitflags;
use gobind_log::{debug, warn};
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

bitflags! {
    /// How a binding propagates values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindingFlags: u32 {
        /// Source to target only.
        const DEFAULT = 0;
        /// Target changes flow back to the source.
        const BIDIRECTIONAL = 1 << 0;
        /// Copy the source value to the target when the binding is made.
        const SYNC_CREATE = 1 << 1;
        /// Negate booleans in both directions. Both properties must be
        /// booleans.
        const INVERT_BOOLEAN = 1 << 2;
    }
}

/// Converts a value on its way across a binding. `None` skips the update.
pub type TransformFn = Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Builds a [`TransformFn`] from a typed function. Values that do not
/// convert to `S` are skipped.
///
/// # Example
///
/// ```rust
/// use gobind::binding::transform;
/// use gobind::Value;
///
/// let double = transform(|n: i32| Some(f64::from(n) * 2.0));
/// assert_eq!(double(&Value::from_i32(4)).and_then(|v| v.get_f64()), Some(8.0));
/// assert!(double(&Value::from_string("four")).is_none());
/// ```
pub fn transform<S, T>(f: impl Fn(S) -> Option<T> + Send + Sync + 'static) -> TransformFn
where
    S: ValueType,
    T: ValueType,
{
    Box::new(move |value| S::from_value(value).ok().and_then(&f).map(|out| out.to_value()))
}

static BINDING_TYPE: OnceLock<Type> = OnceLock::new();

pub(crate) fn register_type() -> Type {
    *BINDING_TYPE.get_or_init(|| {
        match Type::register_static(Type::OBJECT, "GBinding", TypeFlags::FINAL) {
            Ok(type_) => type_,
            Err(e) => invariant_violation(format_args!("cannot register GBinding: {e}")),
        }
    })
}

pub(crate) fn binding_factory() -> Arc<dyn ObjectImpl> {
    Arc::new(Binding::detached())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// One bound instance: its handle, the weak reference watching it and the
/// change handler on it.
struct Endpoint {
    handle: usize,
    weak_id: u64,
    connection: Connection,
}

impl Endpoint {
    fn release(self) {
        self.connection.disconnect();
        if self.weak_id == 0 || self.handle == 0 {
            return;
        }
        // SAFETY: the weak reference is still registered, so the instance
        // has not been disposed.
        let instance = unsafe { &*(self.handle as *const RawInstance) };
        if let Some(data) = instance.weak_unref(self.weak_id) {
            // SAFETY: balances the Weak::into_raw in Binding::endpoint.
            drop(unsafe { Weak::from_raw(data.cast::<Binding>()) });
        }
    }
}

#[derive(Default)]
struct BindingState {
    source: Option<Endpoint>,
    target: Option<Endpoint>,
    self_ref: Option<Instance>,
}

/// A live link between two properties.
pub struct Binding {
    parent: Object,
    source_property: String,
    target_property: String,
    flags: BindingFlags,
    transform_to: Option<TransformFn>,
    transform_from: Option<TransformFn>,
    state: Mutex<BindingState>,
    in_transfer: AtomicBool,
}

impl Binding {
    fn detached() -> Self {
        Binding {
            parent: Object::uninit(),
            source_property: String::new(),
            target_property: String::new(),
            flags: BindingFlags::DEFAULT,
            transform_to: None,
            transform_from: None,
            state: Mutex::new(BindingState::default()),
            in_transfer: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, BindingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Name of the source property.
    #[must_use]
    pub fn source_property(&self) -> &str {
        &self.source_property
    }

    /// Name of the target property.
    #[must_use]
    pub fn target_property(&self) -> &str {
        &self.target_property
    }

    /// The flags the binding was made with.
    #[must_use]
    pub fn flags(&self) -> BindingFlags {
        self.flags
    }

    /// Returns true until the binding is undone.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.state().self_ref.is_some()
    }

    fn end(&self, pick: impl Fn(&BindingState) -> Option<&Endpoint>) -> Option<RefPtr<dyn ObjectImpl>> {
        let handle = {
            let state = self.state();
            pick(&state).map(|ep| ep.handle)?
        };
        // SAFETY: while bound, both ends are live; a disposed end unbinds
        // before its memory goes away.
        unsafe { WrapperRegistry::global().wrap(handle as *mut RawInstance, true) }
    }

    /// The source object, while bound.
    #[must_use]
    pub fn source(&self) -> Option<RefPtr<dyn ObjectImpl>> {
        self.end(|state| state.source.as_ref())
    }

    /// The target object, while bound.
    #[must_use]
    pub fn target(&self) -> Option<RefPtr<dyn ObjectImpl>> {
        self.end(|state| state.target.as_ref())
    }

    /// Undoes the binding. Later calls do nothing.
    pub fn unbind(&self) {
        let (source, target, self_ref) = {
            let mut state = self.state();
            (state.source.take(), state.target.take(), state.self_ref.take())
        };
        if source.is_none() && target.is_none() && self_ref.is_none() {
            return;
        }

        debug!(
            "unbind '{}' -> '{}'",
            self.source_property, self.target_property
        );
        for endpoint in [source, target].into_iter().flatten() {
            endpoint.release();
        }
        // May release the last native reference of this binding.
        drop(self_ref);
    }

    fn endpoint(self: &Arc<Self>, base: &ObjectBase, connection: Connection) -> Endpoint {
        let instance = base.instance();
        let data = Weak::into_raw(Arc::downgrade(self)).cast::<c_void>();
        // SAFETY: endpoint_gone accepts this data from any thread.
        let weak_id = unsafe { instance.weak_ref(endpoint_gone, data) };
        Endpoint {
            handle: instance.as_ptr() as usize,
            weak_id,
            connection,
        }
    }

    fn watch(self: &Arc<Self>, base: &ObjectBase, property: &str, direction: Direction) -> Connection {
        let weak = Arc::downgrade(self);
        base.signal::<(), ()>(format!("notify::{property}")).connect(
            move || {
                if let Some(binding) = weak.upgrade() {
                    binding.transfer(direction);
                }
            },
            false,
        )
    }

    fn attach(self: &Arc<Self>, source: &ObjectBase, target: &ObjectBase, self_ref: Instance) {
        let forward = self.watch(source, &self.source_property, Direction::Forward);
        let backward = if self.flags.contains(BindingFlags::BIDIRECTIONAL) {
            self.watch(target, &self.target_property, Direction::Backward)
        } else {
            Connection::disconnected()
        };

        let source = self.endpoint(source, forward);
        let target = self.endpoint(target, backward);

        let mut state = self.state();
        state.source = Some(source);
        state.target = Some(target);
        state.self_ref = Some(self_ref);
    }

    fn endpoint_gone(&self, handle: usize) {
        {
            let mut state = self.state();
            let BindingState { source, target, .. } = &mut *state;
            for endpoint in [source, target].into_iter().flatten() {
                if endpoint.handle == handle {
                    // The runtime consumed this weak reference.
                    endpoint.weak_id = 0;
                }
            }
        }
        self.unbind();
    }

    fn transfer(&self, direction: Direction) {
        if self.in_transfer.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.transfer_value(direction) {
            warn!(
                "binding '{}' -> '{}': {}",
                self.source_property, self.target_property, e
            );
        }
        self.in_transfer.store(false, Ordering::Release);
    }

    fn transfer_value(&self, direction: Direction) -> Result<()> {
        let (from, to) = {
            let state = self.state();
            let (Some(source), Some(target)) = (&state.source, &state.target) else {
                return Ok(());
            };
            let (from, to) = match direction {
                Direction::Forward => (source.handle, target.handle),
                Direction::Backward => (target.handle, source.handle),
            };
            // SAFETY: both ends are live while their endpoints exist.
            unsafe {
                (
                    Instance::from_raw_none(from as *mut RawInstance),
                    Instance::from_raw_none(to as *mut RawInstance),
                )
            }
        };

        let (from_property, to_property, custom) = match direction {
            Direction::Forward => (&self.source_property, &self.target_property, &self.transform_to),
            Direction::Backward => (&self.target_property, &self.source_property, &self.transform_from),
        };

        let value = from.get_property(from_property)?;
        let to_type = find_spec(to.type_(), to_property)?.value_type();

        let converted = match custom {
            Some(f) => f(&value),
            None if self.flags.contains(BindingFlags::INVERT_BOOLEAN) => {
                value.get_bool().map(|b| Value::from_bool(!b))
            }
            None => Some(value.transform(to_type).ok_or_else(|| Error::ValueTypeMismatch {
                expected: to_type.name().to_owned(),
                found: value.type_().name().to_owned(),
            })?),
        };

        match converted {
            Some(value) => to.set_property(to_property, value),
            None => Ok(()),
        }
    }
}

unsafe extern "C" fn endpoint_gone(data: *const c_void, where_the_object_was: *mut RawInstance) {
    // SAFETY: data came from Weak::into_raw in Binding::endpoint and each
    // weak notify runs at most once.
    let weak = unsafe { Weak::from_raw(data.cast::<Binding>()) };
    catch_boundary(|| {
        if let Some(binding) = weak.upgrade() {
            binding.endpoint_gone(where_the_object_was as usize);
        }
        Ok(())
    });
}

impl ObjectImpl for Binding {
    fn base(&self) -> &ObjectBase {
        self.parent.base()
    }
}

impl IsObject for Binding {
    fn static_type() -> Type {
        crate::init();
        register_type()
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("source_property", &self.source_property)
            .field("target_property", &self.target_property)
            .field("flags", &self.flags)
            .field("bound", &self.is_bound())
            .finish()
    }
}

fn find_spec(type_: Type, name: &str) -> Result<Arc<ParamSpec>> {
    type_.find_property(name).ok_or_else(|| Error::UnknownProperty {
        type_name: type_.name().to_owned(),
        property: name.to_owned(),
    })
}

fn check_end(base: &ObjectBase, name: &str, read: bool, write: bool) -> Result<Arc<ParamSpec>> {
    let spec = find_spec(base.type_(), name)?;
    if read && !spec.is_readable() {
        return Err(Error::PropertyNotReadable {
            property: spec.name().to_owned(),
        });
    }
    if write && !spec.is_writable() {
        return Err(Error::PropertyNotWritable {
            property: spec.name().to_owned(),
        });
    }
    Ok(spec)
}

/// Binds `target_property` of `target` to `source_property` of `source`.
///
/// # Errors
///
/// See [`bind_property_full`].
///
/// # Example
///
/// ```rust
/// use gobind::{bind_property, construct, BindingFlags, ClassBuilder, CustomType, Object, ObjectBase, ObjectImpl, ParamFlags, ParamSpec, Value};
/// use gobind::runtime::Type;
///
/// #[derive(Default)]
/// struct Knob { parent: Object }
///
/// impl ObjectImpl for Knob {
///     fn base(&self) -> &ObjectBase { self.parent.base() }
/// }
///
/// impl CustomType for Knob {
///     type Parent = Object;
///     fn class_init(class: &mut ClassBuilder<Self>) {
///         class.property(ParamSpec::new("level", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).unwrap());
///     }
/// }
///
/// let a = construct(Knob::default()).unwrap();
/// let b = construct(Knob::default()).unwrap();
/// let binding = bind_property(a.base(), "level", b.base(), "level", BindingFlags::BIDIRECTIONAL).unwrap();
///
/// a.base().property::<i32>("level").set_value(4).unwrap();
/// assert_eq!(b.base().property::<i32>("level").get_value(), Ok(4));
/// b.base().property::<i32>("level").set_value(9).unwrap();
/// assert_eq!(a.base().property::<i32>("level").get_value(), Ok(9));
///
/// binding.unbind();
/// a.base().property::<i32>("level").set_value(1).unwrap();
/// assert_eq!(b.base().property::<i32>("level").get_value(), Ok(9));
/// ```
pub fn bind_property(
    source: &ObjectBase,
    source_property: &str,
    target: &ObjectBase,
    target_property: &str,
    flags: BindingFlags,
) -> Result<RefPtr<Binding>> {
    bind_property_full(source, source_property, target, target_property, flags, None, None)
}

/// Binds two properties with custom conversions.
///
/// # Arguments
///
/// * `transform_to` - source to target conversion, default conversion if
///   `None`
/// * `transform_from` - target to source conversion, used with
///   [`BindingFlags::BIDIRECTIONAL`]
///
/// # Errors
///
/// - [`Error::UnknownProperty`] if either property does not exist
/// - [`Error::PropertyNotReadable`] or [`Error::PropertyNotWritable`] if a
///   property cannot be used in the requested direction
/// - [`Error::ValueTypeMismatch`] if [`BindingFlags::INVERT_BOOLEAN`] is
///   given for non-boolean properties
pub fn bind_property_full(
    source: &ObjectBase,
    source_property: &str,
    target: &ObjectBase,
    target_property: &str,
    flags: BindingFlags,
    transform_to: Option<TransformFn>,
    transform_from: Option<TransformFn>,
) -> Result<RefPtr<Binding>> {
    crate::init();
    let both_ways = flags.contains(BindingFlags::BIDIRECTIONAL);
    let source_spec = check_end(source, source_property, true, both_ways)?;
    let target_spec = check_end(target, target_property, both_ways, true)?;

    if flags.contains(BindingFlags::INVERT_BOOLEAN) {
        for spec in [&source_spec, &target_spec] {
            if spec.value_type() != Type::BOOL {
                return Err(Error::ValueTypeMismatch {
                    expected: Type::BOOL.name().to_owned(),
                    found: spec.value_type().name().to_owned(),
                });
            }
        }
    }

    let wrapper = Arc::new(Binding {
        parent: Object::uninit(),
        source_property: source_spec.name().to_owned(),
        target_property: target_spec.name().to_owned(),
        flags,
        transform_to,
        transform_from,
        state: Mutex::new(BindingState::default()),
        in_transfer: AtomicBool::new(false),
    });
    let binding = bind_native(Arc::clone(&wrapper), Instance::new(register_type())?);
    wrapper.attach(source, target, binding.instance().clone());

    debug!(
        "bound {}:{} -> {}:{} ({:?})",
        source.type_name(),
        wrapper.source_property,
        target.type_name(),
        wrapper.target_property,
        flags
    );

    if flags.contains(BindingFlags::SYNC_CREATE) {
        wrapper.transfer(Direction::Forward);
    }
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ParamFlags;

    fn endpoint_type(name: &str) -> Type {
        let type_ = Type::register_static(Type::OBJECT, name, TypeFlags::empty()).unwrap();
        type_
            .install_property(ParamSpec::new("flag", Type::BOOL, Value::from_bool(false), ParamFlags::READWRITE).unwrap())
            .unwrap();
        type_
            .install_property(ParamSpec::new("count", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).unwrap())
            .unwrap();
        type_
    }

    #[test]
    fn test_invert_boolean_sync_create() {
        let type_ = endpoint_type("BindingTestInvert");
        let a = Object::take(Instance::new(type_).unwrap());
        let b = Object::take(Instance::new(type_).unwrap());

        let binding = bind_property(
            a.base(),
            "flag",
            b.base(),
            "flag",
            BindingFlags::SYNC_CREATE | BindingFlags::INVERT_BOOLEAN,
        )
        .unwrap();
        assert_eq!(b.base().property::<bool>("flag").get_value(), Ok(true));

        a.base().property::<bool>("flag").set_value(true).unwrap();
        assert_eq!(b.base().property::<bool>("flag").get_value(), Ok(false));
        assert!(binding.is_bound());
        assert!(binding.source().is_some_and(|s| s.instance() == &a.base().instance()));
    }

    #[test]
    fn test_invert_boolean_rejects_numbers() {
        let type_ = endpoint_type("BindingTestInvertNumber");
        let a = Object::take(Instance::new(type_).unwrap());
        let b = Object::take(Instance::new(type_).unwrap());
        assert!(matches!(
            bind_property(a.base(), "count", b.base(), "count", BindingFlags::INVERT_BOOLEAN),
            Err(Error::ValueTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_source_disposal_unbinds() {
        let type_ = endpoint_type("BindingTestDispose");
        let a = Object::take(Instance::new(type_).unwrap());
        let b = Object::take(Instance::new(type_).unwrap());

        let binding = bind_property_full(
            a.base(),
            "count",
            b.base(),
            "count",
            BindingFlags::DEFAULT,
            Some(transform(|n: i32| Some(n * 10))),
            None,
        )
        .unwrap();
        a.base().property::<i32>("count").set_value(2).unwrap();
        assert_eq!(b.base().property::<i32>("count").get_value(), Ok(20));

        drop(a);
        assert!(!binding.is_bound());
        assert!(binding.source().is_none());
        binding.unbind();
    }
}

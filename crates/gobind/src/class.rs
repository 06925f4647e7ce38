//! Custom runtime types backed by Rust wrappers.
//!
//! A custom wrapper embeds an [`Object`](crate::Object) (or another custom
//! wrapper), implements [`CustomType`], and is instantiated with
//! [`construct`]. The runtime type is registered the first time it is
//! needed, once per Rust type, and before any instance of it exists, since
//! an instance's vtable is fixed when it is created.
//!
//! # Example
//!
//! ```rust
//! use gobind::{construct, ClassBuilder, CustomType, Object, ObjectBase, ObjectImpl, ParamFlags, ParamSpec, Value};
//! use gobind::runtime::Type;
//!
//! #[derive(Default)]
//! struct Counter {
//!     parent: Object,
//! }
//!
//! impl ObjectImpl for Counter {
//!     fn base(&self) -> &ObjectBase {
//!         self.parent.base()
//!     }
//! }
//!
//! impl CustomType for Counter {
//!     const NAME: Option<&'static str> = Some("DocCounter");
//!     type Parent = Object;
//!
//!     fn class_init(class: &mut ClassBuilder<Self>) {
//!         class.property(
//!             ParamSpec::new("count", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).unwrap(),
//!         );
//!     }
//! }
//!
//! let counter = construct(Counter::default()).unwrap();
//! counter.base().property::<i32>("count").set_value(3).unwrap();
//! assert_eq!(counter.base().property::<i32>("count").get_value(), Ok(3));
//! assert_eq!(counter.base().type_name(), "DocCounter");
//! ```

use crate::error::{Error, Result, invariant_violation};
use crate::exception::catch_boundary;
use crate::interface::install_interface_properties;
use crate::object::{IsObject, ObjectImpl, RefPtr, bind_native};
use crate::object_base::CustomTypeName;
use crate::runtime::signal::signal_new;
use crate::runtime::{Instance, ParamSpec, RawInstance, SignalFlags, SignalId, Type, TypeFlags, VFunc, Value};
use crate::value::{coerce, native_type_name};
use crate::wrap::WrapperRegistry;
use fxhash::FxHashMap;
use gobind_log::debug;
use gobind_mem::{Quark, global_arena};
use std::any::TypeId;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock};

/// A virtual function implemented in Rust.
pub type VFuncImpl<T> = dyn Fn(&T, &[Value]) -> Result<Option<Value>> + Send + Sync;

/// A wrapper whose runtime type is registered by this crate.
pub trait CustomType: ObjectImpl + Sized {
    /// Runtime type name. `None` generates one from the Rust type path.
    const NAME: Option<&'static str> = None;

    /// The wrapper of the parent runtime type.
    type Parent: IsObject;

    /// Installs properties, signals, vfunc overrides and interfaces.
    ///
    /// Must use [`ClassBuilder::type_`], not `Self::static_type()`: the type
    /// is still being registered.
    fn class_init(class: &mut ClassBuilder<Self>) {
        let _ = class;
    }
}

impl<T: CustomType> IsObject for T {
    /// # Panics
    ///
    /// Panics (binding invariant) if the type cannot be registered.
    fn static_type() -> Type {
        match register_custom_type::<T>() {
            Ok(type_) => type_,
            Err(e) => invariant_violation(format_args!(
                "cannot register custom type {}: {e}",
                std::any::type_name::<T>()
            )),
        }
    }
}

type Registration = Arc<OnceLock<Result<Type>>>;

fn registrations() -> &'static Mutex<FxHashMap<TypeId, Registration>> {
    static REGISTRATIONS: OnceLock<Mutex<FxHashMap<TypeId, Registration>>> = OnceLock::new();
    REGISTRATIONS.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Registers the runtime type of `T`, once.
///
/// Concurrent callers block until the first registration finishes and all
/// get its result.
///
/// # Errors
///
/// Any error from type registration or from `T::class_init`.
pub fn register_custom_type<T: CustomType>() -> Result<Type> {
    let cell = {
        let mut regs = match registrations().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(regs.entry(TypeId::of::<T>()).or_default())
    };
    cell.get_or_init(register_class::<T>).clone()
}

fn register_class<T: CustomType>() -> Result<Type> {
    crate::init();

    let parent = T::Parent::static_type();
    let name = match T::NAME {
        Some(name) => name.to_owned(),
        None => native_type_name("gobind__CustomObject_", std::any::type_name::<T>()),
    };
    let type_ = Type::register_static(parent, &name, TypeFlags::empty())?;

    let mut builder = ClassBuilder::<T> {
        type_,
        error: None,
        _marker: PhantomData,
    };
    T::class_init(&mut builder);
    builder.finish()?;

    debug!("registered custom type '{}' for {}", name, std::any::type_name::<T>());
    Ok(type_)
}

/// Creates a native instance of `T`'s custom type and binds `wrapper` to
/// it.
///
/// The wrapper is owned by the native instance: it lives until the last
/// native reference is gone.
///
/// # Errors
///
/// Registration errors of `T`.
///
/// # Panics
///
/// Panics (binding invariant) if `wrapper` is already bound.
pub fn construct<T: CustomType>(wrapper: T) -> Result<RefPtr<T>> {
    let type_ = register_custom_type::<T>()?;
    if wrapper.base().is_bound() {
        invariant_violation(format_args!("construct() given a wrapper that is already bound"));
    }

    wrapper.base().set_custom_type(match T::NAME {
        Some(name) => CustomTypeName::Named(name),
        None => CustomTypeName::Anonymous,
    });
    let instance = Instance::new(type_)?;
    Ok(bind_native(Arc::new(wrapper), instance))
}

/// Collects the class definition of a custom type.
///
/// Methods record the first error and keep going; it is returned from
/// registration.
pub struct ClassBuilder<T> {
    type_: Type,
    error: Option<Error>,
    _marker: PhantomData<fn() -> T>,
}

struct VFuncSlot<T> {
    func: Box<VFuncImpl<T>>,
    parent: Option<VFunc>,
}

impl<T: CustomType> ClassBuilder<T> {
    /// The type being registered.
    #[must_use]
    pub fn type_(&self) -> Type {
        self.type_
    }

    fn record<R>(&mut self, result: Result<R>) -> Option<R> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
                None
            }
        }
    }

    /// Installs a property.
    pub fn property(&mut self, spec: ParamSpec) -> &mut Self {
        let result = self.type_.install_property(spec);
        self.record(result);
        self
    }

    /// Registers a signal without a class handler.
    pub fn signal(
        &mut self,
        name: &str,
        flags: SignalFlags,
        params: &[Type],
        return_type: Type,
    ) -> Option<SignalId> {
        let result = signal_new(name, self.type_, flags, params, return_type, None);
        self.record(result)
    }

    /// Registers a signal whose class handler is `handler`.
    ///
    /// The handler is stored as a vfunc named after the signal, so
    /// subtypes can override it with [`ClassBuilder::override_vfunc`].
    pub fn signal_with_class_handler(
        &mut self,
        name: &str,
        flags: SignalFlags,
        params: &[Type],
        return_type: Type,
        handler: impl Fn(&T, &[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    ) -> Option<SignalId> {
        let vfunc_name = name.replace('_', "-");
        let result = signal_new(name, self.type_, flags, params, return_type, Some(&vfunc_name));
        let id = self.record(result)?;
        self.override_vfunc(&vfunc_name, handler);
        Some(id)
    }

    /// Overrides a class vfunc. Instances without a live wrapper run the
    /// parent's implementation instead.
    pub fn override_vfunc(
        &mut self,
        name: &str,
        f: impl Fn(&T, &[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    ) -> &mut Self {
        let parent = self
            .type_
            .parent()
            .and_then(|p| p.lookup_vfunc(Quark::from_str(name)));
        self.type_.override_vfunc(name, make_vfunc::<T>(Box::new(f), parent));
        self
    }

    /// Declares that the type implements `iface`, installing overriding
    /// copies of the interface's properties.
    pub fn implement_interface(&mut self, iface: Type) -> &mut Self {
        let result = self
            .type_
            .add_interface(iface)
            .and_then(|()| install_interface_properties(self.type_, iface));
        self.record(result);
        self
    }

    /// Overrides an interface vfunc for this type.
    pub fn override_interface_vfunc(
        &mut self,
        iface: Type,
        name: &str,
        f: impl Fn(&T, &[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    ) -> &mut Self {
        let parent = self.type_.lookup_interface_vfunc(iface, Quark::from_str(name));
        let vfunc = make_vfunc::<T>(Box::new(f), parent);
        let result = self.type_.override_interface_vfunc(iface, name, vfunc);
        self.record(result);
        self
    }

    /// Records an error raised while building the class.
    pub fn fail(&mut self, error: Error) {
        self.record::<()>(Err(error));
    }

    fn finish(self) -> Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn make_vfunc<T: CustomType>(func: Box<VFuncImpl<T>>, parent: Option<VFunc>) -> VFunc {
    // Vtable slots are permanent.
    let slot: &'static VFuncSlot<T> = global_arena().alloc(VFuncSlot { func, parent });
    VFunc {
        func: vfunc_trampoline::<T>,
        data: std::ptr::from_ref(slot).cast(),
    }
}

unsafe extern "C" fn vfunc_trampoline<T: CustomType>(
    data: *const c_void,
    instance: *mut RawInstance,
    args: *const Value,
    n_args: usize,
    ret: *mut Value,
) {
    // SAFETY: data is the arena slot created by make_vfunc::<T>.
    let slot = unsafe { &*data.cast::<VFuncSlot<T>>() };
    let args = if n_args == 0 {
        &[][..]
    } else {
        // SAFETY: the runtime passes n_args initialized values.
        unsafe { std::slice::from_raw_parts(args, n_args) }
    };

    let wrapper = WrapperRegistry::global()
        .lookup(instance)
        .and_then(|w| w.as_any_arc().downcast::<T>().ok());

    let Some(wrapper) = wrapper else {
        if let Some(parent) = slot.parent {
            // SAFETY: ret is null or an initialized return slot.
            unsafe { parent.call(instance, args, ret.as_mut()) };
        }
        return;
    };

    // SAFETY: as above.
    let ret_type = unsafe { ret.as_ref() }.map(Value::type_);
    let result = catch_boundary(|| {
        let value = (slot.func)(&wrapper, args)?;
        match (value, ret_type) {
            (Some(value), Some(type_)) => coerce(value, type_).map(Some),
            _ => Ok(None),
        }
    });

    if let Some(Some(value)) = result {
        // SAFETY: ret_type is Some, so ret is a valid return slot.
        unsafe { *ret = value };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use crate::object_base::ObjectBase;
    use crate::runtime::ParamFlags;

    #[derive(Default)]
    struct Plain {
        parent: Object,
    }

    impl ObjectImpl for Plain {
        fn base(&self) -> &ObjectBase {
            self.parent.base()
        }
    }

    impl CustomType for Plain {
        type Parent = Object;
    }

    #[test]
    fn test_anonymous_type_registered_once() {
        let a = register_custom_type::<Plain>().unwrap();
        let b = register_custom_type::<Plain>().unwrap();
        assert_eq!(a, b);
        assert!(a.name().starts_with("gobind__CustomObject_"));
        assert_eq!(a.parent(), Some(Type::OBJECT));

        let obj = construct(Plain::default()).unwrap();
        assert!(obj.base().is_anonymous_custom());
        assert!(obj.base().is_derived());
        assert!(obj.base().is_a(Type::OBJECT));
    }

    #[test]
    fn test_custom_wrapper_downcasts_after_upcast() {
        let obj = construct(Plain::default()).unwrap();
        let erased = obj.clone().upcast();

        let plain = erased.downcast_ref::<Plain>().unwrap();
        assert!(std::ptr::eq(plain, &*obj));
        assert!(erased.downcast_ref::<Object>().is_none());

        let back = erased.downcast::<Plain>().unwrap();
        assert_eq!(back, obj);
    }

    struct Broken {
        parent: Object,
    }

    impl ObjectImpl for Broken {
        fn base(&self) -> &ObjectBase {
            self.parent.base()
        }
    }

    impl CustomType for Broken {
        const NAME: Option<&'static str> = Some("ClassTestBroken");
        type Parent = Object;

        fn class_init(class: &mut ClassBuilder<Self>) {
            let spec = ParamSpec::new("dup", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).unwrap();
            class.property(spec.clone()).property(spec);
        }
    }

    #[test]
    fn test_class_init_error_is_reported() {
        let err = register_custom_type::<Broken>().unwrap_err();
        assert!(matches!(err, Error::PropertyAlreadyExists { .. }));
        // The failure is remembered.
        assert_eq!(register_custom_type::<Broken>().unwrap_err(), err);

        let result = construct(Broken {
            parent: Object::uninit(),
        });
        assert!(result.is_err());
    }
}

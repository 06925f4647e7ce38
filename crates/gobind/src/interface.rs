//! Interface views over a wrapper.
//!
//! An interface is not a Rust trait object here. An [`Interface`] is a view
//! pairing a wrapper's [`ObjectBase`] with an interface type, and every
//! method call goes through the native instance's interface vtable. That
//! way a native subtype this crate never wrapped, and a custom type
//! overriding the interface in Rust, dispatch the same way.
//!
//! Typed views (for example [`Converter`](crate::Converter)) implement
//! [`InterfaceView`] and are obtained with
//! [`ObjectBase::interface`](crate::ObjectBase::interface).

use crate::error::{Error, Result};
use crate::object_base::ObjectBase;
use crate::property::PropertyProxy;
use crate::runtime::{ParamSpec, Type, Value};
use crate::signal_proxy::{SignalArgs, SignalProxy, SignalReturn};
use crate::value::ValueType;
use gobind_mem::Quark;
use std::borrow::Cow;

/// A runtime interface type.
pub trait IsInterface {
    /// The interface type.
    fn static_type() -> Type;
}

/// A typed view built from an untyped [`Interface`].
pub trait InterfaceView<'a>: IsInterface + Sized {
    /// Wraps a checked view.
    fn from_interface(iface: Interface<'a>) -> Self;
}

/// An object seen through one of its interfaces.
#[derive(Debug, Clone, Copy)]
pub struct Interface<'a> {
    base: &'a ObjectBase,
    iface: Type,
}

impl<'a> Interface<'a> {
    /// Creates a view of `base` as `iface`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAnInterface`] if `iface` is not an interface type
    /// - [`Error::InterfaceNotImplemented`] if the instance's type does not
    ///   implement it
    pub fn new(base: &'a ObjectBase, iface: Type) -> Result<Self> {
        if !iface.is_interface() {
            return Err(Error::NotAnInterface {
                type_name: iface.name().to_owned(),
            });
        }
        let type_ = base.type_();
        if !type_.is_a(iface) {
            return Err(Error::InterfaceNotImplemented {
                type_name: type_.name().to_owned(),
                interface: iface.name().to_owned(),
            });
        }
        Ok(Interface { base, iface })
    }

    /// The object behind the view.
    #[must_use]
    pub fn base(&self) -> &'a ObjectBase {
        self.base
    }

    /// The interface type.
    #[must_use]
    pub fn interface_type(&self) -> Type {
        self.iface
    }

    /// Calls an interface vfunc on the instance's most derived
    /// implementation.
    ///
    /// # Arguments
    ///
    /// * `name` - vfunc name
    /// * `args` - arguments, excluding the instance
    /// * `ret_type` - type of the return slot, [`Type::NONE`] for none
    ///
    /// # Errors
    ///
    /// [`Error::MissingVFunc`] if neither the type nor the interface
    /// provides the vfunc.
    pub fn call_vfunc(&self, name: &str, args: &[Value], ret_type: Type) -> Result<Value> {
        let instance = self.base.instance();
        let vfunc = instance
            .type_()
            .lookup_interface_vfunc(self.iface, Quark::from_str(name))
            .ok_or_else(|| Error::MissingVFunc {
                type_name: instance.type_().name().to_owned(),
                vfunc: format!("{}::{name}", self.iface),
            })?;

        let mut ret = Value::new(ret_type);
        let slot = (ret_type != Type::NONE).then_some(&mut ret);
        // SAFETY: the instance reference is held for the call.
        unsafe { vfunc.call(instance.as_ptr(), args, slot) };
        Ok(ret)
    }

    /// Typed proxy for a property declared by the interface.
    #[must_use]
    pub fn property<T: ValueType>(&self, name: &'a str) -> PropertyProxy<'a, T> {
        PropertyProxy::new(self.base, name)
    }

    /// Typed proxy for a signal declared by the interface.
    #[must_use]
    pub fn signal<Args: SignalArgs, R: SignalReturn>(
        &self,
        name: impl Into<Cow<'a, str>>,
    ) -> SignalProxy<'a, Args, R> {
        SignalProxy::new(self.base, name)
    }
}

/// Installs overriding copies of `iface`'s properties on `type_`.
///
/// Runs once per (type, interface) pair; later calls return immediately.
/// Properties the type already declares itself are left alone.
///
/// # Errors
///
/// Propagates [`Type::install_property`] errors.
pub fn install_interface_properties(type_: Type, iface: Type) -> Result<()> {
    let key = Quark::from_str(&format!("gobind-iface-props-{}", iface.name()));
    if type_.qdata(key).is_some() {
        return Ok(());
    }

    for spec in iface.properties() {
        if type_.find_own_property(spec.name()).is_none() {
            type_.install_property(ParamSpec::overriding(&spec))?;
        }
    }
    type_.set_qdata(key, 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Object, ObjectImpl};
    use crate::runtime::{ParamFlags, TypeFlags};

    #[test]
    fn test_interface_properties_installed_once() {
        let iface = Type::register_interface("IfaceTestLabelled", &[Type::OBJECT]).unwrap();
        iface
            .install_property(
                ParamSpec::new("label", Type::STRING, Value::from_string("none"), ParamFlags::READWRITE).unwrap(),
            )
            .unwrap();
        let type_ = Type::register_static(Type::OBJECT, "IfaceTestLabelledImpl", TypeFlags::empty()).unwrap();
        type_.add_interface(iface).unwrap();

        install_interface_properties(type_, iface).unwrap();
        install_interface_properties(type_, iface).unwrap();

        let spec = type_.find_own_property("label").unwrap();
        assert_eq!(spec.owner(), type_);
        assert_eq!(spec.overridden(), Some(iface));
        assert_eq!(spec.default_value().get_string(), Some("none"));
    }

    #[test]
    fn test_view_requires_implementation() {
        let iface = Type::register_interface("IfaceTestUnimplemented", &[Type::OBJECT]).unwrap();
        let obj = Object::new().unwrap();

        assert!(matches!(
            Interface::new(obj.base(), iface),
            Err(Error::InterfaceNotImplemented { .. })
        ));
        assert!(matches!(
            Interface::new(obj.base(), Type::OBJECT),
            Err(Error::NotAnInterface { .. })
        ));
    }
}

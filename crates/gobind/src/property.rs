//! Typed property proxies.
//!
//! A proxy is a borrowed (wrapper, name) pair built on demand. The property
//! is looked up on every access, so a proxy for a name the type does not
//! have fails when it is used, not when it is created. Values are never
//! cached: every read goes to the native instance.

use crate::error::{Error, Result};
use crate::object_base::ObjectBase;
use crate::runtime::ParamSpec;
use crate::signal_proxy::SignalProxy;
use crate::value::ValueType;
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

fn lookup<T: ValueType>(base: &ObjectBase, name: &str, access: Access) -> Result<Arc<ParamSpec>> {
    let type_ = base.type_();
    let spec = type_
        .find_property(name)
        .ok_or_else(|| Error::UnknownProperty {
            type_name: type_.name().to_owned(),
            property: name.to_owned(),
        })?;

    match access {
        Access::Read if !spec.is_readable() => {
            return Err(Error::PropertyNotReadable {
                property: spec.name().to_owned(),
            });
        }
        Access::Write if !spec.is_writable() => {
            return Err(Error::PropertyNotWritable {
                property: spec.name().to_owned(),
            });
        }
        _ => {}
    }

    if !spec.value_type().is_a(T::static_type()) {
        return Err(Error::PropertyTypeMismatch {
            property: spec.name().to_owned(),
            expected: spec.value_type().name().to_owned(),
            found: T::static_type().name().to_owned(),
        });
    }
    Ok(spec)
}

fn get<T: ValueType>(base: &ObjectBase, name: &str) -> Result<T> {
    let spec = lookup::<T>(base, name, Access::Read)?;
    let value = base.instance().get_property(spec.name())?;
    T::from_value(&value)
}

fn set<T: ValueType>(base: &ObjectBase, name: &str, value: &T) -> Result<()> {
    let spec = lookup::<T>(base, name, Access::Write)?;
    base.instance().set_property(spec.name(), value.to_value())
}

fn changed<'a>(base: &'a ObjectBase, name: &str) -> SignalProxy<'a, (), ()> {
    SignalProxy::new(base, format!("notify::{name}"))
}

/// Read/write access to one property.
///
/// # Example
///
/// ```rust
/// use gobind::{construct, ClassBuilder, CustomType, Object, ObjectBase, ObjectImpl, ParamFlags, ParamSpec, Value};
/// use gobind::runtime::Type;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// #[derive(Default)]
/// struct Note { parent: Object }
///
/// impl ObjectImpl for Note {
///     fn base(&self) -> &ObjectBase { self.parent.base() }
/// }
///
/// impl CustomType for Note {
///     type Parent = Object;
///     fn class_init(class: &mut ClassBuilder<Self>) {
///         class.property(ParamSpec::new("text", Type::STRING, Value::from_string(""), ParamFlags::READWRITE).unwrap());
///     }
/// }
///
/// let note = construct(Note::default()).unwrap();
/// let text = note.base().property::<String>("text");
///
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// text.signal_changed().connect(move || { counter.fetch_add(1, Ordering::SeqCst); }, false);
///
/// text.set_value("hello".to_owned()).unwrap();
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// assert_eq!(text.get_value().unwrap(), "hello");
/// ```
pub struct PropertyProxy<'a, T> {
    base: &'a ObjectBase,
    name: &'a str,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: ValueType> PropertyProxy<'a, T> {
    /// Creates a proxy. Nothing is checked until first use.
    #[must_use]
    pub fn new(base: &'a ObjectBase, name: &'a str) -> Self {
        PropertyProxy {
            base,
            name,
            _marker: PhantomData,
        }
    }

    /// The property name as given.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// The object the property belongs to.
    #[must_use]
    pub fn object(&self) -> &'a ObjectBase {
        self.base
    }

    /// Reads the current value.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownProperty`] if the type has no such property
    /// - [`Error::PropertyNotReadable`] for write-only properties
    /// - [`Error::PropertyTypeMismatch`] if the property is not a `T`
    pub fn get_value(&self) -> Result<T> {
        get(self.base, self.name)
    }

    /// Writes a value. Change handlers have run when this returns.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownProperty`] if the type has no such property
    /// - [`Error::PropertyNotWritable`] for read-only properties
    /// - [`Error::PropertyTypeMismatch`] if the property is not a `T`
    pub fn set_value(&self, value: T) -> Result<()> {
        set(self.base, self.name, &value)
    }

    /// Restores the registered default.
    ///
    /// # Errors
    ///
    /// Same as [`PropertyProxy::set_value`].
    pub fn reset_value(&self) -> Result<()> {
        let spec = lookup::<T>(self.base, self.name, Access::Write)?;
        self.base
            .instance()
            .set_property(spec.name(), spec.default_value().clone())
    }

    /// The change notification of this property.
    #[must_use]
    pub fn signal_changed(&self) -> SignalProxy<'a, (), ()> {
        changed(self.base, self.name)
    }
}

/// Read-only access to one property.
pub struct PropertyProxyReadOnly<'a, T> {
    base: &'a ObjectBase,
    name: &'a str,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: ValueType> PropertyProxyReadOnly<'a, T> {
    /// Creates a proxy.
    #[must_use]
    pub fn new(base: &'a ObjectBase, name: &'a str) -> Self {
        PropertyProxyReadOnly {
            base,
            name,
            _marker: PhantomData,
        }
    }

    /// The property name as given.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Reads the current value.
    ///
    /// # Errors
    ///
    /// Same as [`PropertyProxy::get_value`].
    pub fn get_value(&self) -> Result<T> {
        get(self.base, self.name)
    }

    /// The change notification of this property.
    #[must_use]
    pub fn signal_changed(&self) -> SignalProxy<'a, (), ()> {
        changed(self.base, self.name)
    }
}

/// Write-only access to one property.
pub struct PropertyProxyWriteOnly<'a, T> {
    base: &'a ObjectBase,
    name: &'a str,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: ValueType> PropertyProxyWriteOnly<'a, T> {
    /// Creates a proxy.
    #[must_use]
    pub fn new(base: &'a ObjectBase, name: &'a str) -> Self {
        PropertyProxyWriteOnly {
            base,
            name,
            _marker: PhantomData,
        }
    }

    /// The property name as given.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Writes a value.
    ///
    /// # Errors
    ///
    /// Same as [`PropertyProxy::set_value`].
    pub fn set_value(&self, value: T) -> Result<()> {
        set(self.base, self.name, &value)
    }

    /// The change notification of this property.
    #[must_use]
    pub fn signal_changed(&self) -> SignalProxy<'a, (), ()> {
        changed(self.base, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Object, ObjectImpl};

    #[test]
    fn test_unknown_property_fails_at_use() {
        let obj = Object::new().unwrap();
        let proxy = obj.base().property::<i32>("no-such-thing");
        assert_eq!(proxy.name(), "no-such-thing");
        assert!(matches!(proxy.get_value(), Err(Error::UnknownProperty { .. })));
        assert!(matches!(proxy.set_value(1), Err(Error::UnknownProperty { .. })));
    }
}

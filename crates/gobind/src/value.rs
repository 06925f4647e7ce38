//! Typed conversion to and from native [`Value`]s.
//!
//! Every Rust type that can travel through a property or a signal
//! implements [`ValueType`], which names exactly one runtime type and
//! converts in both directions. Conversions are checked: reading a value of
//! another type is an error, never a reinterpretation.

use crate::error::{DomainError, Error, Result};
use crate::object::{IsObject, ObjectImpl, RefPtr};
use crate::runtime::{Type, Value};
use crate::variant::{Variant, VariantBase, VariantKind};
use crate::wrap::WrapperRegistry;
use fxhash::FxHashMap;
use std::any::{Any, TypeId};
use std::sync::{Mutex, OnceLock};

/// A Rust type with a fixed runtime value type.
pub trait ValueType: Sized {
    /// The runtime type values of `Self` are stored as.
    fn static_type() -> Type;

    /// Stores `self` in a new value.
    fn to_value(&self) -> Value;

    /// Reads a value.
    ///
    /// # Errors
    ///
    /// [`Error::ValueTypeMismatch`] if the value holds another type.
    fn from_value(value: &Value) -> Result<Self>;
}

pub(crate) fn mismatch(expected: Type, value: &Value) -> Error {
    Error::ValueTypeMismatch {
        expected: expected.name().to_owned(),
        found: value.type_().name().to_owned(),
    }
}

/// Converts `value` into a value of `type_`, keeping it as is when it
/// already holds that type.
pub(crate) fn coerce(value: Value, type_: Type) -> Result<Value> {
    if value.holds(type_) {
        return Ok(value);
    }
    value.transform(type_).ok_or_else(|| mismatch(type_, &value))
}

/// Turns a Rust type path into a valid runtime type name.
pub(crate) fn native_type_name(prefix: &str, rust_name: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + rust_name.len());
    out.push_str(prefix);
    for c in rust_name.chars() {
        out.push(if c.is_ascii_alphanumeric() { c } else { '_' });
    }
    out
}

macro_rules! fundamental_value_type {
    ($($ty:ty => $type_const:ident, $ctor:ident, $getter:ident;)*) => {
        $(
            impl ValueType for $ty {
                fn static_type() -> Type {
                    Type::$type_const
                }

                fn to_value(&self) -> Value {
                    Value::$ctor(*self)
                }

                fn from_value(value: &Value) -> Result<Self> {
                    value.$getter().ok_or_else(|| mismatch(Type::$type_const, value))
                }
            }
        )*
    };
}

fundamental_value_type! {
    bool => BOOL, from_bool, get_bool;
    i32 => I32, from_i32, get_i32;
    u32 => U32, from_u32, get_u32;
    i64 => I64, from_i64, get_i64;
    u64 => U64, from_u64, get_u64;
    f32 => F32, from_f32, get_f32;
    f64 => F64, from_f64, get_f64;
}

impl ValueType for String {
    fn static_type() -> Type {
        Type::STRING
    }

    fn to_value(&self) -> Value {
        Value::from_string(self.as_str())
    }

    /// A null string reads as empty.
    fn from_value(value: &Value) -> Result<Self> {
        if !value.holds(Type::STRING) {
            return Err(mismatch(Type::STRING, value));
        }
        Ok(value.get_string().unwrap_or_default().to_owned())
    }
}

impl ValueType for Option<String> {
    fn static_type() -> Type {
        Type::STRING
    }

    fn to_value(&self) -> Value {
        Value::from_opt_string(self.clone())
    }

    fn from_value(value: &Value) -> Result<Self> {
        if !value.holds(Type::STRING) {
            return Err(mismatch(Type::STRING, value));
        }
        Ok(value.get_string().map(str::to_owned))
    }
}

impl ValueType for VariantBase {
    fn static_type() -> Type {
        Type::VARIANT
    }

    fn to_value(&self) -> Value {
        Value::from_variant(Some(self.raw().clone()))
    }

    fn from_value(value: &Value) -> Result<Self> {
        value
            .get_variant()
            .map(|raw| VariantBase::from_raw(raw.clone()))
            .ok_or_else(|| mismatch(Type::VARIANT, value))
    }
}

impl<T: VariantKind> ValueType for Variant<T> {
    fn static_type() -> Type {
        Type::VARIANT
    }

    fn to_value(&self) -> Value {
        Value::from_variant(Some(self.raw().clone()))
    }

    /// # Errors
    ///
    /// Also fails with [`Error::VariantTypeMismatch`] if the variant's
    /// signature is not `T`'s.
    fn from_value(value: &Value) -> Result<Self> {
        VariantBase::from_value(value)?.cast_dynamic::<T>()
    }
}

impl<T: IsObject + ObjectImpl> ValueType for RefPtr<T> {
    fn static_type() -> Type {
        T::static_type()
    }

    fn to_value(&self) -> Value {
        Value::from_object(T::static_type(), Some(self.instance().clone()))
    }

    /// Resolves the handle to its wrapper, creating one if needed.
    fn from_value(value: &Value) -> Result<Self> {
        let instance = value
            .get_object()
            .ok_or_else(|| mismatch(T::static_type(), value))?;
        WrapperRegistry::global()
            .wrap_instance(instance.clone())
            .downcast::<T>()
            .map_err(|_| mismatch(T::static_type(), value))
    }
}

impl<T: IsObject + ObjectImpl> ValueType for Option<RefPtr<T>> {
    fn static_type() -> Type {
        T::static_type()
    }

    fn to_value(&self) -> Value {
        Value::from_object(T::static_type(), self.as_ref().map(|p| p.instance().clone()))
    }

    fn from_value(value: &Value) -> Result<Self> {
        if !value.holds(T::static_type()) && value.get_object().is_none() {
            return Err(mismatch(T::static_type(), value));
        }
        match value.get_object() {
            Some(_) => RefPtr::<T>::from_value(value).map(Some),
            None => Ok(None),
        }
    }
}

impl ValueType for RefPtr<dyn ObjectImpl> {
    fn static_type() -> Type {
        Type::OBJECT
    }

    fn to_value(&self) -> Value {
        Value::from_object(self.instance().type_(), Some(self.instance().clone()))
    }

    fn from_value(value: &Value) -> Result<Self> {
        let instance = value
            .get_object()
            .ok_or_else(|| mismatch(Type::OBJECT, value))?;
        Ok(WrapperRegistry::global().wrap_instance(instance.clone()))
    }
}

impl ValueType for DomainError {
    fn static_type() -> Type {
        Type::ERROR
    }

    fn to_value(&self) -> Value {
        Value::from_error(self.clone())
    }

    fn from_value(value: &Value) -> Result<Self> {
        value
            .get_error()
            .cloned()
            .ok_or_else(|| mismatch(Type::ERROR, value))
    }
}

/// A Rust value stored as an opaque boxed native value.
///
/// Each `T` gets its own boxed runtime type on first use. Copying the
/// native value clones `T`.
///
/// # Example
///
/// ```rust
/// use gobind::{Boxed, ValueType};
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Point { x: i32, y: i32 }
///
/// let value = Boxed(Point { x: 1, y: 2 }).to_value();
/// let copy = value.clone();
/// assert_eq!(Boxed::<Point>::from_value(&copy).unwrap().0, Point { x: 1, y: 2 });
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Boxed<T>(pub T);

/// The boxed runtime type holding `T`.
///
/// # Panics
///
/// Panics (binding invariant) if a type with the generated name already
/// exists and was not registered here.
#[must_use]
pub fn boxed_type<T: Any>() -> Type {
    static TYPES: OnceLock<Mutex<FxHashMap<TypeId, Type>>> = OnceLock::new();
    let types = TYPES.get_or_init(|| Mutex::new(FxHashMap::default()));
    let mut types = match types.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    *types.entry(TypeId::of::<T>()).or_insert_with(|| {
        let name = native_type_name("GobindBoxed_", std::any::type_name::<T>());
        match Type::register_boxed(&name) {
            Ok(type_) => type_,
            Err(e) => crate::error::invariant_violation(format_args!(
                "cannot register boxed type '{name}': {e}"
            )),
        }
    })
}

impl<T: Any + Clone + Send + Sync> ValueType for Boxed<T> {
    fn static_type() -> Type {
        boxed_type::<T>()
    }

    fn to_value(&self) -> Value {
        Value::from_boxed(boxed_type::<T>(), Box::new(self.0.clone()))
    }

    fn from_value(value: &Value) -> Result<Self> {
        value
            .get_boxed::<T>()
            .cloned()
            .map(Boxed)
            .ok_or_else(|| mismatch(boxed_type::<T>(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoError;

    #[test]
    fn test_fundamentals_are_checked() {
        let v = 7i32.to_value();
        assert_eq!(i32::from_value(&v), Ok(7));
        assert!(matches!(u32::from_value(&v), Err(Error::ValueTypeMismatch { .. })));
        assert!(bool::from_value(&v).is_err());
    }

    #[test]
    fn test_float_bits_survive() {
        let v = f64::NAN.to_value();
        assert!(f64::from_value(&v).unwrap().is_nan());
        let v = (-0.0f32).to_value();
        assert_eq!(f32::from_value(&v).unwrap().to_bits(), (-0.0f32).to_bits());
    }

    #[test]
    fn test_null_string_reads_as_empty() {
        let v = Value::new(Type::STRING);
        assert_eq!(String::from_value(&v).unwrap(), "");
        assert_eq!(Option::<String>::from_value(&v).unwrap(), None);
    }

    #[test]
    fn test_boxed_deep_copies() {
        let v = Boxed(vec![1u8, 2, 3]).to_value();
        let copy = v.clone();
        drop(v);
        assert_eq!(Boxed::<Vec<u8>>::from_value(&copy).unwrap().0, vec![1, 2, 3]);
        assert_eq!(copy.type_(), boxed_type::<Vec<u8>>());
        assert!(Boxed::<String>::from_value(&copy).is_err());
    }

    #[test]
    fn test_domain_error_value() {
        let err = DomainError::new(IoError::domain(), 1, "missing");
        let v = err.to_value();
        assert_eq!(v.type_(), Type::ERROR);
        assert_eq!(DomainError::from_value(&v).unwrap(), err);
    }

    #[test]
    fn test_coerce_prefers_exact_type() {
        let v = coerce(Value::from_i32(3), Type::I32).unwrap();
        assert_eq!(v.get_i32(), Some(3));
        let v = coerce(Value::from_i32(3), Type::F64).unwrap();
        assert_eq!(v.get_f64(), Some(3.0));
        assert!(coerce(Value::from_string("x"), Type::I32).is_err());
    }

    #[test]
    fn test_native_type_name() {
        assert_eq!(native_type_name("P_", "a::B<u8>"), "P_a__B_u8_");
    }
}

//! The native tagged-union value container.
//!
//! A [`Value`] pairs a [`Type`] with storage for that type. Property
//! storage, signal arguments and vfunc arguments all travel as `Value`s.
//! Copies are deep for boxed values and reference bumps for objects and
//! variants.

use crate::error::DomainError;
use crate::runtime::instance::Instance;
use crate::runtime::types::{Type, TypeKind};
use crate::runtime::variant::RawVariant;
use std::any::Any;
use std::fmt;

/// A Rust value stored in a boxed [`Value`].
///
/// Implemented for every `Clone + Send + Sync` type; copying the value
/// deep-copies the box.
pub trait BoxedValue: Send + Sync {
    /// Clones into a new box.
    fn clone_boxed(&self) -> Box<dyn BoxedValue>;
    /// Upcasts for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Clone + Send + Sync> BoxedValue for T {
    fn clone_boxed(&self) -> Box<dyn BoxedValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Storage of a [`Value`].
pub enum ValueData {
    /// No value (`void` or invalid).
    Empty,
    /// `gboolean`.
    Bool(bool),
    /// `gint`.
    I32(i32),
    /// `guint`.
    U32(u32),
    /// `gint64`.
    I64(i64),
    /// `guint64`.
    U64(u64),
    /// `gfloat`.
    F32(f32),
    /// `gdouble`.
    F64(f64),
    /// Nullable string.
    Str(Option<String>),
    /// Nullable object reference.
    Object(Option<Instance>),
    /// Nullable variant reference.
    Variant(Option<RawVariant>),
    /// Nullable boxed value.
    Boxed(Option<Box<dyn BoxedValue>>),
}

impl Clone for ValueData {
    fn clone(&self) -> Self {
        match self {
            ValueData::Empty => ValueData::Empty,
            ValueData::Bool(v) => ValueData::Bool(*v),
            ValueData::I32(v) => ValueData::I32(*v),
            ValueData::U32(v) => ValueData::U32(*v),
            ValueData::I64(v) => ValueData::I64(*v),
            ValueData::U64(v) => ValueData::U64(*v),
            ValueData::F32(v) => ValueData::F32(*v),
            ValueData::F64(v) => ValueData::F64(*v),
            ValueData::Str(v) => ValueData::Str(v.clone()),
            ValueData::Object(v) => ValueData::Object(v.clone()),
            ValueData::Variant(v) => ValueData::Variant(v.clone()),
            ValueData::Boxed(v) => ValueData::Boxed(v.as_ref().map(|b| (**b).clone_boxed())),
        }
    }
}

/// A typed native value.
#[derive(Clone)]
pub struct Value {
    type_: Type,
    data: ValueData,
}

macro_rules! fundamental_accessors {
    ($($ctor:ident, $getter:ident, $ty:ty, $type_const:ident, $variant:ident;)*) => {
        $(
            #[doc = concat!("Creates a `", stringify!($ty), "` value.")]
            #[must_use]
            pub fn $ctor(v: $ty) -> Value {
                Value {
                    type_: Type::$type_const,
                    data: ValueData::$variant(v),
                }
            }

            #[doc = concat!("Reads a `", stringify!($ty), "` value.")]
            #[must_use]
            pub fn $getter(&self) -> Option<$ty> {
                match self.data {
                    ValueData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        )*
    };
}

impl Value {
    /// Creates the default value of `type_`.
    ///
    /// Numbers are zero, strings, objects, variants and boxes are null.
    #[must_use]
    pub fn new(type_: Type) -> Value {
        let data = match type_ {
            Type::BOOL => ValueData::Bool(false),
            Type::I32 => ValueData::I32(0),
            Type::U32 => ValueData::U32(0),
            Type::I64 => ValueData::I64(0),
            Type::U64 => ValueData::U64(0),
            Type::F32 => ValueData::F32(0.0),
            Type::F64 => ValueData::F64(0.0),
            Type::STRING => ValueData::Str(None),
            Type::VARIANT => ValueData::Variant(None),
            _ => match type_.kind() {
                TypeKind::Object | TypeKind::Interface => ValueData::Object(None),
                TypeKind::Boxed => ValueData::Boxed(None),
                TypeKind::Fundamental | TypeKind::Invalid => ValueData::Empty,
            },
        };
        Value { type_, data }
    }

    /// The `void` value.
    #[must_use]
    pub fn none() -> Value {
        Value {
            type_: Type::NONE,
            data: ValueData::Empty,
        }
    }

    fundamental_accessors! {
        from_bool, get_bool, bool, BOOL, Bool;
        from_i32, get_i32, i32, I32, I32;
        from_u32, get_u32, u32, U32, U32;
        from_i64, get_i64, i64, I64, I64;
        from_u64, get_u64, u64, U64, U64;
        from_f32, get_f32, f32, F32, F32;
        from_f64, get_f64, f64, F64, F64;
    }

    /// Creates a non-null string value.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Value {
        Value {
            type_: Type::STRING,
            data: ValueData::Str(Some(s.into())),
        }
    }

    /// Creates a nullable string value.
    #[must_use]
    pub fn from_opt_string(s: Option<String>) -> Value {
        Value {
            type_: Type::STRING,
            data: ValueData::Str(s),
        }
    }

    /// Reads a string value. `None` for null strings and other types.
    #[must_use]
    pub fn get_string(&self) -> Option<&str> {
        match &self.data {
            ValueData::Str(s) => s.as_deref(),
            _ => None,
        }
    }

    /// Creates an object value of declared type `type_`.
    #[must_use]
    pub fn from_object(type_: Type, instance: Option<Instance>) -> Value {
        Value {
            type_,
            data: ValueData::Object(instance),
        }
    }

    /// Reads an object value.
    #[must_use]
    pub fn get_object(&self) -> Option<&Instance> {
        match &self.data {
            ValueData::Object(obj) => obj.as_ref(),
            _ => None,
        }
    }

    /// Creates a variant value.
    #[must_use]
    pub fn from_variant(variant: Option<RawVariant>) -> Value {
        Value {
            type_: Type::VARIANT,
            data: ValueData::Variant(variant),
        }
    }

    /// Reads a variant value.
    #[must_use]
    pub fn get_variant(&self) -> Option<&RawVariant> {
        match &self.data {
            ValueData::Variant(v) => v.as_ref(),
            _ => None,
        }
    }

    /// Creates a boxed value of boxed type `type_`.
    #[must_use]
    pub fn from_boxed(type_: Type, boxed: Box<dyn BoxedValue>) -> Value {
        Value {
            type_,
            data: ValueData::Boxed(Some(boxed)),
        }
    }

    /// Reads a boxed value as `T`.
    #[must_use]
    pub fn get_boxed<T: Any>(&self) -> Option<&T> {
        match &self.data {
            ValueData::Boxed(Some(b)) => (**b).as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Creates an error value.
    #[must_use]
    pub fn from_error(error: DomainError) -> Value {
        Value::from_boxed(Type::ERROR, Box::new(error))
    }

    /// Reads an error value.
    #[must_use]
    pub fn get_error(&self) -> Option<&DomainError> {
        if self.type_ == Type::ERROR {
            self.get_boxed::<DomainError>()
        } else {
            None
        }
    }

    /// Returns the value's type.
    #[must_use]
    pub fn type_(&self) -> Type {
        self.type_
    }

    /// Returns the raw storage.
    #[must_use]
    pub fn data(&self) -> &ValueData {
        &self.data
    }

    /// Returns true if the value's type is `type_` or derives from it.
    #[must_use]
    pub fn holds(&self, type_: Type) -> bool {
        self.type_.is_a(type_)
    }

    /// Returns true for null strings, objects, variants and boxes.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(
            self.data,
            ValueData::Str(None)
                | ValueData::Object(None)
                | ValueData::Variant(None)
                | ValueData::Boxed(None)
                | ValueData::Empty
        )
    }

    /// Converts into a value of type `dest`.
    ///
    /// Supported conversions:
    /// - any value into its own type or an ancestor
    /// - objects into any type their instance `is_a`, and null objects into
    ///   any object type
    /// - between all numeric types and `bool` (zero is false)
    /// - numbers and booleans into strings
    ///
    /// Returns `None` when no conversion exists.
    #[must_use]
    pub fn transform(&self, dest: Type) -> Option<Value> {
        if self.type_.is_a(dest) {
            return Some(Value {
                type_: dest,
                data: self.data.clone(),
            });
        }

        if let ValueData::Object(obj) = &self.data {
            let ok = match obj {
                Some(instance) => instance.type_().is_a(dest),
                None => matches!(dest.kind(), TypeKind::Object | TypeKind::Interface),
            };
            return ok.then(|| Value::from_object(dest, obj.clone()));
        }

        if dest == Type::STRING {
            let text = match self.data {
                ValueData::Bool(v) => v.to_string(),
                ValueData::I32(v) => v.to_string(),
                ValueData::U32(v) => v.to_string(),
                ValueData::I64(v) => v.to_string(),
                ValueData::U64(v) => v.to_string(),
                ValueData::F32(v) => v.to_string(),
                ValueData::F64(v) => v.to_string(),
                _ => return None,
            };
            return Some(Value::from_string(text));
        }

        let data = if let Some(n) = self.as_integral() {
            // Integer to integer truncates to the destination width.
            match dest {
                Type::BOOL => ValueData::Bool(n != 0),
                Type::I32 => ValueData::I32(n as i32),
                Type::U32 => ValueData::U32(n as u32),
                Type::I64 => ValueData::I64(n as i64),
                Type::U64 => ValueData::U64(n as u64),
                Type::F32 => ValueData::F32(n as f32),
                Type::F64 => ValueData::F64(n as f64),
                _ => return None,
            }
        } else {
            let n = self.as_f64()?;
            match dest {
                Type::BOOL => ValueData::Bool(n != 0.0),
                Type::I32 => ValueData::I32(n as i32),
                Type::U32 => ValueData::U32(n as u32),
                Type::I64 => ValueData::I64(n as i64),
                Type::U64 => ValueData::U64(n as u64),
                Type::F32 => ValueData::F32(n as f32),
                Type::F64 => ValueData::F64(n),
                _ => return None,
            }
        };
        Some(Value { type_: dest, data })
    }

    fn as_integral(&self) -> Option<i128> {
        Some(match self.data {
            ValueData::Bool(v) => i128::from(v),
            ValueData::I32(v) => i128::from(v),
            ValueData::U32(v) => i128::from(v),
            ValueData::I64(v) => i128::from(v),
            ValueData::U64(v) => i128::from(v),
            _ => return None,
        })
    }

    fn as_f64(&self) -> Option<f64> {
        Some(match self.data {
            ValueData::F32(v) => f64::from(v),
            ValueData::F64(v) => v,
            _ => return None,
        })
    }
}

impl PartialEq for Value {
    /// Fundamentals and strings compare by content, objects and variants by
    /// identity, boxed values never compare equal unless both are null.
    fn eq(&self, other: &Self) -> bool {
        if self.type_ != other.type_ {
            return false;
        }
        match (&self.data, &other.data) {
            (ValueData::Empty, ValueData::Empty) => true,
            (ValueData::Bool(a), ValueData::Bool(b)) => a == b,
            (ValueData::I32(a), ValueData::I32(b)) => a == b,
            (ValueData::U32(a), ValueData::U32(b)) => a == b,
            (ValueData::I64(a), ValueData::I64(b)) => a == b,
            (ValueData::U64(a), ValueData::U64(b)) => a == b,
            (ValueData::F32(a), ValueData::F32(b)) => a.to_bits() == b.to_bits(),
            (ValueData::F64(a), ValueData::F64(b)) => a.to_bits() == b.to_bits(),
            (ValueData::Str(a), ValueData::Str(b)) => a == b,
            (ValueData::Object(a), ValueData::Object(b)) => match (a, b) {
                (Some(a), Some(b)) => a.as_ptr() == b.as_ptr(),
                (None, None) => true,
                _ => false,
            },
            (ValueData::Variant(a), ValueData::Variant(b)) => a == b,
            (ValueData::Boxed(None), ValueData::Boxed(None)) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value<{}>(", self.type_)?;
        match &self.data {
            ValueData::Empty => f.write_str("empty")?,
            ValueData::Bool(v) => write!(f, "{v}")?,
            ValueData::I32(v) => write!(f, "{v}")?,
            ValueData::U32(v) => write!(f, "{v}")?,
            ValueData::I64(v) => write!(f, "{v}")?,
            ValueData::U64(v) => write!(f, "{v}")?,
            ValueData::F32(v) => write!(f, "{v}")?,
            ValueData::F64(v) => write!(f, "{v}")?,
            ValueData::Str(v) => write!(f, "{v:?}")?,
            ValueData::Object(Some(obj)) => write!(f, "{:p}", obj.as_ptr())?,
            ValueData::Variant(Some(v)) => write!(f, "{v}")?,
            ValueData::Boxed(Some(_)) => f.write_str("boxed")?,
            ValueData::Object(None) | ValueData::Variant(None) | ValueData::Boxed(None) => {
                f.write_str("NULL")?;
            }
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(Value::new(Type::I32).get_i32(), Some(0));
        assert_eq!(Value::new(Type::BOOL).get_bool(), Some(false));
        assert!(Value::new(Type::STRING).is_null());
        assert!(Value::new(Type::OBJECT).is_null());
        assert_eq!(Value::new(Type::F64).type_(), Type::F64);
    }

    #[test]
    fn test_getters_check_storage() {
        let v = Value::from_i32(-7);
        assert_eq!(v.get_i32(), Some(-7));
        assert_eq!(v.get_u32(), None);
        assert_eq!(v.get_string(), None);
    }

    #[test]
    fn test_numeric_transforms() {
        let v = Value::from_i32(42);
        assert_eq!(v.transform(Type::U64).unwrap().get_u64(), Some(42));
        assert_eq!(v.transform(Type::F64).unwrap().get_f64(), Some(42.0));
        assert_eq!(v.transform(Type::BOOL).unwrap().get_bool(), Some(true));
        assert_eq!(Value::from_bool(true).transform(Type::I32).unwrap().get_i32(), Some(1));
        assert_eq!(
            Value::from_u64(u64::MAX).transform(Type::U64).unwrap().get_u64(),
            Some(u64::MAX)
        );
    }

    #[test]
    fn test_integer_transforms_truncate() {
        let big = Value::from_i64(0x1_0000_0005);
        assert_eq!(big.transform(Type::I32).unwrap().get_i32(), Some(5));
        assert_eq!(Value::from_i32(-1).transform(Type::U32).unwrap().get_u32(), Some(u32::MAX));
        assert_eq!(Value::from_u64(u64::MAX).transform(Type::I64).unwrap().get_i64(), Some(-1));

        let precise = (1u64 << 53) + 1;
        assert_eq!(
            Value::from_u64(precise).transform(Type::I64).unwrap().get_i64(),
            Some(precise as i64)
        );
        assert_eq!(Value::from_f64(-2.75).transform(Type::I32).unwrap().get_i32(), Some(-2));
    }

    #[test]
    fn test_boxed_round_trip_reads_payload() {
        let v = Value::from_boxed(Type::BOXED, Box::new(vec![3u8, 1, 4]));
        assert_eq!(v.get_boxed::<Vec<u8>>(), Some(&vec![3u8, 1, 4]));
        assert!(v.get_boxed::<Box<dyn BoxedValue>>().is_none());

        let copy = v.clone();
        assert_eq!(copy.get_boxed::<Vec<u8>>().map(Vec::len), Some(3));
    }

    #[test]
    fn test_string_transforms() {
        assert_eq!(
            Value::from_i32(5).transform(Type::STRING).unwrap().get_string(),
            Some("5")
        );
        assert!(Value::from_string("5").transform(Type::I32).is_none());
    }

    #[test]
    fn test_boxed_deep_copy() {
        #[derive(Clone, Debug, PartialEq)]
        struct Point(i32, i32);

        let v = Value::from_boxed(Type::BOXED, Box::new(Point(1, 2)));
        let copy = v.clone();

        let a: *const Point = v.get_boxed::<Point>().unwrap();
        let b: *const Point = copy.get_boxed::<Point>().unwrap();
        assert_ne!(a, b);
        assert_eq!(copy.get_boxed::<Point>(), Some(&Point(1, 2)));
        assert_eq!(copy.get_boxed::<String>(), None);
    }

    #[test]
    fn test_error_value() {
        let err = DomainError::new(gobind_mem::Quark::from_str("value-test-domain"), 4, "oops");
        let v = Value::from_error(err.clone());
        assert_eq!(v.type_(), Type::ERROR);
        assert_eq!(v.get_error(), Some(&err));
        assert!(v.holds(Type::BOXED));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::from_f64(f64::NAN), Value::from_f64(f64::NAN));
        assert_ne!(Value::from_f64(0.0), Value::from_f64(-0.0));
    }
}

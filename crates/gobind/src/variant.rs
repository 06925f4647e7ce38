//! Typed variants.
//!
//! [`VariantBase`] is an untyped handle on an immutable [`RawVariant`] tree;
//! [`Variant<T>`] is the same handle with its signature proven to be `T`'s.
//! The only ways to get a `Variant<T>` are [`Variant::create`] and the
//! checked [`VariantBase::cast_dynamic`], so [`Variant::get`] never meets a
//! value of the wrong shape.
//!
//! Cloning either type bumps a reference count; the tree is never copied.
//!
//! # Example
//!
//! ```rust
//! use gobind::{Variant, VariantBase};
//! use std::collections::BTreeMap;
//!
//! let mut map = BTreeMap::new();
//! map.insert("width".to_owned(), 640u32);
//! map.insert("height".to_owned(), 480u32);
//!
//! let typed = Variant::create(&map);
//! assert_eq!(typed.type_string(), "a{su}");
//! assert_eq!(typed.lookup(&"width".to_owned()), Some(640));
//!
//! let untyped: VariantBase = typed.into_base();
//! assert!(untyped.cast_dynamic::<Vec<String>>().is_err());
//! assert_eq!(untyped.cast_dynamic::<BTreeMap<String, u32>>().unwrap().get(), map);
//! ```

use crate::error::{Error, Result, invariant_violation};
use crate::runtime::variant::{is_object_path, is_signature};
use crate::runtime::{RawVariant, VariantData, VariantType};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Deref;

/// A Rust type with a fixed variant signature.
pub trait VariantKind: Sized {
    /// The signature values of `Self` are created with.
    fn variant_type() -> VariantType;

    /// Returns true if a variant of type `ty` can be read as `Self`.
    fn accepts(ty: &VariantType) -> bool {
        *ty == Self::variant_type()
    }

    /// Builds a variant.
    fn to_raw(&self) -> RawVariant;

    /// Reads a variant, `None` if it has another shape.
    fn from_raw(raw: &RawVariant) -> Option<Self>;
}

/// Kinds usable as dictionary keys.
pub trait BasicVariantKind: VariantKind {}

/// An untyped variant handle.
#[derive(Clone, PartialEq)]
pub struct VariantBase {
    raw: RawVariant,
}

impl VariantBase {
    /// Wraps a raw variant.
    #[must_use]
    pub fn from_raw(raw: RawVariant) -> Self {
        VariantBase { raw }
    }

    /// The raw variant.
    #[must_use]
    pub fn raw(&self) -> &RawVariant {
        &self.raw
    }

    /// Gives back the raw variant.
    #[must_use]
    pub fn into_raw(self) -> RawVariant {
        self.raw
    }

    /// The variant's type.
    #[must_use]
    pub fn variant_type(&self) -> &VariantType {
        self.raw.type_()
    }

    /// The type as a signature string such as `"a{sv}"`.
    #[must_use]
    pub fn type_string(&self) -> String {
        self.raw.type_string()
    }

    /// Returns true if the variant can be read as `T`.
    #[must_use]
    pub fn is_of_type<T: VariantKind>(&self) -> bool {
        T::accepts(self.raw.type_())
    }

    /// Number of children; zero for basic values.
    #[must_use]
    pub fn n_children(&self) -> usize {
        self.raw.n_children()
    }

    /// Returns child `index`, sharing it.
    ///
    /// # Errors
    ///
    /// [`Error::IndexOutOfRange`] if `index >= n_children()`.
    pub fn get_child(&self, index: usize) -> Result<VariantBase> {
        self.raw
            .child(index)
            .map(VariantBase::from_raw)
            .ok_or(Error::IndexOutOfRange {
                index,
                len: self.raw.n_children(),
            })
    }

    /// Looks up `key` in an `a{KV}` dictionary; the first matching entry
    /// wins.
    ///
    /// # Errors
    ///
    /// [`Error::VariantTypeMismatch`] if the entry's value is not a `V`.
    pub fn lookup<K: BasicVariantKind, V: VariantKind>(&self, key: &K) -> Result<Option<V>> {
        let Some(value) = self.raw.lookup_value(&key.to_raw()) else {
            return Ok(None);
        };
        V::from_raw(&value)
            .map(Some)
            .ok_or_else(|| Error::VariantTypeMismatch {
                expected: V::variant_type().to_string(),
                found: value.type_string(),
            })
    }

    /// Checked conversion to a typed variant.
    ///
    /// `String` accepts `s`, `o` and `g`; `ObjectPath` and `Signature` only
    /// their own signature, so a successful cast always decodes.
    ///
    /// # Errors
    ///
    /// [`Error::VariantTypeMismatch`] if the signature does not match.
    pub fn cast_dynamic<T: VariantKind>(&self) -> Result<Variant<T>> {
        if !T::accepts(self.raw.type_()) {
            return Err(Error::VariantTypeMismatch {
                expected: T::variant_type().to_string(),
                found: self.raw.type_string(),
            });
        }
        Ok(Variant {
            base: self.clone(),
            _marker: PhantomData,
        })
    }

    /// Text form; with `type_annotate`, ambiguous values carry a type
    /// prefix.
    #[must_use]
    pub fn print(&self, type_annotate: bool) -> String {
        self.raw.print(type_annotate)
    }
}

impl From<RawVariant> for VariantBase {
    fn from(raw: RawVariant) -> Self {
        VariantBase::from_raw(raw)
    }
}

impl fmt::Display for VariantBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.raw, f)
    }
}

impl fmt::Debug for VariantBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VariantBase({})", self.raw.print(true))
    }
}

/// A variant whose signature is known to be `T`'s.
pub struct Variant<T> {
    base: VariantBase,
    _marker: PhantomData<fn() -> T>,
}

impl<T: VariantKind> Variant<T> {
    /// Builds a variant from a Rust value.
    #[must_use]
    pub fn create(value: &T) -> Self {
        Variant {
            base: VariantBase::from_raw(value.to_raw()),
            _marker: PhantomData,
        }
    }

    /// Decodes the value.
    ///
    /// # Panics
    ///
    /// Panics (binding invariant) if the tree does not decode as `T`,
    /// which the checked constructors rule out.
    #[must_use]
    pub fn get(&self) -> T {
        match T::from_raw(&self.base.raw) {
            Some(value) => value,
            None => invariant_violation(format_args!(
                "variant of type '{}' does not decode as '{}'",
                self.base.type_string(),
                T::variant_type()
            )),
        }
    }

    /// Drops the type.
    #[must_use]
    pub fn into_base(self) -> VariantBase {
        self.base
    }
}

impl<K: BasicVariantKind + Ord, V: VariantKind> Variant<BTreeMap<K, V>> {
    /// Looks up one value without decoding the whole dictionary.
    #[must_use]
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.base.lookup(key).ok().flatten()
    }
}

impl<K: BasicVariantKind + Eq + Hash, V: VariantKind> Variant<HashMap<K, V>> {
    /// Looks up one value without decoding the whole dictionary.
    #[must_use]
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.base.lookup(key).ok().flatten()
    }
}

impl<T> Deref for Variant<T> {
    type Target = VariantBase;

    fn deref(&self) -> &VariantBase {
        &self.base
    }
}

impl<T> Clone for Variant<T> {
    fn clone(&self) -> Self {
        Variant {
            base: self.base.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Variant<T> {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
    }
}

impl<T> From<Variant<T>> for VariantBase {
    fn from(variant: Variant<T>) -> Self {
        variant.base
    }
}

impl<T> fmt::Display for Variant<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.base, f)
    }
}

impl<T> fmt::Debug for Variant<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Variant({})", self.base.raw.print(true))
    }
}

/// Containers are built from children whose types are fixed by `T`, so the
/// raw constructors cannot fail here.
fn built(result: Result<RawVariant>) -> RawVariant {
    match result {
        Ok(raw) => raw,
        Err(e) => invariant_violation(format_args!("variant construction failed: {e}")),
    }
}

macro_rules! basic_variant_kind {
    ($($ty:ty => $vt:ident, $ctor:ident, $getter:ident;)*) => {
        $(
            impl VariantKind for $ty {
                fn variant_type() -> VariantType {
                    VariantType::$vt
                }

                fn to_raw(&self) -> RawVariant {
                    RawVariant::$ctor(*self)
                }

                fn from_raw(raw: &RawVariant) -> Option<Self> {
                    raw.$getter()
                }
            }

            impl BasicVariantKind for $ty {}
        )*
    };
}

basic_variant_kind! {
    bool => Bool, new_bool, get_bool;
    u8 => Byte, new_byte, get_byte;
    i16 => Int16, new_int16, get_int16;
    u16 => Uint16, new_uint16, get_uint16;
    i32 => Int32, new_int32, get_int32;
    u32 => Uint32, new_uint32, get_uint32;
    i64 => Int64, new_int64, get_int64;
    u64 => Uint64, new_uint64, get_uint64;
    f64 => Double, new_double, get_double;
}

fn is_string_type(ty: &VariantType) -> bool {
    matches!(
        ty,
        VariantType::String | VariantType::ObjectPath | VariantType::Signature
    )
}

impl VariantKind for String {
    fn variant_type() -> VariantType {
        VariantType::String
    }

    fn accepts(ty: &VariantType) -> bool {
        is_string_type(ty)
    }

    fn to_raw(&self) -> RawVariant {
        RawVariant::new_string(self)
    }

    fn from_raw(raw: &RawVariant) -> Option<Self> {
        raw.get_str().map(str::to_owned)
    }
}

impl BasicVariantKind for String {}

/// A validated D-Bus object path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validates `path`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidVariantString`] if `path` is not an object path.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !is_object_path(&path) {
            return Err(Error::InvalidVariantString { kind: 'o', value: path });
        }
        Ok(ObjectPath(path))
    }

    /// The path.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl VariantKind for ObjectPath {
    fn variant_type() -> VariantType {
        VariantType::ObjectPath
    }

    fn to_raw(&self) -> RawVariant {
        built(RawVariant::new_object_path(&self.0))
    }

    fn from_raw(raw: &RawVariant) -> Option<Self> {
        raw.get_str().and_then(|s| ObjectPath::new(s).ok())
    }
}

impl BasicVariantKind for ObjectPath {}

/// A validated variant signature.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(String);

impl Signature {
    /// Validates `signature`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidVariantString`] if it is not a sequence of complete
    /// types.
    pub fn new(signature: impl Into<String>) -> Result<Self> {
        let signature = signature.into();
        if !is_signature(&signature) {
            return Err(Error::InvalidVariantString {
                kind: 'g',
                value: signature,
            });
        }
        Ok(Signature(signature))
    }

    /// The signature text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl VariantKind for Signature {
    fn variant_type() -> VariantType {
        VariantType::Signature
    }

    fn to_raw(&self) -> RawVariant {
        built(RawVariant::new_signature(&self.0))
    }

    fn from_raw(raw: &RawVariant) -> Option<Self> {
        raw.get_str().and_then(|s| Signature::new(s).ok())
    }
}

impl BasicVariantKind for Signature {}

impl VariantKind for VariantBase {
    fn variant_type() -> VariantType {
        VariantType::Variant
    }

    fn to_raw(&self) -> RawVariant {
        RawVariant::new_variant(self.raw.clone())
    }

    fn from_raw(raw: &RawVariant) -> Option<Self> {
        match raw.data() {
            VariantData::Variant(child) => Some(VariantBase::from_raw(child.clone())),
            _ => None,
        }
    }
}

impl<T: VariantKind> VariantKind for Option<T> {
    fn variant_type() -> VariantType {
        VariantType::Maybe(Box::new(T::variant_type()))
    }

    fn accepts(ty: &VariantType) -> bool {
        matches!(ty, VariantType::Maybe(elem) if T::accepts(elem))
    }

    fn to_raw(&self) -> RawVariant {
        built(RawVariant::new_maybe(
            T::variant_type(),
            self.as_ref().map(T::to_raw),
        ))
    }

    fn from_raw(raw: &RawVariant) -> Option<Self> {
        match raw.data() {
            VariantData::Maybe(None) => Some(None),
            VariantData::Maybe(Some(child)) => T::from_raw(child).map(Some),
            _ => None,
        }
    }
}

impl<T: VariantKind> VariantKind for Vec<T> {
    fn variant_type() -> VariantType {
        VariantType::Array(Box::new(T::variant_type()))
    }

    fn accepts(ty: &VariantType) -> bool {
        matches!(ty, VariantType::Array(elem) if T::accepts(elem))
    }

    fn to_raw(&self) -> RawVariant {
        built(RawVariant::new_array(
            T::variant_type(),
            self.iter().map(T::to_raw).collect(),
        ))
    }

    fn from_raw(raw: &RawVariant) -> Option<Self> {
        match raw.data() {
            VariantData::Array(items) => items.iter().map(T::from_raw).collect(),
            _ => None,
        }
    }
}

/// One `{KV}` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DictEntry<K, V> {
    /// The key.
    pub key: K,
    /// The value.
    pub value: V,
}

impl<K: BasicVariantKind, V: VariantKind> VariantKind for DictEntry<K, V> {
    fn variant_type() -> VariantType {
        VariantType::DictEntry(Box::new(K::variant_type()), Box::new(V::variant_type()))
    }

    fn accepts(ty: &VariantType) -> bool {
        matches!(ty, VariantType::DictEntry(k, v) if K::accepts(k) && V::accepts(v))
    }

    fn to_raw(&self) -> RawVariant {
        built(RawVariant::new_dict_entry(self.key.to_raw(), self.value.to_raw()))
    }

    fn from_raw(raw: &RawVariant) -> Option<Self> {
        match raw.data() {
            VariantData::DictEntry(k, v) => Some(DictEntry {
                key: K::from_raw(k)?,
                value: V::from_raw(v)?,
            }),
            _ => None,
        }
    }
}

fn dict_entries<'a, K, V>(pairs: impl Iterator<Item = (&'a K, &'a V)>) -> RawVariant
where
    K: BasicVariantKind + 'a,
    V: VariantKind + 'a,
{
    let entries = pairs
        .map(|(k, v)| built(RawVariant::new_dict_entry(k.to_raw(), v.to_raw())))
        .collect();
    built(RawVariant::new_array(DictEntry::<K, V>::variant_type(), entries))
}

/// Decodes `a{KV}` entries, keeping the first of duplicate keys.
fn read_dict<K, V>(raw: &RawVariant, mut insert: impl FnMut(K, V)) -> Option<()>
where
    K: BasicVariantKind,
    V: VariantKind,
{
    let VariantData::Array(entries) = raw.data() else {
        return None;
    };
    for entry in entries {
        let DictEntry { key, value } = DictEntry::<K, V>::from_raw(entry)?;
        insert(key, value);
    }
    Some(())
}

impl<K: BasicVariantKind + Ord, V: VariantKind> VariantKind for BTreeMap<K, V> {
    fn variant_type() -> VariantType {
        VariantType::Array(Box::new(DictEntry::<K, V>::variant_type()))
    }

    fn accepts(ty: &VariantType) -> bool {
        matches!(ty, VariantType::Array(elem) if DictEntry::<K, V>::accepts(elem))
    }

    fn to_raw(&self) -> RawVariant {
        dict_entries(self.iter())
    }

    fn from_raw(raw: &RawVariant) -> Option<Self> {
        let mut map = BTreeMap::new();
        read_dict(raw, |k, v| {
            map.entry(k).or_insert(v);
        })?;
        Some(map)
    }
}

impl<K: BasicVariantKind + Eq + Hash, V: VariantKind> VariantKind for HashMap<K, V> {
    fn variant_type() -> VariantType {
        VariantType::Array(Box::new(DictEntry::<K, V>::variant_type()))
    }

    fn accepts(ty: &VariantType) -> bool {
        matches!(ty, VariantType::Array(elem) if DictEntry::<K, V>::accepts(elem))
    }

    fn to_raw(&self) -> RawVariant {
        dict_entries(self.iter())
    }

    fn from_raw(raw: &RawVariant) -> Option<Self> {
        let mut map = HashMap::new();
        read_dict(raw, |k, v| {
            map.entry(k).or_insert(v);
        })?;
        Some(map)
    }
}

macro_rules! tuple_variant_kind {
    ($len:expr; $($name:ident : $index:tt),+) => {
        impl<$($name: VariantKind),+> VariantKind for ($($name,)+) {
            fn variant_type() -> VariantType {
                VariantType::Tuple(vec![$($name::variant_type()),+])
            }

            fn accepts(ty: &VariantType) -> bool {
                match ty {
                    VariantType::Tuple(items) if items.len() == $len => {
                        true $(&& $name::accepts(&items[$index]))+
                    }
                    _ => false,
                }
            }

            fn to_raw(&self) -> RawVariant {
                RawVariant::new_tuple(vec![$(self.$index.to_raw()),+])
            }

            fn from_raw(raw: &RawVariant) -> Option<Self> {
                match raw.data() {
                    VariantData::Tuple(items) if items.len() == $len => {
                        Some(($($name::from_raw(&items[$index])?,)+))
                    }
                    _ => None,
                }
            }
        }
    };
}

tuple_variant_kind!(2; A: 0, B: 1);
tuple_variant_kind!(3; A: 0, B: 1, C: 2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_kinds_accept_paths_and_signatures() {
        let path = VariantBase::from_raw(RawVariant::new_object_path("/org/example").unwrap());
        let as_string = path.cast_dynamic::<String>().unwrap();
        assert_eq!(as_string.get(), "/org/example");
        assert!(path.cast_dynamic::<Signature>().is_err());
        assert!(path.cast_dynamic::<i32>().is_err());
    }

    #[test]
    fn test_plain_string_never_casts_to_path_or_signature() {
        let text = Variant::create(&"not a path".to_owned()).into_base();
        assert_eq!(
            text.cast_dynamic::<ObjectPath>().unwrap_err(),
            Error::VariantTypeMismatch {
                expected: "o".to_owned(),
                found: "s".to_owned(),
            }
        );
        assert!(text.cast_dynamic::<Signature>().is_err());

        let valid = Variant::create(&"/org/example".to_owned()).into_base();
        assert!(valid.cast_dynamic::<ObjectPath>().is_err());
        assert!(!valid.is_of_type::<ObjectPath>());
    }

    #[test]
    fn test_cast_mismatch_names_both_types() {
        let v = Variant::create(&vec![1i32, 2, 3]).into_base();
        match v.cast_dynamic::<Vec<String>>() {
            Err(Error::VariantTypeMismatch { expected, found }) => {
                assert_eq!(expected, "as");
                assert_eq!(found, "ai");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_get_child_out_of_range() {
        let v = Variant::create(&(1u8, "x".to_owned()));
        assert_eq!(v.n_children(), 2);
        assert_eq!(v.get_child(1).unwrap().cast_dynamic::<String>().unwrap().get(), "x");
        assert_eq!(
            v.get_child(2).unwrap_err(),
            Error::IndexOutOfRange { index: 2, len: 2 }
        );
    }

    #[test]
    fn test_duplicate_keys_keep_first() {
        let entries = vec![
            DictEntry { key: "k".to_owned(), value: 1i32 },
            DictEntry { key: "k".to_owned(), value: 2i32 },
        ];
        let v = Variant::create(&entries).into_base();
        let map = v.cast_dynamic::<HashMap<String, i32>>().unwrap().get();
        assert_eq!(map.get("k"), Some(&1));
        assert_eq!(v.lookup::<String, i32>(&"k".to_owned()).unwrap(), Some(1));
    }

    #[test]
    fn test_invalid_object_path() {
        assert!(matches!(
            ObjectPath::new("no-slash"),
            Err(Error::InvalidVariantString { kind: 'o', .. })
        ));
    }

    #[test]
    fn test_nested_variant_and_maybe() {
        let inner = Variant::create(&7u64).into_base();
        let boxed = Variant::create(&Some(inner.clone()));
        assert_eq!(boxed.type_string(), "mv");
        assert_eq!(boxed.get(), Some(inner));
        assert_eq!(Variant::<Option<bool>>::create(&None).get(), None);
    }
}

//! Immutable, reference-counted, self-describing values.
//!
//! A [`RawVariant`] is a tree of typed nodes. Every node records its
//! [`VariantType`], and container constructors check that children match
//! the declared element type, so a variant can never hold a child whose
//! runtime type disagrees with its signature. Copies share the tree.
//!
//! # Type strings
//!
//! | signature | type |
//! |---|---|
//! | `b y n q i u x t d` | bool, byte, i16, u16, i32, u32, i64, u64, f64 |
//! | `s o g` | string, object path, signature |
//! | `v` | boxed variant |
//! | `mT` | maybe |
//! | `aT` | array |
//! | `(T...)` | tuple |
//! | `{KV}` | dictionary entry, `K` basic |
//!
//! # Example
//!
//! ```rust
//! use gobind::runtime::{RawVariant, VariantType};
//!
//! let items = vec![RawVariant::new_string("a"), RawVariant::new_string("b")];
//! let array = RawVariant::new_array(VariantType::String, items).unwrap();
//!
//! assert_eq!(array.type_string(), "as");
//! assert_eq!(array.n_children(), 2);
//! assert_eq!(array.to_string(), "['a', 'b']");
//! ```

use crate::error::{Error, Result};
use std::fmt::{self, Write as _};
use std::sync::Arc;

/// The type of a variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariantType {
    /// `b`
    Bool,
    /// `y`
    Byte,
    /// `n`
    Int16,
    /// `q`
    Uint16,
    /// `i`
    Int32,
    /// `u`
    Uint32,
    /// `x`
    Int64,
    /// `t`
    Uint64,
    /// `d`
    Double,
    /// `s`
    String,
    /// `o`
    ObjectPath,
    /// `g`
    Signature,
    /// `v`
    Variant,
    /// `mT`
    Maybe(Box<VariantType>),
    /// `aT`
    Array(Box<VariantType>),
    /// `(T...)`
    Tuple(Vec<VariantType>),
    /// `{KV}`
    DictEntry(Box<VariantType>, Box<VariantType>),
}

impl VariantType {
    /// Parses one complete type string.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidVariantType`] if `signature` is not exactly one
    /// valid type.
    pub fn parse(signature: &str) -> Result<VariantType> {
        let bytes = signature.as_bytes();
        let mut pos = 0;
        match parse_one(bytes, &mut pos) {
            Some(ty) if pos == bytes.len() => Ok(ty),
            _ => Err(Error::InvalidVariantType {
                signature: signature.to_owned(),
            }),
        }
    }

    /// Returns true for types usable as dictionary keys.
    #[must_use]
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            VariantType::Variant
                | VariantType::Maybe(_)
                | VariantType::Array(_)
                | VariantType::Tuple(_)
                | VariantType::DictEntry(..)
        )
    }

    /// Returns true for types whose values have children.
    #[must_use]
    pub fn is_container(&self) -> bool {
        !self.is_basic()
    }

    /// Element type of an array or maybe type.
    #[must_use]
    pub fn element(&self) -> Option<&VariantType> {
        match self {
            VariantType::Array(elem) | VariantType::Maybe(elem) => Some(elem),
            _ => None,
        }
    }

    /// Returns the `{KV}` entry type for dictionary arrays.
    #[must_use]
    pub fn dict_entry(&self) -> Option<(&VariantType, &VariantType)> {
        match self {
            VariantType::Array(elem) => match elem.as_ref() {
                VariantType::DictEntry(k, v) => Some((k, v)),
                _ => None,
            },
            _ => None,
        }
    }
}

fn parse_one(bytes: &[u8], pos: &mut usize) -> Option<VariantType> {
    let c = *bytes.get(*pos)?;
    *pos += 1;

    let ty = match c {
        b'b' => VariantType::Bool,
        b'y' => VariantType::Byte,
        b'n' => VariantType::Int16,
        b'q' => VariantType::Uint16,
        b'i' => VariantType::Int32,
        b'u' => VariantType::Uint32,
        b'x' => VariantType::Int64,
        b't' => VariantType::Uint64,
        b'd' => VariantType::Double,
        b's' => VariantType::String,
        b'o' => VariantType::ObjectPath,
        b'g' => VariantType::Signature,
        b'v' => VariantType::Variant,
        b'm' => VariantType::Maybe(Box::new(parse_one(bytes, pos)?)),
        b'a' => VariantType::Array(Box::new(parse_one(bytes, pos)?)),
        b'(' => {
            let mut items = Vec::new();
            while *bytes.get(*pos)? != b')' {
                items.push(parse_one(bytes, pos)?);
            }
            *pos += 1;
            VariantType::Tuple(items)
        }
        b'{' => {
            let key = parse_one(bytes, pos)?;
            if !key.is_basic() {
                return None;
            }
            let value = parse_one(bytes, pos)?;
            if *bytes.get(*pos)? != b'}' {
                return None;
            }
            *pos += 1;
            VariantType::DictEntry(Box::new(key), Box::new(value))
        }
        _ => return None,
    };
    Some(ty)
}

impl fmt::Display for VariantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantType::Bool => f.write_char('b'),
            VariantType::Byte => f.write_char('y'),
            VariantType::Int16 => f.write_char('n'),
            VariantType::Uint16 => f.write_char('q'),
            VariantType::Int32 => f.write_char('i'),
            VariantType::Uint32 => f.write_char('u'),
            VariantType::Int64 => f.write_char('x'),
            VariantType::Uint64 => f.write_char('t'),
            VariantType::Double => f.write_char('d'),
            VariantType::String => f.write_char('s'),
            VariantType::ObjectPath => f.write_char('o'),
            VariantType::Signature => f.write_char('g'),
            VariantType::Variant => f.write_char('v'),
            VariantType::Maybe(elem) => write!(f, "m{elem}"),
            VariantType::Array(elem) => write!(f, "a{elem}"),
            VariantType::Tuple(items) => {
                f.write_char('(')?;
                for item in items {
                    write!(f, "{item}")?;
                }
                f.write_char(')')
            }
            VariantType::DictEntry(k, v) => write!(f, "{{{k}{v}}}"),
        }
    }
}

/// Returns true if `path` is a valid D-Bus object path.
#[must_use]
pub fn is_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| {
        !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

/// Returns true if `signature` is a sequence of complete types.
#[must_use]
pub fn is_signature(signature: &str) -> bool {
    let bytes = signature.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        if parse_one(bytes, &mut pos).is_none() {
            return false;
        }
    }
    true
}

/// Payload of a variant node.
#[derive(Debug, Clone)]
pub enum VariantData {
    /// `b`
    Bool(bool),
    /// `y`
    Byte(u8),
    /// `n`
    Int16(i16),
    /// `q`
    Uint16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    Uint32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    Uint64(u64),
    /// `d`
    Double(f64),
    /// `s`, `o` and `g`
    String(String),
    /// `v`
    Variant(RawVariant),
    /// `mT`
    Maybe(Option<RawVariant>),
    /// `aT`
    Array(Vec<RawVariant>),
    /// `(T...)`
    Tuple(Vec<RawVariant>),
    /// `{KV}`
    DictEntry(RawVariant, RawVariant),
}

#[derive(Debug)]
struct VariantNode {
    ty: VariantType,
    data: VariantData,
}

/// A reference-counted immutable variant.
#[derive(Clone)]
pub struct RawVariant(Arc<VariantNode>);

impl RawVariant {
    fn from_parts(ty: VariantType, data: VariantData) -> RawVariant {
        RawVariant(Arc::new(VariantNode { ty, data }))
    }

    /// Creates a `b`.
    #[must_use]
    pub fn new_bool(v: bool) -> RawVariant {
        Self::from_parts(VariantType::Bool, VariantData::Bool(v))
    }

    /// Creates a `y`.
    #[must_use]
    pub fn new_byte(v: u8) -> RawVariant {
        Self::from_parts(VariantType::Byte, VariantData::Byte(v))
    }

    /// Creates an `n`.
    #[must_use]
    pub fn new_int16(v: i16) -> RawVariant {
        Self::from_parts(VariantType::Int16, VariantData::Int16(v))
    }

    /// Creates a `q`.
    #[must_use]
    pub fn new_uint16(v: u16) -> RawVariant {
        Self::from_parts(VariantType::Uint16, VariantData::Uint16(v))
    }

    /// Creates an `i`.
    #[must_use]
    pub fn new_int32(v: i32) -> RawVariant {
        Self::from_parts(VariantType::Int32, VariantData::Int32(v))
    }

    /// Creates a `u`.
    #[must_use]
    pub fn new_uint32(v: u32) -> RawVariant {
        Self::from_parts(VariantType::Uint32, VariantData::Uint32(v))
    }

    /// Creates an `x`.
    #[must_use]
    pub fn new_int64(v: i64) -> RawVariant {
        Self::from_parts(VariantType::Int64, VariantData::Int64(v))
    }

    /// Creates a `t`.
    #[must_use]
    pub fn new_uint64(v: u64) -> RawVariant {
        Self::from_parts(VariantType::Uint64, VariantData::Uint64(v))
    }

    /// Creates a `d`.
    #[must_use]
    pub fn new_double(v: f64) -> RawVariant {
        Self::from_parts(VariantType::Double, VariantData::Double(v))
    }

    /// Creates an `s`.
    #[must_use]
    pub fn new_string(v: &str) -> RawVariant {
        Self::from_parts(VariantType::String, VariantData::String(v.to_owned()))
    }

    /// Creates an `o`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidVariantString`] if `path` is not a valid object path.
    pub fn new_object_path(path: &str) -> Result<RawVariant> {
        if !is_object_path(path) {
            return Err(Error::InvalidVariantString {
                kind: 'o',
                value: path.to_owned(),
            });
        }
        Ok(Self::from_parts(
            VariantType::ObjectPath,
            VariantData::String(path.to_owned()),
        ))
    }

    /// Creates a `g`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidVariantString`] if `signature` is not valid.
    pub fn new_signature(signature: &str) -> Result<RawVariant> {
        if !is_signature(signature) {
            return Err(Error::InvalidVariantString {
                kind: 'g',
                value: signature.to_owned(),
            });
        }
        Ok(Self::from_parts(
            VariantType::Signature,
            VariantData::String(signature.to_owned()),
        ))
    }

    /// Boxes a variant into a `v`.
    #[must_use]
    pub fn new_variant(child: RawVariant) -> RawVariant {
        Self::from_parts(VariantType::Variant, VariantData::Variant(child))
    }

    fn check_child(expected: &VariantType, child: &RawVariant) -> Result<()> {
        if child.type_() == expected {
            Ok(())
        } else {
            Err(Error::VariantTypeMismatch {
                expected: expected.to_string(),
                found: child.type_string(),
            })
        }
    }

    /// Creates an `mT`.
    ///
    /// # Errors
    ///
    /// [`Error::VariantTypeMismatch`] if `child` is not of `child_type`.
    pub fn new_maybe(child_type: VariantType, child: Option<RawVariant>) -> Result<RawVariant> {
        if let Some(child) = &child {
            Self::check_child(&child_type, child)?;
        }
        Ok(Self::from_parts(
            VariantType::Maybe(Box::new(child_type)),
            VariantData::Maybe(child),
        ))
    }

    /// Creates an `aT`.
    ///
    /// # Errors
    ///
    /// [`Error::VariantTypeMismatch`] if any child is not of `elem_type`.
    pub fn new_array(elem_type: VariantType, children: Vec<RawVariant>) -> Result<RawVariant> {
        for child in &children {
            Self::check_child(&elem_type, child)?;
        }
        Ok(Self::from_parts(
            VariantType::Array(Box::new(elem_type)),
            VariantData::Array(children),
        ))
    }

    /// Creates a tuple.
    #[must_use]
    pub fn new_tuple(children: Vec<RawVariant>) -> RawVariant {
        let ty = VariantType::Tuple(children.iter().map(|c| c.type_().clone()).collect());
        Self::from_parts(ty, VariantData::Tuple(children))
    }

    /// Creates a `{KV}`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidVariantType`] if the key is not of a basic type.
    pub fn new_dict_entry(key: RawVariant, value: RawVariant) -> Result<RawVariant> {
        if !key.type_().is_basic() {
            return Err(Error::InvalidVariantType {
                signature: format!("{{{}{}}}", key.type_(), value.type_()),
            });
        }
        let ty = VariantType::DictEntry(
            Box::new(key.type_().clone()),
            Box::new(value.type_().clone()),
        );
        Ok(Self::from_parts(ty, VariantData::DictEntry(key, value)))
    }

    /// Returns the type.
    #[must_use]
    pub fn type_(&self) -> &VariantType {
        &self.0.ty
    }

    /// Returns the type string.
    #[must_use]
    pub fn type_string(&self) -> String {
        self.0.ty.to_string()
    }

    /// Returns the payload.
    #[must_use]
    pub fn data(&self) -> &VariantData {
        &self.0.data
    }

    /// Number of children; zero for basic values.
    #[must_use]
    pub fn n_children(&self) -> usize {
        match &self.0.data {
            VariantData::Variant(_) => 1,
            VariantData::Maybe(child) => usize::from(child.is_some()),
            VariantData::Array(items) | VariantData::Tuple(items) => items.len(),
            VariantData::DictEntry(..) => 2,
            _ => 0,
        }
    }

    /// Returns child `index`, sharing it.
    #[must_use]
    pub fn child(&self, index: usize) -> Option<RawVariant> {
        match &self.0.data {
            VariantData::Variant(child) if index == 0 => Some(child.clone()),
            VariantData::Maybe(child) if index == 0 => child.clone(),
            VariantData::Array(items) | VariantData::Tuple(items) => items.get(index).cloned(),
            VariantData::DictEntry(k, _) if index == 0 => Some(k.clone()),
            VariantData::DictEntry(_, v) if index == 1 => Some(v.clone()),
            _ => None,
        }
    }

    /// Looks up `key` in an `a{KV}` dictionary. The first matching entry
    /// wins.
    #[must_use]
    pub fn lookup_value(&self, key: &RawVariant) -> Option<RawVariant> {
        let VariantData::Array(entries) = &self.0.data else {
            return None;
        };
        entries.iter().find_map(|entry| match entry.data() {
            VariantData::DictEntry(k, v) if k == key => Some(v.clone()),
            _ => None,
        })
    }

    /// Number of handles sharing this tree.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Returns true if both handles share the same tree.
    #[must_use]
    pub fn ptr_eq(&self, other: &RawVariant) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Reads a `b`.
    #[must_use]
    pub fn get_bool(&self) -> Option<bool> {
        match self.0.data {
            VariantData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Reads a `y`.
    #[must_use]
    pub fn get_byte(&self) -> Option<u8> {
        match self.0.data {
            VariantData::Byte(v) => Some(v),
            _ => None,
        }
    }

    /// Reads an `n`.
    #[must_use]
    pub fn get_int16(&self) -> Option<i16> {
        match self.0.data {
            VariantData::Int16(v) => Some(v),
            _ => None,
        }
    }

    /// Reads a `q`.
    #[must_use]
    pub fn get_uint16(&self) -> Option<u16> {
        match self.0.data {
            VariantData::Uint16(v) => Some(v),
            _ => None,
        }
    }

    /// Reads an `i`.
    #[must_use]
    pub fn get_int32(&self) -> Option<i32> {
        match self.0.data {
            VariantData::Int32(v) => Some(v),
            _ => None,
        }
    }

    /// Reads a `u`.
    #[must_use]
    pub fn get_uint32(&self) -> Option<u32> {
        match self.0.data {
            VariantData::Uint32(v) => Some(v),
            _ => None,
        }
    }

    /// Reads an `x`.
    #[must_use]
    pub fn get_int64(&self) -> Option<i64> {
        match self.0.data {
            VariantData::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// Reads a `t`.
    #[must_use]
    pub fn get_uint64(&self) -> Option<u64> {
        match self.0.data {
            VariantData::Uint64(v) => Some(v),
            _ => None,
        }
    }

    /// Reads a `d`.
    #[must_use]
    pub fn get_double(&self) -> Option<f64> {
        match self.0.data {
            VariantData::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Reads an `s`, `o` or `g`.
    #[must_use]
    pub fn get_str(&self) -> Option<&str> {
        match &self.0.data {
            VariantData::String(s) => Some(s),
            _ => None,
        }
    }

    /// Prints the variant in text form.
    ///
    /// With `type_annotate`, values whose type cannot be inferred from the
    /// text (`uint32 5`, `@as []`) carry a type prefix.
    #[must_use]
    pub fn print(&self, type_annotate: bool) -> String {
        let mut out = String::new();
        print_value(self, &mut out, type_annotate);
        out
    }
}

fn print_string(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
}

fn print_value(v: &RawVariant, out: &mut String, annotate: bool) {
    let prefix = |out: &mut String, name: &str| {
        if annotate {
            out.push_str(name);
            out.push(' ');
        }
    };

    // Writing into a String cannot fail.
    match v.data() {
        VariantData::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        VariantData::Byte(b) => {
            prefix(out, "byte");
            let _ = write!(out, "0x{b:02x}");
        }
        VariantData::Int16(n) => {
            prefix(out, "int16");
            let _ = write!(out, "{n}");
        }
        VariantData::Uint16(n) => {
            prefix(out, "uint16");
            let _ = write!(out, "{n}");
        }
        VariantData::Int32(n) => {
            let _ = write!(out, "{n}");
        }
        VariantData::Uint32(n) => {
            prefix(out, "uint32");
            let _ = write!(out, "{n}");
        }
        VariantData::Int64(n) => {
            prefix(out, "int64");
            let _ = write!(out, "{n}");
        }
        VariantData::Uint64(n) => {
            prefix(out, "uint64");
            let _ = write!(out, "{n}");
        }
        VariantData::Double(d) => {
            let _ = write!(out, "{d:?}");
        }
        VariantData::String(s) => {
            match v.type_() {
                VariantType::ObjectPath => prefix(out, "objectpath"),
                VariantType::Signature => prefix(out, "signature"),
                _ => {}
            }
            print_string(s, out);
        }
        VariantData::Variant(child) => {
            out.push('<');
            print_value(child, out, true);
            out.push('>');
        }
        VariantData::Maybe(None) => {
            if annotate {
                let _ = write!(out, "@{} ", v.type_());
            }
            out.push_str("nothing");
        }
        VariantData::Maybe(Some(child)) => {
            out.push_str("just ");
            print_value(child, out, annotate);
        }
        VariantData::Array(items) => {
            let is_dict = v.type_().dict_entry().is_some();
            if items.is_empty() {
                if annotate {
                    let _ = write!(out, "@{} ", v.type_());
                }
                out.push_str(if is_dict { "{}" } else { "[]" });
                return;
            }

            out.push(if is_dict { '{' } else { '[' });
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let first = annotate && i == 0;
                match (is_dict, item.data()) {
                    (true, VariantData::DictEntry(k, val)) => {
                        print_value(k, out, first);
                        out.push_str(": ");
                        print_value(val, out, first);
                    }
                    _ => print_value(item, out, first),
                }
            }
            out.push(if is_dict { '}' } else { ']' });
        }
        VariantData::Tuple(items) => {
            out.push('(');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_value(item, out, annotate);
            }
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        VariantData::DictEntry(k, val) => {
            out.push('{');
            print_value(k, out, annotate);
            out.push_str(", ");
            print_value(val, out, annotate);
            out.push('}');
        }
    }
}

impl PartialEq for RawVariant {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        if self.type_() != other.type_() {
            return false;
        }
        match (self.data(), other.data()) {
            (VariantData::Bool(a), VariantData::Bool(b)) => a == b,
            (VariantData::Byte(a), VariantData::Byte(b)) => a == b,
            (VariantData::Int16(a), VariantData::Int16(b)) => a == b,
            (VariantData::Uint16(a), VariantData::Uint16(b)) => a == b,
            (VariantData::Int32(a), VariantData::Int32(b)) => a == b,
            (VariantData::Uint32(a), VariantData::Uint32(b)) => a == b,
            (VariantData::Int64(a), VariantData::Int64(b)) => a == b,
            (VariantData::Uint64(a), VariantData::Uint64(b)) => a == b,
            (VariantData::Double(a), VariantData::Double(b)) => a.to_bits() == b.to_bits(),
            (VariantData::String(a), VariantData::String(b)) => a == b,
            (VariantData::Variant(a), VariantData::Variant(b)) => a == b,
            (VariantData::Maybe(a), VariantData::Maybe(b)) => a == b,
            (VariantData::Array(a), VariantData::Array(b))
            | (VariantData::Tuple(a), VariantData::Tuple(b)) => a == b,
            (VariantData::DictEntry(ak, av), VariantData::DictEntry(bk, bv)) => ak == bk && av == bv,
            _ => false,
        }
    }
}

impl fmt::Display for RawVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.print(true))
    }
}

impl fmt::Debug for RawVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawVariant({}, {})", self.type_(), self.print(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for sig in ["b", "as", "a{sv}", "(isa{sv})", "mmi", "()", "a(uo)", "{yv}"] {
            assert_eq!(VariantType::parse(sig).unwrap().to_string(), sig);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for sig in ["", "a", "(i", "{vs}", "{s}", "{sss}", "z", "ii", "a{sv"] {
            assert!(
                matches!(VariantType::parse(sig), Err(Error::InvalidVariantType { .. })),
                "{sig} should be rejected"
            );
        }
    }

    #[test]
    fn test_object_path_and_signature_validation() {
        assert!(is_object_path("/"));
        assert!(is_object_path("/org/gtk/Demo_1"));
        assert!(!is_object_path("org/gtk"));
        assert!(!is_object_path("/org/"));
        assert!(!is_object_path("/org//gtk"));
        assert!(!is_object_path("/org/gtk-demo"));

        assert!(is_signature(""));
        assert!(is_signature("sa{sv}i"));
        assert!(!is_signature("a"));

        assert!(RawVariant::new_object_path("/a/b").is_ok());
        assert!(matches!(
            RawVariant::new_object_path("a/b"),
            Err(Error::InvalidVariantString { kind: 'o', .. })
        ));
    }

    #[test]
    fn test_array_element_type_enforced() {
        let err = RawVariant::new_array(
            VariantType::String,
            vec![RawVariant::new_string("a"), RawVariant::new_int32(1)],
        );
        assert!(matches!(err, Err(Error::VariantTypeMismatch { .. })));
    }

    #[test]
    fn test_dict_lookup_first_match_wins() {
        let entry = |k: &str, v: i32| {
            RawVariant::new_dict_entry(RawVariant::new_string(k), RawVariant::new_int32(v)).unwrap()
        };
        let dict = RawVariant::new_array(
            VariantType::DictEntry(Box::new(VariantType::String), Box::new(VariantType::Int32)),
            vec![entry("a", 1), entry("b", 2), entry("a", 3)],
        )
        .unwrap();

        assert_eq!(dict.type_string(), "a{si}");
        let found = dict.lookup_value(&RawVariant::new_string("a")).unwrap();
        assert_eq!(found.get_int32(), Some(1));
        assert!(dict.lookup_value(&RawVariant::new_string("z")).is_none());
    }

    #[test]
    fn test_copies_share_tree() {
        let v = RawVariant::new_string("shared");
        assert_eq!(v.ref_count(), 1);
        let copy = v.clone();
        assert_eq!(v.ref_count(), 2);
        assert!(v.ptr_eq(&copy));
    }

    #[test]
    fn test_print() {
        assert_eq!(RawVariant::new_uint32(5).to_string(), "uint32 5");
        assert_eq!(RawVariant::new_int32(5).to_string(), "5");
        assert_eq!(RawVariant::new_string("it's").to_string(), r"'it\'s'");
        assert_eq!(
            RawVariant::new_variant(RawVariant::new_bool(true)).to_string(),
            "<true>"
        );
        assert_eq!(
            RawVariant::new_array(VariantType::String, vec![]).unwrap().to_string(),
            "@as []"
        );
        assert_eq!(
            RawVariant::new_tuple(vec![RawVariant::new_int32(1)]).to_string(),
            "(1,)"
        );
        assert_eq!(
            RawVariant::new_maybe(VariantType::Int32, None).unwrap().to_string(),
            "@mi nothing"
        );

        let entry = RawVariant::new_dict_entry(
            RawVariant::new_string("k"),
            RawVariant::new_variant(RawVariant::new_uint32(1)),
        )
        .unwrap();
        let dict = RawVariant::new_array(entry.type_().clone(), vec![entry]).unwrap();
        assert_eq!(dict.to_string(), "{'k': <uint32 1>}");

        let arr = RawVariant::new_array(
            VariantType::Uint32,
            vec![RawVariant::new_uint32(1), RawVariant::new_uint32(2)],
        )
        .unwrap();
        assert_eq!(arr.to_string(), "[uint32 1, 2]");
    }
}

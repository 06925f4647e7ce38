//! Property descriptors.

use crate::error::{Error, Result};
use crate::runtime::types::Type;
use crate::runtime::value::Value;
use bitflags::bitflags;
use gobind_mem::global_arena;
use std::fmt;

bitflags! {
    /// Access and behaviour flags of a property.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ParamFlags: u32 {
        /// Can be read.
        const READABLE = 1 << 0;
        /// Can be written.
        const WRITABLE = 1 << 1;
        /// Readable and writable.
        const READWRITE = Self::READABLE.bits() | Self::WRITABLE.bits();
        /// Set during construction.
        const CONSTRUCT = 1 << 2;
        /// Only settable during construction.
        const CONSTRUCT_ONLY = 1 << 3;
        /// `notify` is only emitted when the owner calls `notify` itself,
        /// not on every set.
        const EXPLICIT_NOTIFY = 1 << 30;
        /// Deprecated; setting it logs a warning when refcount debugging is
        /// enabled.
        const DEPRECATED = 1 << 31;
    }
}

/// Describes one property of a type.
///
/// Immutable once installed with [`Type::install_property`].
#[derive(Clone)]
pub struct ParamSpec {
    name: &'static str,
    nick: Option<&'static str>,
    blurb: Option<&'static str>,
    value_type: Type,
    default: Value,
    flags: ParamFlags,
    owner: Type,
    overridden: Option<Type>,
}

/// Canonical property and signal names: a letter, then letters, digits and
/// `-`. `_` is accepted and rewritten to `-`.
pub(crate) fn canonical_name(name: &str) -> Result<String> {
    let canonical = name.replace('_', "-");
    let mut chars = canonical.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-');

    if valid {
        Ok(canonical)
    } else {
        Err(Error::InvalidName {
            name: name.to_owned(),
        })
    }
}

impl ParamSpec {
    /// Creates a property descriptor.
    ///
    /// # Arguments
    ///
    /// * `name` - property name; `_` is normalised to `-`
    /// * `value_type` - registered value type
    /// * `default` - default value, converted to `value_type` if needed
    /// * `flags` - access flags
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidName`] for a malformed name
    /// - [`Error::ValueTypeMismatch`] if `default` cannot be converted to
    ///   `value_type`
    pub fn new(name: &str, value_type: Type, default: Value, flags: ParamFlags) -> Result<Self> {
        let name = canonical_name(name)?;

        let default = if default.type_() == value_type {
            default
        } else {
            default
                .transform(value_type)
                .ok_or_else(|| Error::ValueTypeMismatch {
                    expected: value_type.name().to_owned(),
                    found: default.type_().name().to_owned(),
                })?
        };

        Ok(ParamSpec {
            name: global_arena().alloc_str(&name),
            nick: None,
            blurb: None,
            value_type,
            default,
            flags,
            owner: Type::INVALID,
            overridden: None,
        })
    }

    /// Sets a short display name.
    #[must_use]
    pub fn with_nick(mut self, nick: &str) -> Self {
        self.nick = Some(global_arena().alloc_str(nick));
        self
    }

    /// Sets a description.
    #[must_use]
    pub fn with_blurb(mut self, blurb: &str) -> Self {
        self.blurb = Some(global_arena().alloc_str(blurb));
        self
    }

    /// Creates a copy of an interface property for an implementing type.
    ///
    /// The copy keeps the interface's value type, default and flags and
    /// records which interface property it overrides.
    #[must_use]
    pub fn overriding(iface_spec: &ParamSpec) -> Self {
        ParamSpec {
            owner: Type::INVALID,
            overridden: Some(iface_spec.owner),
            ..iface_spec.clone()
        }
    }

    /// Property name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Display name, defaulting to the name.
    #[must_use]
    pub fn nick(&self) -> &'static str {
        self.nick.unwrap_or(self.name)
    }

    /// Description, if any.
    #[must_use]
    pub fn blurb(&self) -> Option<&'static str> {
        self.blurb
    }

    /// Registered value type.
    #[must_use]
    pub fn value_type(&self) -> Type {
        self.value_type
    }

    /// Default value.
    #[must_use]
    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// Flags.
    #[must_use]
    pub fn flags(&self) -> ParamFlags {
        self.flags
    }

    /// Type the property is installed on.
    #[must_use]
    pub fn owner(&self) -> Type {
        self.owner
    }

    /// Interface whose property this one overrides.
    #[must_use]
    pub fn overridden(&self) -> Option<Type> {
        self.overridden
    }

    pub(crate) fn set_owner(&mut self, owner: Type) {
        self.owner = owner;
    }

    /// Readable flag.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.flags.contains(ParamFlags::READABLE)
    }

    /// Writable flag.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(ParamFlags::WRITABLE)
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("value_type", &self.value_type)
            .field("owner", &self.owner)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_canonicalisation() {
        let spec = ParamSpec::new("max_width", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).unwrap();
        assert_eq!(spec.name(), "max-width");
        assert_eq!(spec.nick(), "max-width");

        assert!(matches!(
            ParamSpec::new("1abc", Type::I32, Value::from_i32(0), ParamFlags::READWRITE),
            Err(Error::InvalidName { .. })
        ));
        assert!(ParamSpec::new("with space", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).is_err());
    }

    #[test]
    fn test_default_is_converted() {
        let spec = ParamSpec::new("ratio", Type::F64, Value::from_i32(2), ParamFlags::READABLE).unwrap();
        assert_eq!(spec.default_value().get_f64(), Some(2.0));

        assert!(matches!(
            ParamSpec::new("label", Type::I32, Value::from_string("x"), ParamFlags::READABLE),
            Err(Error::ValueTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_flags() {
        let spec = ParamSpec::new("ro", Type::BOOL, Value::from_bool(true), ParamFlags::READABLE)
            .unwrap()
            .with_nick("Read only")
            .with_blurb("A read-only flag");

        assert!(spec.is_readable());
        assert!(!spec.is_writable());
        assert_eq!(spec.nick(), "Read only");
        assert_eq!(spec.blurb(), Some("A read-only flag"));
    }
}

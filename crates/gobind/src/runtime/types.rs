//! Runtime type registry.
//!
//! Every value and instance carries a [`Type`]: a small id into a global,
//! append-only table of type nodes. The table models a single-inheritance
//! tree rooted at a set of fundamentals, plus interfaces that object types
//! implement independently of their ancestry.
//!
//! # Architecture
//!
//! - Type nodes are allocated in the global arena and never freed
//! - Each node owns a class vtable (`Quark -> VFunc`), per-interface
//!   vtables, installed property specs and type-level qdata
//! - Lookups walk the parent chain; nothing is copied into subclasses, so a
//!   vfunc installed on a parent after a child was registered is still seen
//!   by the child
//!
//! # Thread Safety
//!
//! Registration takes the registry write lock; per-node data is behind its
//! own `RwLock`. Registration is rare and lookups dominate.
//!
//! # Example
//!
//! ```rust
//! use gobind::runtime::{Type, TypeFlags};
//!
//! let base = Type::register_static(Type::OBJECT, "DocShape", TypeFlags::ABSTRACT).unwrap();
//! let circle = Type::register_static(base, "DocCircle", TypeFlags::empty()).unwrap();
//!
//! assert!(circle.is_a(base));
//! assert!(circle.is_a(Type::OBJECT));
//! assert!(!base.is_instantiatable());
//! assert_eq!(Type::from_name("DocCircle"), Some(circle));
//! ```

use crate::error::{Error, Result};
use crate::runtime::closure::VFunc;
use crate::runtime::param::ParamSpec;
use bitflags::bitflags;
use fxhash::FxHashMap;
use gobind_mem::{Quark, global_arena};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A runtime type id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Type(u32);

bitflags! {
    /// Registration flags of a type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u32 {
        /// Cannot be instantiated directly.
        const ABSTRACT = 1 << 0;
        /// Cannot be derived from.
        const FINAL = 1 << 1;
    }
}

/// What a type node describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// The invalid placeholder.
    Invalid,
    /// A fundamental value type (`bool`, `gint`, `gchararray`, ...).
    Fundamental,
    /// An instantiatable object type.
    Object,
    /// An interface.
    Interface,
    /// A boxed (opaque, copyable) value type.
    Boxed,
}

struct InterfaceEntry {
    iface: Type,
    vtable: FxHashMap<Quark, VFunc>,
}

#[derive(Default)]
struct ClassData {
    vtable: FxHashMap<Quark, VFunc>,
    interfaces: Vec<InterfaceEntry>,
    prerequisites: Vec<Type>,
    properties: Vec<Arc<ParamSpec>>,
}

pub(crate) struct TypeNode {
    name: &'static str,
    parent: Option<Type>,
    kind: TypeKind,
    flags: TypeFlags,
    class: RwLock<ClassData>,
    qdata: RwLock<FxHashMap<Quark, usize>>,
}

impl TypeNode {
    fn class(&self) -> RwLockReadGuard<'_, ClassData> {
        match self.class.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn class_mut(&self) -> RwLockWriteGuard<'_, ClassData> {
        match self.class.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct TypeRegistry {
    nodes: Vec<&'static TypeNode>,
    names: FxHashMap<&'static str, Type>,
}

impl TypeRegistry {
    fn insert(
        &mut self,
        name: &str,
        parent: Option<Type>,
        kind: TypeKind,
        flags: TypeFlags,
    ) -> Type {
        let arena = global_arena();
        let name = arena.alloc_str(name);
        let node: &'static TypeNode = arena.alloc(TypeNode {
            name,
            parent,
            kind,
            flags,
            class: RwLock::new(ClassData::default()),
            qdata: RwLock::new(FxHashMap::default()),
        });

        let type_ = Type(self.nodes.len() as u32);
        self.nodes.push(node);
        self.names.insert(name, type_);
        type_
    }
}

fn registry() -> &'static RwLock<TypeRegistry> {
    static REGISTRY: OnceLock<RwLock<TypeRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut reg = TypeRegistry {
            nodes: Vec::new(),
            names: FxHashMap::default(),
        };

        // Order must match the Type constants.
        reg.insert("<invalid>", None, TypeKind::Invalid, TypeFlags::ABSTRACT | TypeFlags::FINAL);
        reg.insert("void", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("GInterface", None, TypeKind::Fundamental, TypeFlags::ABSTRACT);
        reg.insert("gboolean", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("gint", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("guint", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("gint64", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("guint64", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("gfloat", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("gdouble", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("gchararray", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("GBoxed", None, TypeKind::Fundamental, TypeFlags::ABSTRACT);
        reg.insert("GVariant", None, TypeKind::Fundamental, TypeFlags::FINAL);
        reg.insert("GObject", None, TypeKind::Object, TypeFlags::empty());
        reg.insert("GError", Some(Type::BOXED), TypeKind::Boxed, TypeFlags::FINAL);

        RwLock::new(reg)
    })
}

fn read_registry() -> RwLockReadGuard<'static, TypeRegistry> {
    match registry().read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_registry() -> RwLockWriteGuard<'static, TypeRegistry> {
    match registry().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn validate_type_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+'));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName {
            name: name.to_owned(),
        })
    }
}

impl Type {
    /// The invalid type.
    pub const INVALID: Type = Type(0);
    /// No value.
    pub const NONE: Type = Type(1);
    /// Root of all interfaces.
    pub const INTERFACE: Type = Type(2);
    /// `bool`.
    pub const BOOL: Type = Type(3);
    /// `i32`.
    pub const I32: Type = Type(4);
    /// `u32`.
    pub const U32: Type = Type(5);
    /// `i64`.
    pub const I64: Type = Type(6);
    /// `u64`.
    pub const U64: Type = Type(7);
    /// `f32`.
    pub const F32: Type = Type(8);
    /// `f64`.
    pub const F64: Type = Type(9);
    /// Nullable UTF-8 string.
    pub const STRING: Type = Type(10);
    /// Root of all boxed types.
    pub const BOXED: Type = Type(11);
    /// Reference-counted variant.
    pub const VARIANT: Type = Type(12);
    /// Root of all object types.
    pub const OBJECT: Type = Type(13);
    /// Boxed native error.
    pub const ERROR: Type = Type(14);

    pub(crate) fn node(self) -> &'static TypeNode {
        let reg = read_registry();
        reg.nodes
            .get(self.0 as usize)
            .copied()
            .unwrap_or(reg.nodes[0])
    }

    fn register(
        name: &str,
        parent: Option<Type>,
        kind: TypeKind,
        flags: TypeFlags,
    ) -> Result<Type> {
        validate_type_name(name)?;

        let mut reg = write_registry();
        if reg.names.contains_key(name) {
            return Err(Error::TypeAlreadyExists {
                name: name.to_owned(),
            });
        }

        let type_ = reg.insert(name, parent, kind, flags);
        drop(reg);

        gobind_log::debug!("registered type '{}' ({:?})", name, kind);
        Ok(type_)
    }

    /// Registers an object type deriving from `parent`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotDerivable`] if `parent` is not an object type or is
    ///   `FINAL`
    /// - [`Error::TypeAlreadyExists`] if the name is taken
    /// - [`Error::InvalidName`] if the name is not a valid type name
    pub fn register_static(parent: Type, name: &str, flags: TypeFlags) -> Result<Type> {
        if parent.kind() != TypeKind::Object || parent.flags().contains(TypeFlags::FINAL) {
            return Err(Error::NotDerivable {
                type_name: parent.name().to_owned(),
            });
        }
        Self::register(name, Some(parent), TypeKind::Object, flags)
    }

    /// Registers an interface type.
    ///
    /// Object types implementing it must be `is_a` every prerequisite.
    pub fn register_interface(name: &str, prerequisites: &[Type]) -> Result<Type> {
        let iface = Self::register(
            name,
            Some(Type::INTERFACE),
            TypeKind::Interface,
            TypeFlags::ABSTRACT,
        )?;
        iface.node().class_mut().prerequisites = prerequisites.to_vec();
        Ok(iface)
    }

    /// Registers a boxed type.
    pub fn register_boxed(name: &str) -> Result<Type> {
        Self::register(name, Some(Type::BOXED), TypeKind::Boxed, TypeFlags::FINAL)
    }

    /// Looks a type up by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Type> {
        read_registry().names.get(name).copied()
    }

    /// Returns the type name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.node().name
    }

    /// Returns the parent type.
    #[must_use]
    pub fn parent(self) -> Option<Type> {
        self.node().parent
    }

    /// Returns the node kind.
    #[must_use]
    pub fn kind(self) -> TypeKind {
        self.node().kind
    }

    /// Returns the registration flags.
    #[must_use]
    pub fn flags(self) -> TypeFlags {
        self.node().flags
    }

    /// Returns the root of this type's chain.
    #[must_use]
    pub fn fundamental(self) -> Type {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Iterates this type and its ancestors, most derived first.
    pub fn ancestors(self) -> impl Iterator<Item = Type> {
        std::iter::successors(Some(self), |t| t.parent())
    }

    /// Returns true if this is an interface type.
    #[must_use]
    pub fn is_interface(self) -> bool {
        self.kind() == TypeKind::Interface
    }

    /// Returns true if this is `GObject` or derives from it.
    #[must_use]
    pub fn is_object(self) -> bool {
        self.kind() == TypeKind::Object
    }

    /// Returns true if instances of this type can be created.
    #[must_use]
    pub fn is_instantiatable(self) -> bool {
        self.is_object() && !self.flags().contains(TypeFlags::ABSTRACT)
    }

    /// Returns true if `self` is `other`, derives from it, or implements it.
    #[must_use]
    pub fn is_a(self, other: Type) -> bool {
        if self == other {
            return true;
        }
        if other == Type::INVALID || self == Type::INVALID {
            return false;
        }

        if other.is_interface() {
            if self.is_interface() {
                return self.prerequisites().iter().any(|p| p.is_a(other));
            }
            return self
                .ancestors()
                .any(|t| t.node().class().interfaces.iter().any(|e| e.iface == other));
        }

        self.ancestors().any(|t| t == other)
    }

    /// Returns the prerequisites of an interface.
    #[must_use]
    pub fn prerequisites(self) -> Vec<Type> {
        self.node().class().prerequisites.clone()
    }

    /// Declares that object type `self` implements `iface`.
    ///
    /// Adding an interface the type already declares is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAnInterface`] if `iface` is not an interface
    /// - [`Error::NotDerivable`] if `self` is not an object type
    /// - [`Error::MissingPrerequisite`] if `self` is not `is_a` one of the
    ///   interface's prerequisites
    pub fn add_interface(self, iface: Type) -> Result<()> {
        if !iface.is_interface() {
            return Err(Error::NotAnInterface {
                type_name: iface.name().to_owned(),
            });
        }
        if !self.is_object() {
            return Err(Error::NotDerivable {
                type_name: self.name().to_owned(),
            });
        }
        if let Some(missing) = iface.prerequisites().into_iter().find(|p| !self.is_a(*p)) {
            return Err(Error::MissingPrerequisite {
                type_name: self.name().to_owned(),
                interface: iface.name().to_owned(),
                prerequisite: missing.name().to_owned(),
            });
        }

        let mut class = self.node().class_mut();
        if !class.interfaces.iter().any(|e| e.iface == iface) {
            class.interfaces.push(InterfaceEntry {
                iface,
                vtable: FxHashMap::default(),
            });
        }
        Ok(())
    }

    /// Returns every interface the type implements, own and inherited.
    #[must_use]
    pub fn interfaces(self) -> Vec<Type> {
        let mut out: Vec<Type> = Vec::new();
        for t in self.ancestors() {
            for entry in &t.node().class().interfaces {
                if !out.contains(&entry.iface) {
                    out.push(entry.iface);
                }
            }
        }
        out
    }

    /// Installs a class vfunc. On an interface type this sets the interface
    /// default implementation.
    pub fn override_vfunc(self, name: &str, vfunc: VFunc) {
        self.node()
            .class_mut()
            .vtable
            .insert(Quark::from_str(name), vfunc);
    }

    /// Finds the most derived implementation of a class vfunc.
    #[must_use]
    pub fn lookup_vfunc(self, name: Quark) -> Option<VFunc> {
        self.ancestors()
            .find_map(|t| t.node().class().vtable.get(&name).copied())
    }

    /// Installs this type's implementation of an interface vfunc.
    ///
    /// # Errors
    ///
    /// [`Error::InterfaceNotImplemented`] if the type does not implement
    /// `iface`.
    pub fn override_interface_vfunc(self, iface: Type, name: &str, vfunc: VFunc) -> Result<()> {
        if self == iface {
            self.override_vfunc(name, vfunc);
            return Ok(());
        }
        if !self.is_object() || !self.is_a(iface) {
            return Err(Error::InterfaceNotImplemented {
                type_name: self.name().to_owned(),
                interface: iface.name().to_owned(),
            });
        }

        let name = Quark::from_str(name);
        let mut class = self.node().class_mut();
        match class.interfaces.iter_mut().find(|e| e.iface == iface) {
            Some(entry) => {
                entry.vtable.insert(name, vfunc);
            }
            None => {
                // Inherited interface: the subclass gets its own vtable.
                let mut vtable = FxHashMap::default();
                vtable.insert(name, vfunc);
                class.interfaces.push(InterfaceEntry { iface, vtable });
            }
        }
        Ok(())
    }

    /// Finds the implementation of an interface vfunc for this type.
    ///
    /// Walks from the most derived type up, then falls back to the
    /// interface's default implementation.
    #[must_use]
    pub fn lookup_interface_vfunc(self, iface: Type, name: Quark) -> Option<VFunc> {
        self.ancestors()
            .find_map(|t| {
                t.node()
                    .class()
                    .interfaces
                    .iter()
                    .find(|e| e.iface == iface)
                    .and_then(|e| e.vtable.get(&name).copied())
            })
            .or_else(|| iface.node().class().vtable.get(&name).copied())
    }

    /// Installs a property on this type.
    ///
    /// # Errors
    ///
    /// [`Error::PropertyAlreadyExists`] if the type itself already has a
    /// property with that name. Shadowing an ancestor's property is allowed.
    pub fn install_property(self, mut spec: ParamSpec) -> Result<Arc<ParamSpec>> {
        let mut class = self.node().class_mut();
        if class.properties.iter().any(|p| p.name() == spec.name()) {
            return Err(Error::PropertyAlreadyExists {
                type_name: self.name().to_owned(),
                property: spec.name().to_owned(),
            });
        }

        spec.set_owner(self);
        let spec = Arc::new(spec);
        class.properties.push(Arc::clone(&spec));
        Ok(spec)
    }

    /// Finds a property by name on this type or its ancestors.
    ///
    /// `_` and `-` are interchangeable in the name.
    #[must_use]
    pub fn find_property(self, name: &str) -> Option<Arc<ParamSpec>> {
        let canonical = name.replace('_', "-");
        self.ancestors().find_map(|t| t.find_own_property(&canonical))
    }

    /// Finds a property installed on exactly this type.
    #[must_use]
    pub fn find_own_property(self, name: &str) -> Option<Arc<ParamSpec>> {
        self.node()
            .class()
            .properties
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Lists every property visible on this type, most derived first.
    #[must_use]
    pub fn properties(self) -> Vec<Arc<ParamSpec>> {
        let mut out: Vec<Arc<ParamSpec>> = Vec::new();
        for t in self.ancestors() {
            for spec in &t.node().class().properties {
                if !out.iter().any(|p| p.name() == spec.name()) {
                    out.push(Arc::clone(spec));
                }
            }
        }
        out
    }

    /// Stores type-level data.
    pub fn set_qdata(self, key: Quark, data: usize) {
        let mut qdata = match self.node().qdata.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        qdata.insert(key, data);
    }

    /// Reads type-level data.
    #[must_use]
    pub fn qdata(self, key: Quark) -> Option<usize> {
        let qdata = match self.node().qdata.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        qdata.get(&key).copied()
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type({})", self.name())
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

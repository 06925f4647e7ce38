//! Error types for `gobind`.
//!
//! Two families of failures flow through the crate:
//!
//! - **Binding errors**: misuse that the binding can detect and report
//!   (unknown property, wrong value type, unknown signal, malformed variant
//!   signature). These are ordinary `Err` values.
//! - **Domain errors**: `(domain, code, message)` triples produced by native
//!   operations. Each error domain registers a constructor with
//!   [`register_error_domain`], and [`Error::from_domain`] dispatches on the
//!   domain quark to build the typed variant ([`IoError`], [`ConvertError`]).
//!   Unknown domains fall back to [`Error::Domain`].
//!
//! Broken binding invariants (a handle bound to two wrappers, use of a
//! wrapper whose native object is gone) are not errors; they panic through
//! [`invariant_violation`].

use fxhash::FxHashMap;
use gobind_log::warn;
use gobind_mem::Quark;
use std::fmt;
use std::sync::{OnceLock, RwLock};

/// Errors reported by `gobind`.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// No property with this name on the object's type.
    UnknownProperty {
        /// Runtime type name.
        type_name: String,
        /// Requested property.
        property: String,
    },

    /// Property exists but has no `READABLE` flag.
    PropertyNotReadable {
        /// Property name.
        property: String,
    },

    /// Property exists but has no `WRITABLE` flag.
    PropertyNotWritable {
        /// Property name.
        property: String,
    },

    /// The property's registered value type does not match the requested one.
    PropertyTypeMismatch {
        /// Property name.
        property: String,
        /// Registered value type.
        expected: String,
        /// Requested value type.
        found: String,
    },

    /// A property with this name is already installed on the type.
    PropertyAlreadyExists {
        /// Runtime type name.
        type_name: String,
        /// Property name.
        property: String,
    },

    /// A property or signal name contains invalid characters.
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// A value holds a different type than the one requested.
    ValueTypeMismatch {
        /// Requested type.
        expected: String,
        /// Held type.
        found: String,
    },

    /// No signal with this name on the object's type.
    UnknownSignal {
        /// Runtime type name.
        type_name: String,
        /// Requested signal, including any detail.
        signal: String,
    },

    /// A signal with this name is already registered on the type.
    SignalAlreadyExists {
        /// Runtime type name.
        type_name: String,
        /// Signal name.
        signal: String,
    },

    /// A detail was given for a signal that is not `DETAILED`.
    InvalidDetail {
        /// Detailed signal name.
        signal: String,
    },

    /// Emission or connection used the wrong number of arguments.
    SignalArgumentCount {
        /// Signal name.
        signal: String,
        /// Declared parameter count.
        expected: usize,
        /// Supplied count.
        got: usize,
    },

    /// Emission or connection used an argument of the wrong type.
    SignalArgumentType {
        /// Signal name.
        signal: String,
        /// Zero-based argument index.
        index: usize,
        /// Declared type.
        expected: String,
        /// Supplied type.
        found: String,
    },

    /// A variant type string failed to parse.
    InvalidVariantType {
        /// The rejected signature.
        signature: String,
    },

    /// A variant holds a different type than the one requested.
    VariantTypeMismatch {
        /// Requested signature.
        expected: String,
        /// Held signature.
        found: String,
    },

    /// A string is not a valid D-Bus object path or signature.
    InvalidVariantString {
        /// Variant type the string was meant for (`o` or `g`).
        kind: char,
        /// The rejected string.
        value: String,
    },

    /// Child index past the end of a container variant.
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of children.
        len: usize,
    },

    /// A type with this name is already registered.
    TypeAlreadyExists {
        /// Type name.
        name: String,
    },

    /// The parent type cannot be derived from.
    NotDerivable {
        /// Parent type name.
        type_name: String,
    },

    /// The type cannot be instantiated (abstract, interface or fundamental).
    NotInstantiable {
        /// Type name.
        type_name: String,
    },

    /// An interface operation was given a type that is not an interface.
    NotAnInterface {
        /// Type name.
        type_name: String,
    },

    /// The object's type does not implement the interface.
    InterfaceNotImplemented {
        /// Object type name.
        type_name: String,
        /// Interface type name.
        interface: String,
    },

    /// The type does not satisfy an interface prerequisite.
    MissingPrerequisite {
        /// Object type name.
        type_name: String,
        /// Interface type name.
        interface: String,
        /// Prerequisite type name.
        prerequisite: String,
    },

    /// No implementation of a virtual function is reachable.
    MissingVFunc {
        /// Type name.
        type_name: String,
        /// Virtual function name.
        vfunc: String,
    },

    /// Error in the `g-io-error-quark` domain.
    Io(IoError),

    /// Error in the `g_convert_error` domain.
    Convert(ConvertError),

    /// Error in a domain without a registered constructor.
    Domain(DomainError),
}

/// Result alias used throughout `gobind`.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownProperty {
                type_name,
                property,
            } => {
                write!(f, "Object type '{type_name}' has no property named '{property}'")
            }
            Error::PropertyNotReadable { property } => {
                write!(f, "Property '{property}' is not readable")
            }
            Error::PropertyNotWritable { property } => {
                write!(f, "Property '{property}' is not writable")
            }
            Error::PropertyTypeMismatch {
                property,
                expected,
                found,
            } => {
                write!(
                    f,
                    "Property '{property}' holds '{expected}', not '{found}'"
                )
            }
            Error::PropertyAlreadyExists {
                type_name,
                property,
            } => {
                write!(f, "Type '{type_name}' already has a property named '{property}'")
            }
            Error::InvalidName { name } => {
                write!(f, "Invalid property or signal name: '{name}'")
            }
            Error::ValueTypeMismatch { expected, found } => {
                write!(f, "Value type mismatch: expected '{expected}', found '{found}'")
            }
            Error::UnknownSignal { type_name, signal } => {
                write!(f, "Object type '{type_name}' has no signal named '{signal}'")
            }
            Error::SignalAlreadyExists { type_name, signal } => {
                write!(f, "Type '{type_name}' already has a signal named '{signal}'")
            }
            Error::InvalidDetail { signal } => {
                write!(f, "Signal '{signal}' does not support details")
            }
            Error::SignalArgumentCount {
                signal,
                expected,
                got,
            } => {
                write!(
                    f,
                    "Signal '{signal}' takes {expected} arguments, got {got}"
                )
            }
            Error::SignalArgumentType {
                signal,
                index,
                expected,
                found,
            } => {
                write!(
                    f,
                    "Signal '{signal}' argument {index}: expected '{expected}', found '{found}'"
                )
            }
            Error::InvalidVariantType { signature } => {
                write!(f, "Invalid variant type string: '{signature}'")
            }
            Error::VariantTypeMismatch { expected, found } => {
                write!(f, "Variant type mismatch: expected '{expected}', found '{found}'")
            }
            Error::InvalidVariantString { kind, value } => {
                write!(f, "Invalid string for variant type '{kind}': '{value}'")
            }
            Error::IndexOutOfRange { index, len } => {
                write!(f, "Child index {index} out of range for container of {len}")
            }
            Error::TypeAlreadyExists { name } => {
                write!(f, "Type name '{name}' is already registered")
            }
            Error::NotDerivable { type_name } => {
                write!(f, "Type '{type_name}' cannot be derived from")
            }
            Error::NotInstantiable { type_name } => {
                write!(f, "Type '{type_name}' cannot be instantiated")
            }
            Error::NotAnInterface { type_name } => {
                write!(f, "Type '{type_name}' is not an interface")
            }
            Error::InterfaceNotImplemented {
                type_name,
                interface,
            } => {
                write!(f, "Type '{type_name}' does not implement '{interface}'")
            }
            Error::MissingPrerequisite {
                type_name,
                interface,
                prerequisite,
            } => {
                write!(
                    f,
                    "Type '{type_name}' cannot implement '{interface}': requires '{prerequisite}'"
                )
            }
            Error::MissingVFunc { type_name, vfunc } => {
                write!(f, "Type '{type_name}' has no implementation of '{vfunc}'")
            }
            Error::Io(e) => fmt::Display::fmt(e, f),
            Error::Convert(e) => fmt::Display::fmt(e, f),
            Error::Domain(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Builds the typed error for a native `(domain, code, message)` triple.
    ///
    /// Dispatches on the domain quark through the constructors registered
    /// with [`register_error_domain`]. An unregistered domain logs a warning
    /// and yields [`Error::Domain`].
    #[must_use]
    pub fn from_domain(error: DomainError) -> Error {
        let ctor = {
            let domains = match domains().read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            domains.get(&error.domain).copied()
        };

        match ctor {
            Some(ctor) => ctor(error),
            None => {
                warn!(
                    "Error::from_domain(): unknown error domain '{}'; code {}, message: {}",
                    error.domain, error.code, error.message
                );
                Error::Domain(error)
            }
        }
    }

    /// Returns the error domain, or `None` for binding errors.
    #[must_use]
    pub fn domain(&self) -> Option<Quark> {
        match self {
            Error::Io(_) => Some(IoError::domain()),
            Error::Convert(_) => Some(ConvertError::domain()),
            Error::Domain(e) => Some(e.domain),
            _ => None,
        }
    }

    /// Returns the domain-specific code, or `None` for binding errors.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Io(e) => Some(e.code as i32),
            Error::Convert(e) => Some(e.code as i32),
            Error::Domain(e) => Some(e.code),
            _ => None,
        }
    }

    /// Returns true for errors carrying a `(domain, code)` pair.
    #[must_use]
    pub fn is_domain_error(&self) -> bool {
        self.domain().is_some()
    }

    /// Converts a domain error back into its native triple.
    #[must_use]
    pub fn to_domain_error(&self) -> Option<DomainError> {
        let domain = self.domain()?;
        let code = self.code()?;
        let message = match self {
            Error::Io(e) => e.message.clone(),
            Error::Convert(e) => e.message.clone(),
            Error::Domain(e) => e.message.clone(),
            _ => return None,
        };
        Some(DomainError {
            domain,
            code,
            message,
        })
    }
}

/// A native error as the runtime reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainError {
    /// Error domain.
    pub domain: Quark,
    /// Domain-specific code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
}

impl DomainError {
    /// Creates a domain error.
    #[must_use]
    pub fn new(domain: Quark, code: i32, message: impl Into<String>) -> Self {
        DomainError {
            domain,
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.message, self.domain, self.code)
    }
}

macro_rules! error_codes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident = $value:literal,)* }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum $name {
            $(
                #[allow(missing_docs)]
                $variant = $value,
            )*
        }

        impl $name {
            /// Maps a native code to its variant.
            #[must_use]
            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($value => Some($name::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

error_codes! {
    /// Codes of the I/O error domain.
    pub enum IoErrorEnum {
        Failed = 0,
        NotFound = 1,
        Exists = 2,
        IsDirectory = 3,
        NotDirectory = 4,
        NotEmpty = 5,
        NotRegularFile = 6,
        NotSymbolicLink = 7,
        NotMountableFile = 8,
        FilenameTooLong = 9,
        InvalidFilename = 10,
        TooManyLinks = 11,
        NoSpace = 12,
        InvalidArgument = 13,
        PermissionDenied = 14,
        NotSupported = 15,
        NotMounted = 16,
        AlreadyMounted = 17,
        Closed = 18,
        Cancelled = 19,
        Pending = 20,
        ReadOnly = 21,
        CantCreateBackup = 22,
        WrongEtag = 23,
        TimedOut = 24,
        WouldRecurse = 25,
        Busy = 26,
        WouldBlock = 27,
        HostNotFound = 28,
        WouldMerge = 29,
        FailedHandled = 30,
        TooManyOpenFiles = 31,
        NotInitialized = 32,
        AddressInUse = 33,
        PartialInput = 34,
        InvalidData = 35,
    }
}

error_codes! {
    /// Codes of the character-set conversion error domain.
    pub enum ConvertErrorEnum {
        NoConversion = 0,
        IllegalSequence = 1,
        Failed = 2,
        PartialInput = 3,
        BadUri = 4,
        NotAbsolutePath = 5,
        NoMemory = 6,
        EmbeddedNul = 7,
    }
}

/// An error from the I/O domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoError {
    /// Error code.
    pub code: IoErrorEnum,
    /// Human-readable message.
    pub message: String,
}

impl IoError {
    /// Domain string of I/O errors.
    pub const DOMAIN: &'static str = "g-io-error-quark";

    /// Creates an I/O error.
    #[must_use]
    pub fn new(code: IoErrorEnum, message: impl Into<String>) -> Self {
        IoError {
            code,
            message: message.into(),
        }
    }

    /// Returns the I/O error domain quark.
    #[must_use]
    pub fn domain() -> Quark {
        Quark::from_str(Self::DOMAIN)
    }

    fn from_domain_error(error: DomainError) -> Error {
        // Codes added after this table was written map to Failed.
        let code = IoErrorEnum::from_code(error.code).unwrap_or(IoErrorEnum::Failed);
        Error::Io(IoError::new(code, error.message))
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (I/O error {:?})", self.message, self.code)
    }
}

/// An error from the conversion domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertError {
    /// Error code.
    pub code: ConvertErrorEnum,
    /// Human-readable message.
    pub message: String,
}

impl ConvertError {
    /// Domain string of conversion errors.
    pub const DOMAIN: &'static str = "g_convert_error";

    /// Creates a conversion error.
    #[must_use]
    pub fn new(code: ConvertErrorEnum, message: impl Into<String>) -> Self {
        ConvertError {
            code,
            message: message.into(),
        }
    }

    /// Returns the conversion error domain quark.
    #[must_use]
    pub fn domain() -> Quark {
        Quark::from_str(Self::DOMAIN)
    }

    fn from_domain_error(error: DomainError) -> Error {
        match ConvertErrorEnum::from_code(error.code) {
            Some(code) => Error::Convert(ConvertError::new(code, error.message)),
            None => Error::Domain(error),
        }
    }
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (conversion error {:?})", self.message, self.code)
    }
}

/// Constructor turning a native triple into a typed [`Error`].
pub type DomainConstructor = fn(DomainError) -> Error;

fn domains() -> &'static RwLock<FxHashMap<Quark, DomainConstructor>> {
    static DOMAINS: OnceLock<RwLock<FxHashMap<Quark, DomainConstructor>>> = OnceLock::new();
    DOMAINS.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// Registers the constructor used by [`Error::from_domain`] for `domain`.
///
/// Registering a domain twice replaces the earlier constructor.
pub fn register_error_domain(domain: Quark, ctor: DomainConstructor) {
    let mut domains = match domains().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    domains.insert(domain, ctor);
}

/// Registers the domains this crate knows about.
pub(crate) fn register_builtin_domains() {
    register_error_domain(IoError::domain(), IoError::from_domain_error);
    register_error_domain(ConvertError::domain(), ConvertError::from_domain_error);
}

/// Reports a broken binding invariant and panics.
///
/// Inside a native callback the panic is caught at the trampoline boundary
/// and treated as fatal by the exception bridge.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(args: fmt::Arguments<'_>) -> ! {
    gobind_log::error!("binding invariant violated: {}", args);

    #[cfg(feature = "invariant-backtrace")]
    {
        let trace = backtrace::Backtrace::new();
        gobind_log::error!("backtrace:\n{:?}", trace);
    }

    panic!("binding invariant violated: {args}");
}

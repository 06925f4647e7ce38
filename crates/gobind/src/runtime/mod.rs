//! The native object runtime.
//!
//! This layer is written the way a C object system is: raw reference-counted
//! instances, a global type table with class and interface vtables, signal
//! handler lists, untyped tagged-union values and `extern "C"` callbacks
//! carrying `*const c_void` user data. It knows nothing about Rust wrapper
//! types. The binding layer in the crate root sits on top of it and owns
//! every safety argument that crosses the boundary.
//!
//! # Modules
//!
//! - [`types`]: type registry, inheritance, interfaces, vtables, properties
//! - [`instance`]: reference-counted instances, qdata, weak references
//! - [`closure`]: marshal functions, closures and vfunc slots
//! - [`signal`]: signal registry and emission
//! - [`param`]: property descriptors
//! - [`value`]: the tagged-union value container
//! - [`variant`]: immutable self-describing variant trees

pub mod closure;
pub mod instance;
pub mod param;
pub mod signal;
pub mod types;
pub mod value;
pub mod variant;

pub use closure::{Closure, DestroyNotify, MarshalFn, VFunc};
pub use instance::{Instance, QDataDestroy, RawInstance, WeakNotify, set_debug_refcounting};
pub use param::{ParamFlags, ParamSpec};
pub use signal::{SignalFlags, SignalId};
pub use types::{Type, TypeFlags, TypeKind};
pub use value::{BoxedValue, Value, ValueData};
pub use variant::{RawVariant, VariantData, VariantType};

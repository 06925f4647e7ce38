//! `gobind`: safe Rust wrappers over a reference-counted native object runtime
//!
//! The [`runtime`] module is the native side: a C-style object system with
//! typed instances, properties, signals, interfaces and variants. The rest
//! of the crate binds Rust to it:
//!
//! - **Wrapper registry**: one wrapper per native instance, found again from
//!   a raw handle, with ownership that follows whoever holds the last
//!   reference ([`WrapperRegistry`], [`RefPtr`])
//! - **Objects and interfaces**: [`Object`], custom types built with
//!   [`ClassBuilder`], interface views such as [`Converter`]
//! - **Properties and signals**: typed [`PropertyProxy`] and
//!   [`SignalProxy`], connections that survive either side going away
//!   first ([`Connection`], [`ScopedConnection`])
//! - **Error bridge**: failures inside native callbacks are caught and
//!   routed to [`exception`] handlers; native domain errors become typed
//!   [`Error`] values
//! - **Variants**: [`Variant<T>`] with the signature fixed by `T`
//! - **Event loop**: [`MainContext`], [`MainLoop`] and the cross-thread
//!   [`Dispatcher`]
//!
//! # Example
//!
//! ```rust
//! use gobind::runtime::Type;
//! use gobind::{construct, ClassBuilder, CustomType, Object, ObjectBase, ObjectImpl, ParamFlags, ParamSpec, Value};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct Counter {
//!     parent: Object,
//! }
//!
//! impl ObjectImpl for Counter {
//!     fn base(&self) -> &ObjectBase {
//!         self.parent.base()
//!     }
//! }
//!
//! impl CustomType for Counter {
//!     const NAME: Option<&'static str> = Some("CrateDocCounter");
//!     type Parent = Object;
//!
//!     fn class_init(class: &mut ClassBuilder<Self>) {
//!         class.property(ParamSpec::new("count", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).unwrap());
//!     }
//! }
//!
//! gobind::init();
//!
//! let counter = construct(Counter::default()).unwrap();
//! let changes = Arc::new(AtomicUsize::new(0));
//! let c = Arc::clone(&changes);
//! let _conn = counter.base().connect_property_changed("count", move || {
//!     c.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! counter.base().property::<i32>("count").set_value(7).unwrap();
//! assert_eq!(counter.base().property::<i32>("count").get_value(), Ok(7));
//! assert_eq!(changes.load(Ordering::SeqCst), 1);
//! ```

pub mod binding;
mod cancellable;
mod class;
mod config;
mod connection;
pub mod converter;
mod dispatcher;
pub mod error;
pub mod exception;
mod init;
mod interface;
mod main_context;
mod object;
mod object_base;
mod property;
pub mod runtime;
mod signal_proxy;
mod value;
mod variant;
mod weak_ref;
mod wrap;

pub use binding::{Binding, BindingFlags, bind_property, bind_property_full};
pub use cancellable::Cancellable;
pub use class::{ClassBuilder, CustomType, VFuncImpl, construct, register_custom_type};
pub use config::{DEBUG_ENV, RuntimeConfig};
pub use connection::{Connection, ScopedConnection};
pub use converter::{ConvertOutput, Converter, ConverterFlags, ConverterImpl, ConverterObject, ConverterResult};
pub use dispatcher::{DispatchSender, DispatchSlotId, Dispatcher};
pub use error::{
    ConvertError, ConvertErrorEnum, DomainConstructor, DomainError, Error, IoError, IoErrorEnum, Result,
    register_error_domain,
};
pub use init::{init, init_with, is_initialized};
pub use interface::{Interface, InterfaceView, IsInterface, install_interface_properties};
pub use main_context::{ControlFlow, MainContext, MainLoop, SourceFn, SourceId};
pub use object::{AsAnyArc, IsObject, Object, ObjectImpl, RefPtr};
pub use object_base::{CustomTypeName, ObjectBase, RefKind};
pub use property::{PropertyProxy, PropertyProxyReadOnly, PropertyProxyWriteOnly};
pub use runtime::{ParamFlags, ParamSpec, Value};
pub use signal_proxy::{SignalArgs, SignalProxy, SignalReturn, Slot};
pub use value::{Boxed, ValueType, boxed_type};
pub use variant::{BasicVariantKind, DictEntry, ObjectPath, Signature, Variant, VariantBase, VariantKind};
pub use weak_ref::WeakRef;
pub use wrap::{Ownership, WrapperFactory, WrapperRegistry, register_wrapped_type, wrap};

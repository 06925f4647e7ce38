//! The `GConverter` interface: stateful byte-stream conversion.
//!
//! The interface declares two vfuncs, `convert` and `reset`. Its default
//! `convert` fails with [`IoErrorEnum::NotSupported`], so a type that
//! declares the interface without implementing it reports an error rather
//! than crashing.
//!
//! Rust types implement it through [`ConverterImpl`] and
//! [`implement_converter`]; callers go through the [`Converter`] view,
//! which dispatches on the native vtable and therefore works the same for
//! native implementations.
//!
//! # Example
//!
//! ```rust
//! use gobind::converter::{implement_converter, ConvertOutput, Converter, ConverterFlags, ConverterImpl, ConverterResult};
//! use gobind::{construct, ClassBuilder, CustomType, Object, ObjectBase, ObjectImpl, Result};
//!
//! #[derive(Default)]
//! struct Upper {
//!     parent: Object,
//! }
//!
//! impl ObjectImpl for Upper {
//!     fn base(&self) -> &ObjectBase {
//!         self.parent.base()
//!     }
//! }
//!
//! impl CustomType for Upper {
//!     type Parent = Object;
//!
//!     fn class_init(class: &mut ClassBuilder<Self>) {
//!         implement_converter(class);
//!     }
//! }
//!
//! impl ConverterImpl for Upper {
//!     fn convert(&self, input: &[u8], output_size: usize, _flags: ConverterFlags) -> Result<ConvertOutput> {
//!         let n = input.len().min(output_size);
//!         Ok(ConvertOutput::new(ConverterResult::Converted, n, input[..n].to_ascii_uppercase()))
//!     }
//! }
//!
//! let upper = construct(Upper::default()).unwrap();
//! let converter = upper.base().interface::<Converter>().unwrap();
//! let out = converter.convert(b"abc", 16, ConverterFlags::empty()).unwrap();
//! assert_eq!(out.output, b"ABC");
//! ```

use crate::class::{ClassBuilder, CustomType};
use crate::error::{DomainError, Error, IoError, IoErrorEnum, Result, invariant_violation};
use crate::interface::{Interface, InterfaceView, IsInterface};
use crate::object::{Object, ObjectImpl};
use crate::object_base::ObjectBase;
use crate::runtime::{RawInstance, Type, VFunc, Value};
use crate::value::{Boxed, ValueType, boxed_type};
use bitflags::bitflags;
use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

bitflags! {
    /// Flags passed to [`Converter::convert`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConverterFlags: u32 {
        /// No more input after this call.
        const INPUT_AT_END = 1 << 0;
        /// Flush buffered state.
        const FLUSH = 1 << 1;
    }
}

/// Outcome of one [`Converter::convert`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverterResult {
    /// Some data was consumed or produced.
    Converted,
    /// The conversion is complete.
    Finished,
    /// Flushing completed.
    Flushed,
}

/// What a converter consumed and produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOutput {
    /// Outcome.
    pub result: ConverterResult,
    /// Bytes consumed from the input.
    pub bytes_read: usize,
    /// Bytes produced.
    pub output: Vec<u8>,
}

impl ConvertOutput {
    /// Bundles a conversion outcome.
    #[must_use]
    pub fn new(result: ConverterResult, bytes_read: usize, output: Vec<u8>) -> Self {
        ConvertOutput {
            result,
            bytes_read,
            output,
        }
    }
}

/// Return slot of the native `convert` vfunc.
type ConvertReply = std::result::Result<ConvertOutput, DomainError>;

static CONVERTER_TYPE: OnceLock<Type> = OnceLock::new();

pub(crate) fn register_type() -> Type {
    *CONVERTER_TYPE.get_or_init(|| {
        let iface = match Type::register_interface("GConverter", &[Type::OBJECT]) {
            Ok(iface) => iface,
            Err(e) => invariant_violation(format_args!("cannot register GConverter: {e}")),
        };
        iface.override_vfunc("convert", VFunc::native(default_convert));
        iface.override_vfunc("reset", VFunc::native(default_reset));
        iface
    })
}

pub(crate) fn converter_factory() -> Arc<dyn ObjectImpl> {
    Arc::new(ConverterObject {
        parent: Object::uninit(),
    })
}

unsafe extern "C" fn default_convert(
    _data: *const c_void,
    instance: *mut RawInstance,
    _args: *const Value,
    _n_args: usize,
    ret: *mut Value,
) {
    // SAFETY: the runtime passes a live instance.
    let type_name = unsafe { &*instance }.type_().name();
    let reply: ConvertReply = Err(DomainError::new(
        IoError::domain(),
        IoErrorEnum::NotSupported as i32,
        format!("{type_name} does not implement GConverter::convert"),
    ));
    // SAFETY: ret is null or an initialized return slot.
    if let Some(ret) = unsafe { ret.as_mut() } {
        *ret = Boxed(reply).to_value();
    }
}

unsafe extern "C" fn default_reset(
    _data: *const c_void,
    _instance: *mut RawInstance,
    _args: *const Value,
    _n_args: usize,
    _ret: *mut Value,
) {
}

/// An object seen as a `GConverter`.
#[derive(Debug, Clone, Copy)]
pub struct Converter<'a> {
    iface: Interface<'a>,
}

impl IsInterface for Converter<'_> {
    fn static_type() -> Type {
        crate::init();
        register_type()
    }
}

impl<'a> InterfaceView<'a> for Converter<'a> {
    fn from_interface(iface: Interface<'a>) -> Self {
        Converter { iface }
    }
}

impl<'a> Converter<'a> {
    /// The object behind the view.
    #[must_use]
    pub fn base(&self) -> &'a ObjectBase {
        self.iface.base()
    }

    /// Converts a chunk of input.
    ///
    /// # Arguments
    ///
    /// * `input` - bytes available for reading
    /// * `output_size` - most bytes the converter may produce
    /// * `flags` - end-of-input and flush requests
    ///
    /// # Errors
    ///
    /// - the implementation's domain error
    /// - [`IoErrorEnum::NotSupported`] from the default implementation
    /// - [`IoErrorEnum::NoSpace`] if the implementation produced more than
    ///   `output_size` bytes
    /// - [`IoErrorEnum::Failed`] if the implementation failed without a
    ///   domain error (already reported to the exception handlers)
    pub fn convert(&self, input: &[u8], output_size: usize, flags: ConverterFlags) -> Result<ConvertOutput> {
        let args = [
            Boxed(input.to_vec()).to_value(),
            Value::from_u64(output_size as u64),
            Value::from_u32(flags.bits()),
        ];
        let ret = self
            .iface
            .call_vfunc("convert", &args, boxed_type::<ConvertReply>())?;

        match ret.get_boxed::<ConvertReply>() {
            Some(Ok(out)) if out.output.len() > output_size => Err(Error::Io(IoError::new(
                IoErrorEnum::NoSpace,
                format!("converter produced {} bytes, room for {output_size}", out.output.len()),
            ))),
            Some(Ok(out)) => Ok(out.clone()),
            Some(Err(e)) => Err(Error::from_domain(e.clone())),
            None => Err(Error::Io(IoError::new(IoErrorEnum::Failed, "converter failed"))),
        }
    }

    /// Returns the converter to its initial state.
    ///
    /// # Errors
    ///
    /// [`Error::MissingVFunc`] if no implementation is reachable.
    pub fn reset(&self) -> Result<()> {
        self.iface.call_vfunc("reset", &[], Type::NONE).map(drop)
    }
}

/// Rust implementation of `GConverter`.
pub trait ConverterImpl: CustomType {
    /// See [`Converter::convert`]. Binding errors returned here are treated
    /// as bugs by the exception bridge.
    ///
    /// # Errors
    ///
    /// A domain error describing why the input cannot be converted.
    fn convert(&self, input: &[u8], output_size: usize, flags: ConverterFlags) -> Result<ConvertOutput>;

    /// See [`Converter::reset`].
    fn reset(&self) {}
}

fn arg(args: &[Value], index: usize) -> Result<&Value> {
    args.get(index).ok_or_else(|| Error::IndexOutOfRange {
        index,
        len: args.len(),
    })
}

/// Declares `GConverter` on `T`'s type and routes its vfuncs to
/// [`ConverterImpl`]. Call from [`CustomType::class_init`].
pub fn implement_converter<T: ConverterImpl>(class: &mut ClassBuilder<T>) {
    let iface = register_type();
    class.implement_interface(iface);

    class.override_interface_vfunc(iface, "convert", |this: &T, args| {
        let input = Boxed::<Vec<u8>>::from_value(arg(args, 0)?)?.0;
        let output_size = u64::from_value(arg(args, 1)?)?;
        let flags = ConverterFlags::from_bits_truncate(u32::from_value(arg(args, 2)?)?);
        let output_size = usize::try_from(output_size).unwrap_or(usize::MAX);

        let reply: ConvertReply = match this.convert(&input, output_size, flags) {
            Ok(out) => Ok(out),
            Err(e) => match e.to_domain_error() {
                Some(domain) => Err(domain),
                None => return Err(e),
            },
        };
        Ok(Some(Boxed(reply).to_value()))
    });

    class.override_interface_vfunc(iface, "reset", |this: &T, _args| {
        this.reset();
        Ok(None)
    });
}

/// Wrapper for native `GConverter` implementations with no wrapper type of
/// their own.
#[derive(Debug)]
pub struct ConverterObject {
    parent: Object,
}

impl ConverterObject {
    /// The converter view of this object.
    ///
    /// # Errors
    ///
    /// [`Error::InterfaceNotImplemented`] if the wrapper is unbound.
    pub fn converter(&self) -> Result<Converter<'_>> {
        self.base().interface::<Converter>()
    }
}

impl ObjectImpl for ConverterObject {
    fn base(&self) -> &ObjectBase {
        self.parent.base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::construct;
    use crate::runtime::{Instance, TypeFlags};
    use crate::wrap::WrapperRegistry;
    use std::sync::Mutex;

    /// Emits at most two bytes per call and counts resets.
    #[derive(Default)]
    struct Chunker {
        parent: Object,
        resets: Mutex<u32>,
    }

    impl ObjectImpl for Chunker {
        fn base(&self) -> &ObjectBase {
            self.parent.base()
        }
    }

    impl CustomType for Chunker {
        const NAME: Option<&'static str> = Some("ConverterTestChunker");
        type Parent = Object;

        fn class_init(class: &mut ClassBuilder<Self>) {
            implement_converter(class);
        }
    }

    impl ConverterImpl for Chunker {
        fn convert(&self, input: &[u8], output_size: usize, flags: ConverterFlags) -> Result<ConvertOutput> {
            if input.contains(&0) {
                return Err(Error::Convert(crate::error::ConvertError::new(
                    crate::error::ConvertErrorEnum::EmbeddedNul,
                    "embedded nul",
                )));
            }
            let n = input.len().min(output_size).min(2);
            let result = if n == input.len() && flags.contains(ConverterFlags::INPUT_AT_END) {
                ConverterResult::Finished
            } else {
                ConverterResult::Converted
            };
            Ok(ConvertOutput::new(result, n, input[..n].to_vec()))
        }

        fn reset(&self) {
            *self.resets.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_rust_implementation() {
        let chunker = construct(Chunker::default()).unwrap();
        let converter = chunker.base().interface::<Converter>().unwrap();

        let out = converter.convert(b"abc", 8, ConverterFlags::empty()).unwrap();
        assert_eq!(out, ConvertOutput::new(ConverterResult::Converted, 2, b"ab".to_vec()));

        let out = converter.convert(b"c", 8, ConverterFlags::INPUT_AT_END).unwrap();
        assert_eq!(out.result, ConverterResult::Finished);

        converter.reset().unwrap();
        assert_eq!(*chunker.resets.lock().unwrap(), 1);
    }

    #[test]
    fn test_domain_error_crosses_vfunc() {
        let chunker = construct(Chunker::default()).unwrap();
        let converter = chunker.base().interface::<Converter>().unwrap();
        let err = converter.convert(b"a\0", 8, ConverterFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::Convert(ref e) if e.message == "embedded nul"));
    }

    #[test]
    fn test_default_convert_not_supported() {
        let iface = <Converter as IsInterface>::static_type();
        let type_ = Type::register_static(Type::OBJECT, "ConverterTestBare", TypeFlags::empty()).unwrap();
        type_.add_interface(iface).unwrap();

        let instance = Instance::new(type_).unwrap();
        // SAFETY: the instance reference is held for the whole test.
        let wrapped = unsafe { WrapperRegistry::global().wrap_interface(instance.as_ptr(), iface, true) }.unwrap();
        let object = wrapped.downcast_ref::<ConverterObject>().unwrap();
        let converter = object.converter().unwrap();

        let err = converter.convert(b"x", 1, ConverterFlags::empty()).unwrap_err();
        assert_eq!(err.code(), Some(IoErrorEnum::NotSupported as i32));
        converter.reset().unwrap();
    }
}

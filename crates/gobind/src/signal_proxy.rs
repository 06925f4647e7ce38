//! Typed signal proxies.
//!
//! A [`SignalProxy`] names one signal of one object and fixes the Rust
//! argument and return types its handlers see. Handlers are plain closures;
//! their argument tuple implements [`SignalArgs`] and their return type
//! implements [`SignalReturn`].
//!
//! Connecting checks the handler against the signal's registered signature.
//! A handler may take fewer arguments than the signal carries (the trailing
//! ones are dropped), but the ones it takes must match in order. Emission is
//! strict: the argument count must equal the signal's.

use crate::connection::{Connection, SlotFn, connect_raw};
use crate::error::{Error, Result};
use crate::object_base::ObjectBase;
use crate::runtime::signal::{self, SignalId};
use crate::runtime::{Type, Value};
use crate::value::ValueType;
use gobind_log::warn;
use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::Arc;

/// An argument tuple a handler can receive.
pub trait SignalArgs: Sized + 'static {
    /// Argument types, in order.
    fn types() -> Vec<Type>;

    /// Builds the tuple from the leading values.
    ///
    /// # Errors
    ///
    /// [`Error::SignalArgumentCount`] if there are too few values, or the
    /// conversion error of the first argument that does not convert.
    fn from_values(values: &[Value]) -> Result<Self>;

    /// Converts the tuple for emission.
    fn to_values(&self) -> Vec<Value>;
}

/// A handler return type.
pub trait SignalReturn: Sized + 'static {
    /// [`Type::NONE`] for handlers returning nothing.
    fn return_type() -> Type;

    /// The value written to the emission's return slot.
    fn into_value(self) -> Option<Value>;

    /// Reads the emission result.
    ///
    /// # Errors
    ///
    /// Conversion errors of the return type.
    fn from_return(value: Value) -> Result<Self>;
}

impl SignalReturn for () {
    fn return_type() -> Type {
        Type::NONE
    }

    fn into_value(self) -> Option<Value> {
        None
    }

    fn from_return(_: Value) -> Result<Self> {
        Ok(())
    }
}

impl<T: ValueType + 'static> SignalReturn for T {
    fn return_type() -> Type {
        T::static_type()
    }

    fn into_value(self) -> Option<Value> {
        Some(self.to_value())
    }

    fn from_return(value: Value) -> Result<Self> {
        T::from_value(&value)
    }
}

/// A handler callable with `Args`.
pub trait Slot<Args, R>: Send + Sync + 'static {
    /// Runs the handler.
    fn call(&self, args: Args) -> R;
}

fn arg(values: &[Value], index: usize, arity: usize) -> Result<&Value> {
    values.get(index).ok_or_else(|| Error::SignalArgumentCount {
        signal: String::new(),
        expected: arity,
        got: values.len(),
    })
}

impl SignalArgs for () {
    fn types() -> Vec<Type> {
        Vec::new()
    }

    fn from_values(_: &[Value]) -> Result<Self> {
        Ok(())
    }

    fn to_values(&self) -> Vec<Value> {
        Vec::new()
    }
}

impl<F, R> Slot<(), R> for F
where
    F: Fn() -> R + Send + Sync + 'static,
{
    fn call(&self, (): ()) -> R {
        self()
    }
}

macro_rules! tuple_signal_args {
    ($arity:expr; $($name:ident : $index:tt),+) => {
        impl<$($name: ValueType + 'static),+> SignalArgs for ($($name,)+) {
            fn types() -> Vec<Type> {
                vec![$($name::static_type()),+]
            }

            fn from_values(values: &[Value]) -> Result<Self> {
                Ok(($($name::from_value(arg(values, $index, $arity)?)?,)+))
            }

            fn to_values(&self) -> Vec<Value> {
                vec![$(self.$index.to_value()),+]
            }
        }

        impl<Func, Ret, $($name),+> Slot<($($name,)+), Ret> for Func
        where
            Func: Fn($($name),+) -> Ret + Send + Sync + 'static,
        {
            #[allow(non_snake_case)]
            fn call(&self, ($($name,)+): ($($name,)+)) -> Ret {
                self($($name),+)
            }
        }
    };
}

tuple_signal_args!(1; A: 0);
tuple_signal_args!(2; A: 0, B: 1);
tuple_signal_args!(3; A: 0, B: 1, C: 2);

fn check_signature<Args: SignalArgs, R: SignalReturn>(signal: SignalId) -> Result<()> {
    let params = signal.param_types();
    let wanted = Args::types();
    if wanted.len() > params.len() {
        return Err(Error::SignalArgumentCount {
            signal: signal.name().to_owned(),
            expected: params.len(),
            got: wanted.len(),
        });
    }

    for (index, (param, want)) in params.iter().zip(&wanted).enumerate() {
        if !param.is_a(*want) {
            return Err(Error::SignalArgumentType {
                signal: signal.name().to_owned(),
                index,
                expected: param.name().to_owned(),
                found: want.name().to_owned(),
            });
        }
    }

    let ret = R::return_type();
    if ret != Type::NONE && !signal.return_type().is_a(ret) {
        return Err(Error::ValueTypeMismatch {
            expected: signal.return_type().name().to_owned(),
            found: ret.name().to_owned(),
        });
    }
    Ok(())
}

/// One signal of one object, with typed handlers.
///
/// # Example
///
/// ```rust
/// use gobind::{Cancellable, ObjectImpl, SignalProxy};
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// let cancellable = Cancellable::new().unwrap();
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&fired);
///
/// let proxy: SignalProxy<'_, (), ()> = cancellable.base().signal("cancelled");
/// let conn = proxy.connect(move || flag.store(true, Ordering::SeqCst), false);
///
/// cancellable.cancel();
/// assert!(fired.load(Ordering::SeqCst));
/// assert!(conn.is_connected());
/// ```
pub struct SignalProxy<'a, Args, R = ()> {
    base: &'a ObjectBase,
    name: Cow<'a, str>,
    _marker: PhantomData<fn(Args) -> R>,
}

impl<'a, Args: SignalArgs, R: SignalReturn> SignalProxy<'a, Args, R> {
    /// Creates a proxy for a detailed signal name such as
    /// `"notify::label"`. The name is resolved on use.
    #[must_use]
    pub fn new(base: &'a ObjectBase, name: impl Into<Cow<'a, str>>) -> Self {
        SignalProxy {
            base,
            name: name.into(),
            _marker: PhantomData,
        }
    }

    /// The detailed signal name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The object emitting the signal.
    #[must_use]
    pub fn object(&self) -> &'a ObjectBase {
        self.base
    }

    fn connect_erased(&self, slot: Arc<SlotFn>, after: bool) -> Result<Connection> {
        let instance = self.base.instance();
        let (id, detail) = signal::parse_name(&self.name, instance.type_())?;
        check_signature::<Args, R>(id)?;
        Ok(connect_raw(&instance, id, detail, slot, after))
    }

    /// Connects a handler.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownSignal`] or [`Error::InvalidDetail`] for a bad
    ///   name
    /// - [`Error::SignalArgumentCount`] or [`Error::SignalArgumentType`] if
    ///   the handler's arguments do not match the signal's
    /// - [`Error::ValueTypeMismatch`] for an incompatible return type
    pub fn try_connect<F: Slot<Args, R>>(&self, slot: F, after: bool) -> Result<Connection> {
        let erased: Arc<SlotFn> = Arc::new(move |values: &[Value]| {
            let args = Args::from_values(values)?;
            Ok(slot.call(args).into_value())
        });
        self.connect_erased(erased, after)
    }

    /// Connects a handler, logging a warning and returning a disconnected
    /// [`Connection`] if [`SignalProxy::try_connect`] fails.
    ///
    /// # Arguments
    ///
    /// * `slot` - the handler
    /// * `after` - run after the class handler instead of before
    pub fn connect<F: Slot<Args, R>>(&self, slot: F, after: bool) -> Connection {
        match self.try_connect(slot, after) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("connect(): '{}': {}", self.name, e);
                Connection::disconnected()
            }
        }
    }

    /// Connects a handler that may fail.
    ///
    /// An `Err` from the handler crosses the native boundary like a panic
    /// does: it is reported to the registered exception handlers and the
    /// emission continues with the return slot untouched.
    ///
    /// # Errors
    ///
    /// Same as [`SignalProxy::try_connect`].
    pub fn connect_fallible<F: Slot<Args, Result<R>>>(&self, slot: F, after: bool) -> Result<Connection> {
        let erased: Arc<SlotFn> = Arc::new(move |values: &[Value]| {
            let args = Args::from_values(values)?;
            Ok(slot.call(args)?.into_value())
        });
        self.connect_erased(erased, after)
    }

    /// Emits the signal. Handlers have run when this returns.
    ///
    /// # Errors
    ///
    /// - name resolution errors as for [`SignalProxy::try_connect`]
    /// - [`Error::SignalArgumentCount`] or [`Error::SignalArgumentType`] if
    ///   `args` do not match exactly
    /// - conversion errors of the return value
    pub fn emit(&self, args: Args) -> Result<R> {
        let instance = self.base.instance();
        let values = args.to_values();
        // SAFETY: the instance reference is held for the emission.
        let ret = unsafe { signal::emit_by_name(instance.as_ptr(), &self.name, &values)? };
        R::from_return(ret)
    }

    /// Stops the emission in progress on this object. Handlers not yet
    /// run are skipped.
    pub fn emission_stop(&self) {
        let instance = self.base.instance();
        if let Err(e) = signal::stop_emission_by_name(&instance, &self.name) {
            warn!("emission_stop(): {}", e);
        }
    }
}

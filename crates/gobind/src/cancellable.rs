//! Cooperative cancellation.
//!
//! A [`Cancellable`] is a native `GCancellable` instance with a `cancelled`
//! signal. Long-running work polls [`Cancellable::is_cancelled`] or
//! [`Cancellable::set_error_if_cancelled`]; other code reacts through
//! [`Cancellable::connect`].

use crate::connection::Connection;
use crate::error::{Error, IoError, IoErrorEnum, Result, invariant_violation};
use crate::object::{IsObject, Object, ObjectImpl, RefPtr, bind_native};
use crate::object_base::ObjectBase;
use crate::runtime::signal::signal_new;
use crate::runtime::{Instance, SignalFlags, Type, TypeFlags};
use crate::signal_proxy::SignalProxy;
use gobind_log::debug;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

static CANCELLABLE_TYPE: OnceLock<Type> = OnceLock::new();

pub(crate) fn register_type() -> Type {
    *CANCELLABLE_TYPE.get_or_init(|| {
        let type_ = match Type::register_static(Type::OBJECT, "GCancellable", TypeFlags::empty()) {
            Ok(type_) => type_,
            Err(e) => invariant_violation(format_args!("cannot register GCancellable: {e}")),
        };
        if let Err(e) = signal_new("cancelled", type_, SignalFlags::RUN_LAST, &[], Type::NONE, None) {
            invariant_violation(format_args!("cannot register GCancellable::cancelled: {e}"));
        }
        type_
    })
}

pub(crate) fn cancellable_factory() -> Arc<dyn ObjectImpl> {
    Arc::new(Cancellable::detached())
}

/// A cancellation token.
///
/// # Thread Safety
///
/// [`Cancellable::cancel`] may be called from any thread. The `cancelled`
/// handlers run on the cancelling thread.
///
/// # Example
///
/// ```rust
/// use gobind::Cancellable;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// let cancellable = Cancellable::new().unwrap();
/// let seen = Arc::new(AtomicBool::new(false));
/// let s = Arc::clone(&seen);
/// let _connection = cancellable.connect(move || s.store(true, Ordering::SeqCst));
///
/// assert!(cancellable.set_error_if_cancelled().is_ok());
/// cancellable.cancel();
/// assert!(seen.load(Ordering::SeqCst));
/// assert!(cancellable.set_error_if_cancelled().is_err());
/// ```
pub struct Cancellable {
    parent: Object,
    /// Held while deciding whether a handler connects or runs at once.
    cancelled: Mutex<bool>,
}

impl Cancellable {
    fn detached() -> Self {
        Cancellable {
            parent: Object::uninit(),
            cancelled: Mutex::new(false),
        }
    }

    /// Creates a token that is not cancelled.
    ///
    /// # Errors
    ///
    /// Propagates instantiation errors.
    pub fn new() -> Result<RefPtr<Cancellable>> {
        crate::init();
        let instance = Instance::new(register_type())?;
        Ok(bind_native(Arc::new(Cancellable::detached()), instance))
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        match self.cancelled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns true once [`Cancellable::cancel`] has been called, until
    /// [`Cancellable::reset`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state()
    }

    /// Marks the token cancelled and emits `cancelled`. Only the first call
    /// since the last reset emits.
    pub fn cancel(&self) {
        {
            let mut cancelled = self.state();
            if *cancelled {
                return;
            }
            *cancelled = true;
        }
        debug!("cancellable {:p} cancelled", self.base().as_ptr());
        if let Err(e) = self.signal_cancelled().emit(()) {
            gobind_log::warn!("Cancellable::cancel(): {}", e);
        }
    }

    /// Makes the token reusable.
    pub fn reset(&self) {
        *self.state() = false;
    }

    /// Returns the I/O `Cancelled` error if the token is cancelled.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] with [`IoErrorEnum::Cancelled`].
    pub fn set_error_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Io(IoError::new(IoErrorEnum::Cancelled, "Operation was cancelled")));
        }
        Ok(())
    }

    /// Runs `f` on cancellation.
    ///
    /// If the token is already cancelled, `f` runs right away and the
    /// returned connection is disconnected.
    pub fn connect(&self, f: impl Fn() + Send + Sync + 'static) -> Connection {
        let cancelled = self.state();
        if *cancelled {
            drop(cancelled);
            f();
            return Connection::disconnected();
        }
        // Connected under the lock so a concurrent cancel() cannot emit
        // between the check and the connect.
        let connection = self.signal_cancelled().connect(f, false);
        drop(cancelled);
        connection
    }

    /// The `cancelled` signal.
    #[must_use]
    pub fn signal_cancelled(&self) -> SignalProxy<'_, (), ()> {
        self.base().signal("cancelled")
    }
}

impl ObjectImpl for Cancellable {
    fn base(&self) -> &ObjectBase {
        self.parent.base()
    }
}

impl IsObject for Cancellable {
    fn static_type() -> Type {
        crate::init();
        register_type()
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

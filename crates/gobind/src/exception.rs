//! Containment of failures raised inside native callbacks.
//!
//! Native code calls back into Rust through `extern "C"` trampolines
//! (signal handlers, vfuncs, main-context sources, dispatcher slots). Neither
//! a panic nor an `Err` may travel back through those frames, so every
//! trampoline runs its body inside [`catch_boundary`]. A caught failure is
//! handed to the thread's exception handlers:
//!
//! - handlers run in registration order; disconnected ones are dropped
//! - the first handler returning [`HandlerResult::Handled`] ends the walk
//! - a handler that panics replaces the failure with its own panic and the
//!   walk continues with the next handler
//!
//! When no handler claims the failure, a domain error is logged at critical
//! level and control returns to the native caller. Anything else (a binding
//! error, a panic) aborts the process: the native side may already be in an
//! inconsistent state.
//!
//! # Example
//!
//! ```rust
//! use gobind::exception::{add_exception_handler, catch_boundary, Failure, HandlerResult};
//! use gobind::{Error, IoError, IoErrorEnum};
//!
//! let handler = add_exception_handler(|failure: &Failure| {
//!     eprintln!("callback failed: {failure}");
//!     HandlerResult::Handled
//! });
//!
//! let result: Option<()> = catch_boundary(|| {
//!     Err(Error::Io(IoError::new(IoErrorEnum::NotFound, "missing")))
//! });
//! assert!(result.is_none());
//!
//! handler.disconnect();
//! ```

use crate::error::Error;
use gobind_log::{critical, error};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

static FATAL_CRITICALS: AtomicBool = AtomicBool::new(false);

/// Makes unclaimed domain errors abort like any other failure.
pub fn set_fatal_criticals(enabled: bool) {
    FATAL_CRITICALS.store(enabled, Ordering::Relaxed);
}

/// A failure caught at a callback boundary.
pub enum Failure {
    /// The callback returned an error.
    Error(Error),
    /// The callback panicked.
    Panic(Box<dyn Any + Send>),
}

impl Failure {
    /// The error, if the callback returned one.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match self {
            Failure::Error(e) => Some(e),
            Failure::Panic(_) => None,
        }
    }

    /// The panic message, if the callback panicked with a string payload.
    #[must_use]
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            Failure::Panic(payload) => payload
                .downcast_ref::<&'static str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str)),
            Failure::Error(_) => None,
        }
    }

    /// Returns true for errors with a `(domain, code)` pair.
    #[must_use]
    pub fn is_domain_error(&self) -> bool {
        self.error().is_some_and(Error::is_domain_error)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(e) => write!(f, "{e}"),
            Failure::Panic(_) => match self.panic_message() {
                Some(msg) => write!(f, "panic: {msg}"),
                None => f.write_str("panic with non-string payload"),
            },
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Failure::Panic(_) => f.debug_tuple("Panic").field(&self.panic_message()).finish(),
        }
    }
}

/// Outcome of one exception handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// The failure was dealt with; stop.
    Handled,
    /// Pass the failure to the next handler.
    Unhandled,
}

struct HandlerSlot {
    func: Box<dyn Fn(&Failure) -> HandlerResult>,
    alive: Cell<bool>,
}

/// Connection returned by [`ExceptionHandlers::add`].
///
/// Dropping it leaves the handler installed.
#[derive(Clone)]
pub struct HandlerConnection {
    slot: Weak<HandlerSlot>,
}

impl HandlerConnection {
    /// Removes the handler. It is dropped on the next invocation.
    pub fn disconnect(&self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.alive.set(false);
        }
    }

    /// Returns true while the handler is installed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.slot.upgrade().is_some_and(|s| s.alive.get())
    }
}

/// An ordered list of exception handlers.
///
/// Each thread has one (see [`add_exception_handler`]); independent lists can
/// be built for tests.
#[derive(Default)]
pub struct ExceptionHandlers {
    handlers: RefCell<Vec<Rc<HandlerSlot>>>,
}

impl ExceptionHandlers {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler.
    pub fn add(&self, func: impl Fn(&Failure) -> HandlerResult + 'static) -> HandlerConnection {
        let slot = Rc::new(HandlerSlot {
            func: Box::new(func),
            alive: Cell::new(true),
        });
        let conn = HandlerConnection {
            slot: Rc::downgrade(&slot),
        };
        self.handlers.borrow_mut().push(slot);
        conn
    }

    /// Number of connected handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.borrow().iter().filter(|h| h.alive.get()).count()
    }

    /// Returns true if no handler is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers `failure` to the handlers.
    ///
    /// Returns `Ok(())` if a handler claimed it, otherwise gives the
    /// (possibly replaced) failure back.
    pub fn invoke(&self, failure: Failure) -> Result<(), Failure> {
        // Handlers may add or remove handlers, so walk a snapshot.
        let snapshot = {
            let mut handlers = self.handlers.borrow_mut();
            handlers.retain(|h| h.alive.get());
            handlers.clone()
        };

        let mut failure = failure;
        for slot in snapshot {
            if !slot.alive.get() {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (slot.func)(&failure))) {
                Ok(HandlerResult::Handled) => return Ok(()),
                Ok(HandlerResult::Unhandled) => {}
                Err(payload) => failure = Failure::Panic(payload),
            }
        }
        Err(failure)
    }
}

thread_local! {
    static HANDLERS: ExceptionHandlers = ExceptionHandlers::new();
}

/// Installs a handler on the current thread's list.
pub fn add_exception_handler(
    func: impl Fn(&Failure) -> HandlerResult + 'static,
) -> HandlerConnection {
    HANDLERS.with(|handlers| handlers.add(func))
}

/// Runs the current thread's handlers on `failure`, applying the unclaimed
/// policy when none of them handles it.
pub fn exception_handlers_invoke(failure: Failure) {
    // The thread-local is gone during thread teardown; treat as unclaimed.
    let unclaimed = HANDLERS
        .try_with(|handlers| handlers.invoke(failure))
        .unwrap_or_else(|_| {
            error!("exception handlers unavailable during thread teardown");
            std::process::abort()
        });

    if let Err(failure) = unclaimed {
        handle_unclaimed(&failure);
    }
}

fn handle_unclaimed(failure: &Failure) {
    if failure.is_domain_error() && !FATAL_CRITICALS.load(Ordering::Relaxed) {
        critical!("unhandled exception in callback: {}", failure);
        return;
    }

    error!("unhandled exception in callback: {}", failure);
    std::process::abort();
}

/// Runs `f`, catching both `Err` results and panics.
///
/// Returns the value on success. A failure goes to
/// [`exception_handlers_invoke`] and `None` is returned, so the trampoline
/// can hand a neutral value back to native code.
pub fn catch_boundary<R>(f: impl FnOnce() -> crate::Result<R>) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            exception_handlers_invoke(Failure::Error(err));
            None
        }
        Err(payload) => {
            exception_handlers_invoke(Failure::Panic(payload));
            None
        }
    }
}

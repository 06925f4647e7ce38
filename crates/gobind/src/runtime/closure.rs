//! C-ABI callables: closures for signal handlers and vfunc slots.
//!
//! The runtime never sees Rust types. A callback is a marshal function plus
//! an opaque data pointer, and an optional destroy notify that the runtime
//! calls exactly once when it lets go of the data. Trampolines on the binding
//! side recover their Rust state from the data pointer.

use crate::runtime::instance::RawInstance;
use crate::runtime::value::Value;
use std::ffi::c_void;
use std::fmt;

/// Marshal function type shared by signal closures and vfuncs.
///
/// # Arguments
///
/// * `data` - the opaque pointer registered with the callable
/// * `instance` - the instance the call is made on
/// * `args` - pointer to `n_args` initialized values
/// * `ret` - initialized return slot, or null when the caller ignores the
///   return value
///
/// # Safety
///
/// Implementations must not unwind. Every binding-side trampoline wraps its
/// body in the exception boundary.
pub type MarshalFn = unsafe extern "C" fn(
    data: *const c_void,
    instance: *mut RawInstance,
    args: *const Value,
    n_args: usize,
    ret: *mut Value,
);

/// Called once when the runtime releases callback data.
pub type DestroyNotify = unsafe extern "C" fn(data: *const c_void);

/// A signal handler as the runtime stores it.
///
/// Closures are shared through `Arc`: an emission in flight holds a clone,
/// so disconnecting a handler from inside its own invocation is safe. The
/// destroy notify runs when the last clone is dropped.
pub struct Closure {
    marshal: MarshalFn,
    data: *const c_void,
    destroy: Option<DestroyNotify>,
}

impl Closure {
    /// Creates a closure.
    ///
    /// # Safety
    ///
    /// `data` must stay valid until `destroy` is called (or forever, when
    /// `destroy` is `None`) and must be safe to use from any thread.
    #[must_use]
    pub unsafe fn new(
        marshal: MarshalFn,
        data: *const c_void,
        destroy: Option<DestroyNotify>,
    ) -> Self {
        Closure {
            marshal,
            data,
            destroy,
        }
    }

    /// Invokes the closure.
    ///
    /// # Safety
    ///
    /// `instance` must point at a live instance for the duration of the call.
    pub unsafe fn invoke(&self, instance: *mut RawInstance, args: &[Value], ret: Option<&mut Value>) {
        let ret = ret.map_or(std::ptr::null_mut(), std::ptr::from_mut);
        // SAFETY: the caller guarantees instance; args and ret are valid for
        // the call.
        unsafe { (self.marshal)(self.data, instance, args.as_ptr(), args.len(), ret) }
    }

    /// Returns the data pointer.
    #[must_use]
    pub fn data(&self) -> *const c_void {
        self.data
    }
}

impl Drop for Closure {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy.take() {
            // SAFETY: destroy runs once, when the runtime releases the data.
            unsafe { destroy(self.data) }
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("marshal", &format!("{:p}", self.marshal as *const ()))
            .field("data", &self.data)
            .field("has_destroy", &self.destroy.is_some())
            .finish()
    }
}

// SAFETY: Closure::new requires data usable from any thread.
unsafe impl Send for Closure {}
// SAFETY: see above; the closure itself is immutable after construction.
unsafe impl Sync for Closure {}

/// A class or interface vtable slot.
///
/// Vtable data is permanent: slots are installed at class-init time and
/// never released.
#[derive(Clone, Copy)]
pub struct VFunc {
    /// Entry point.
    pub func: MarshalFn,
    /// Opaque slot data, null for plain native functions.
    pub data: *const c_void,
}

impl VFunc {
    /// A vfunc without data.
    #[must_use]
    pub const fn native(func: MarshalFn) -> Self {
        VFunc {
            func,
            data: std::ptr::null(),
        }
    }

    /// Calls the slot.
    ///
    /// # Safety
    ///
    /// `instance` must point at a live instance whose type resolved this
    /// slot.
    pub unsafe fn call(&self, instance: *mut RawInstance, args: &[Value], ret: Option<&mut Value>) {
        let ret = ret.map_or(std::ptr::null_mut(), std::ptr::from_mut);
        // SAFETY: forwarded from the caller.
        unsafe { (self.func)(self.data, instance, args.as_ptr(), args.len(), ret) }
    }
}

impl fmt::Debug for VFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VFunc({:p}, {:p})", self.func as *const (), self.data)
    }
}

// SAFETY: vfunc data is permanent and installed only with thread-safe state.
unsafe impl Send for VFunc {}
// SAFETY: see above.
unsafe impl Sync for VFunc {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_args(
        data: *const c_void,
        _instance: *mut RawInstance,
        _args: *const Value,
        n_args: usize,
        ret: *mut Value,
    ) {
        // SAFETY: the tests pass a &'static AtomicUsize as data.
        let counter = unsafe { &*data.cast::<AtomicUsize>() };
        counter.fetch_add(n_args, Ordering::SeqCst);
        if !ret.is_null() {
            // SAFETY: a non-null ret points at an initialized value.
            unsafe { *ret = Value::from_u64(n_args as u64) };
        }
    }

    unsafe extern "C" fn note_destroy(_data: *const c_void) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_closure_invoke_and_destroy_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let data = std::ptr::from_ref(&CALLS).cast::<c_void>();

        let closure = std::sync::Arc::new(unsafe { Closure::new(count_args, data, Some(note_destroy)) });
        let clone = std::sync::Arc::clone(&closure);

        let mut ret = Value::from_u64(0);
        unsafe {
            closure.invoke(std::ptr::null_mut(), &[Value::from_i32(1), Value::from_i32(2)], Some(&mut ret));
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(ret.get_u64(), Some(2));

        let before = DESTROYED.load(Ordering::SeqCst);
        drop(closure);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), before);
        drop(clone);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_vfunc_ignores_null_return() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let vfunc = VFunc {
            func: count_args,
            data: std::ptr::from_ref(&CALLS).cast(),
        };

        unsafe { vfunc.call(std::ptr::null_mut(), &[Value::from_bool(true)], None) };
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}

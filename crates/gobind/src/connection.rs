//! Connection nodes: the lifetime record of one signal subscription.
//!
//! # Architecture
//!
//! A [`ConnectionNode`] is shared between the native handler list and the
//! managed side:
//!
//! ```text
//!   native handler ──Arc<Closure>──> closure data ──strong──> ConnectionNode
//!   Connection ─────────────────────────────────────weak───────────┘
//! ```
//!
//! The node moves `UNCONNECTED → CONNECTED → DISCONNECTED`. Two things can
//! end a connection: [`Connection::disconnect`] on the managed side, and the
//! native side releasing the closure (handler removed or instance
//! disposed). Both go through [`ConnectionNode::teardown`], which swaps the
//! state to `DISCONNECTED`; only the caller that saw another state proceeds,
//! so the slot and its captured state are dropped exactly once and the
//! slot is never invoked after the swap.

use crate::error::Result;
use crate::exception::catch_boundary;
use crate::runtime::signal::{self, SignalId};
use crate::runtime::{Closure, Instance, RawInstance, Value};
use crate::value::coerce;
use gobind_mem::Quark;
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A type-erased signal slot.
pub(crate) type SlotFn = dyn Fn(&[Value]) -> Result<Option<Value>> + Send + Sync;

const UNCONNECTED: u8 = 0;
const CONNECTED: u8 = 1;
const DISCONNECTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownSource {
    Native,
    Managed,
}

/// One subscription shared by the native handler and its [`Connection`]s.
pub struct ConnectionNode {
    state: AtomicU8,
    handler_id: AtomicU64,
    instance: AtomicPtr<RawInstance>,
    slot: Mutex<Option<Arc<SlotFn>>>,
}

impl ConnectionNode {
    fn new(slot: Arc<SlotFn>) -> Self {
        ConnectionNode {
            state: AtomicU8::new(UNCONNECTED),
            handler_id: AtomicU64::new(0),
            instance: AtomicPtr::new(ptr::null_mut()),
            slot: Mutex::new(Some(slot)),
        }
    }

    fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == CONNECTED
    }

    /// Ends the connection. Returns false if it had already ended.
    fn teardown(&self, source: TeardownSource) -> bool {
        let previous = self.state.swap(DISCONNECTED, Ordering::AcqRel);
        if previous == DISCONNECTED {
            return false;
        }

        let instance = self.instance.swap(ptr::null_mut(), Ordering::AcqRel);
        let slot = match self.slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if source == TeardownSource::Managed && previous == CONNECTED && !instance.is_null() {
            // SAFETY: the pointer is cleared before the instance releases
            // its handlers, so a non-null pointer is still live.
            let instance = unsafe { &*instance };
            signal::handler_disconnect(instance, self.handler_id.load(Ordering::Acquire));
        }

        // Captured state is dropped with no lock held.
        drop(slot);
        true
    }

    fn invoke(&self, args: &[Value]) -> Result<Option<Value>> {
        if !self.is_connected() {
            return Ok(None);
        }
        let slot = match self.slot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match slot {
            Some(slot) => slot(args),
            None => Ok(None),
        }
    }

    fn with_instance(&self, f: impl FnOnce(&RawInstance, u64)) {
        if !self.is_connected() {
            return;
        }
        let instance = self.instance.load(Ordering::Acquire);
        if !instance.is_null() {
            // SAFETY: see teardown.
            f(unsafe { &*instance }, self.handler_id.load(Ordering::Acquire));
        }
    }
}

impl fmt::Debug for ConnectionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionNode")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("handler_id", &self.handler_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

unsafe extern "C" fn node_marshal(
    data: *const c_void,
    _instance: *mut RawInstance,
    args: *const Value,
    n_args: usize,
    ret: *mut Value,
) {
    // SAFETY: data is the node pointer leaked in connect_raw; the closure
    // holding it is alive while it is invoked.
    let node = unsafe { &*data.cast::<ConnectionNode>() };
    let args = if n_args == 0 {
        &[][..]
    } else {
        // SAFETY: the runtime passes n_args initialized values.
        unsafe { std::slice::from_raw_parts(args, n_args) }
    };
    // SAFETY: ret is null or an initialized return slot.
    let ret_type = unsafe { ret.as_ref() }.map(Value::type_);

    let result = catch_boundary(|| {
        let value = node.invoke(args)?;
        match (value, ret_type) {
            (Some(value), Some(type_)) => coerce(value, type_).map(Some),
            _ => Ok(None),
        }
    });

    if let Some(Some(value)) = result {
        // SAFETY: ret_type is Some, so ret is valid.
        unsafe { *ret = value };
    }
}

unsafe extern "C" fn node_destroy(data: *const c_void) {
    // SAFETY: balances the Arc::into_raw in connect_raw.
    let node = unsafe { Arc::from_raw(data.cast::<ConnectionNode>()) };
    node.teardown(TeardownSource::Native);
}

/// Connects a type-erased slot to a resolved signal.
pub(crate) fn connect_raw(
    instance: &Instance,
    signal: SignalId,
    detail: Option<Quark>,
    slot: Arc<SlotFn>,
    after: bool,
) -> Connection {
    let node = Arc::new(ConnectionNode::new(slot));
    node.instance.store(instance.as_ptr(), Ordering::Release);

    let data = Arc::into_raw(Arc::clone(&node)).cast::<c_void>();
    // SAFETY: node_destroy releases data exactly once; the node is Sync.
    let closure = unsafe { Closure::new(node_marshal, data, Some(node_destroy)) };
    let handler_id = signal::connect_closure_by_id(instance, signal, detail, Arc::new(closure), after);

    node.handler_id.store(handler_id, Ordering::Release);
    let _ = node
        .state
        .compare_exchange(UNCONNECTED, CONNECTED, Ordering::AcqRel, Ordering::Acquire);

    Connection {
        node: Arc::downgrade(&node),
    }
}

/// Managed handle of a signal subscription.
///
/// Dropping a `Connection` leaves the handler connected; use
/// [`ScopedConnection`] to disconnect on drop. Clones refer to the same
/// subscription.
#[derive(Clone, Default)]
pub struct Connection {
    node: Weak<ConnectionNode>,
}

impl Connection {
    /// A connection that was never connected.
    #[must_use]
    pub fn disconnected() -> Connection {
        Connection::default()
    }

    /// Disconnects the handler. Safe to call any number of times, before
    /// or after the instance is gone.
    pub fn disconnect(&self) {
        if let Some(node) = self.node.upgrade() {
            node.teardown(TeardownSource::Managed);
        }
    }

    /// Returns true until the connection ends on either side.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.node.upgrade().is_some_and(|node| node.is_connected())
    }

    /// Blocks the handler; blocks nest.
    pub fn block(&self) {
        if let Some(node) = self.node.upgrade() {
            node.with_instance(signal::handler_block);
        }
    }

    /// Undoes one [`Connection::block`].
    pub fn unblock(&self) {
        if let Some(node) = self.node.upgrade() {
            node.with_instance(signal::handler_unblock);
        }
    }

    /// The native handler id while connected.
    #[must_use]
    pub fn handler_id(&self) -> Option<u64> {
        self.node
            .upgrade()
            .filter(|node| node.is_connected())
            .map(|node| node.handler_id.load(Ordering::Acquire))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .field("handler_id", &self.handler_id())
            .finish()
    }
}

/// A [`Connection`] that disconnects when dropped.
#[derive(Debug, Default)]
pub struct ScopedConnection {
    connection: Connection,
}

impl ScopedConnection {
    /// Takes charge of `connection`.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        ScopedConnection { connection }
    }

    /// The managed connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Gives the connection back without disconnecting it.
    #[must_use]
    pub fn release(mut self) -> Connection {
        std::mem::take(&mut self.connection)
    }
}

impl From<Connection> for ScopedConnection {
    fn from(connection: Connection) -> Self {
        ScopedConnection::new(connection)
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Type;
    use crate::runtime::signal::{SignalFlags, signal_new};
    use crate::runtime::types::TypeFlags;
    use std::sync::atomic::AtomicUsize;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ping_type(name: &str) -> (Type, SignalId) {
        let type_ = Type::register_static(Type::OBJECT, name, TypeFlags::empty()).unwrap();
        let id = signal_new("ping", type_, SignalFlags::RUN_LAST, &[], Type::NONE, None).unwrap();
        (type_, id)
    }

    fn counting_slot(calls: &Arc<AtomicUsize>, drops: &Arc<AtomicUsize>) -> Arc<SlotFn> {
        let calls = Arc::clone(calls);
        let guard = DropCounter(Arc::clone(drops));
        Arc::new(move |_: &[Value]| {
            let _ = &guard;
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
    }

    #[test]
    fn test_disconnect_then_native_teardown() {
        let (type_, id) = ping_type("ConnTestA");
        let instance = Instance::new(type_).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));

        let conn = connect_raw(&instance, id, None, counting_slot(&calls, &drops), false);
        assert!(conn.is_connected());

        conn.disconnect();
        conn.disconnect();
        assert!(!conn.is_connected());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        unsafe { signal::emit(instance.as_ptr(), id, None, &[]).unwrap() };
        drop(instance);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_native_teardown_then_disconnect() {
        let (type_, id) = ping_type("ConnTestB");
        let instance = Instance::new(type_).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));

        let conn = connect_raw(&instance, id, None, counting_slot(&calls, &drops), false);
        unsafe { signal::emit(instance.as_ptr(), id, None, &[]).unwrap() };
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(instance);
        assert!(!conn.is_connected());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        conn.disconnect();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(conn.handler_id(), None);
    }

    #[test]
    fn test_scoped_connection_and_block() {
        let (type_, id) = ping_type("ConnTestC");
        let instance = Instance::new(type_).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));

        {
            let scoped = ScopedConnection::new(connect_raw(
                &instance,
                id,
                None,
                counting_slot(&calls, &drops),
                false,
            ));
            scoped.connection().block();
            unsafe { signal::emit(instance.as_ptr(), id, None, &[]).unwrap() };
            assert_eq!(calls.load(Ordering::SeqCst), 0);

            scoped.connection().unblock();
            unsafe { signal::emit(instance.as_ptr(), id, None, &[]).unwrap() };
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        unsafe { signal::emit(instance.as_ptr(), id, None, &[]).unwrap() };
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

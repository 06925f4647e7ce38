//! Cross-thread notification.
//!
//! A [`Dispatcher`] belongs to the thread running its [`MainContext`]. Its
//! slots run there, during [`MainContext::iteration`]. Other threads hold a
//! [`DispatchSender`], which can do exactly one thing: queue a notification.
//! No wrapper or slot is ever touched from the sending thread.
//!
//! Each [`DispatchSender::emit`] queues one notification, and each
//! notification runs every connected slot once, in connection order.

use crate::error::Result;
use crate::exception::catch_boundary;
use crate::main_context::{MainContext, Wakeup};
use crossbeam::channel::Sender;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

type DispatchFn = Box<dyn FnMut() -> Result<()>>;

struct DispatchSlot {
    id: u64,
    /// Taken while the slot runs.
    func: Option<DispatchFn>,
}

/// Slot list shared between a [`Dispatcher`] and its context.
pub(crate) struct DispatcherInner {
    slots: RefCell<Vec<DispatchSlot>>,
    next_slot: Cell<u64>,
}

impl DispatcherInner {
    /// Runs every slot connected when the notification is delivered.
    pub(crate) fn fire(&self) -> bool {
        let ids: Vec<u64> = self.slots.borrow().iter().map(|s| s.id).collect();
        for &id in &ids {
            let func = self
                .slots
                .borrow_mut()
                .iter_mut()
                .find(|s| s.id == id)
                .and_then(|s| s.func.take());
            let Some(mut func) = func else {
                continue;
            };

            catch_boundary(|| func());

            let mut slots = self.slots.borrow_mut();
            let finished = match slots.iter_mut().find(|s| s.id == id) {
                Some(slot) => {
                    slot.func = Some(func);
                    None
                }
                None => Some(func),
            };
            drop(slots);
            drop(finished);
        }
        !ids.is_empty()
    }
}

/// Identifies a slot connected to a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchSlotId(u64);

/// The receiving end of a cross-thread notification.
///
/// # Example
///
/// ```rust
/// use gobind::{Dispatcher, MainContext, MainLoop};
/// use std::thread;
///
/// let context = MainContext::new();
/// let main_loop = MainLoop::new(Some(&context));
/// let dispatcher = Dispatcher::with_context(&context);
///
/// let quit = main_loop.clone();
/// dispatcher.connect(move || quit.quit());
///
/// let sender = dispatcher.sender();
/// let worker = thread::spawn(move || assert!(sender.emit()));
///
/// main_loop.run();
/// worker.join().unwrap();
/// ```
pub struct Dispatcher {
    inner: Rc<DispatcherInner>,
    context: MainContext,
    id: u64,
    tx: Sender<Wakeup>,
}

impl Dispatcher {
    /// A dispatcher on the calling thread's default context.
    #[must_use]
    pub fn new() -> Self {
        Self::with_context(&MainContext::thread_default())
    }

    /// A dispatcher whose slots run in `context`.
    #[must_use]
    pub fn with_context(context: &MainContext) -> Self {
        let inner = Rc::new(DispatcherInner {
            slots: RefCell::new(Vec::new()),
            next_slot: Cell::new(1),
        });
        let id = context.register_dispatcher(Rc::downgrade(&inner));
        Dispatcher {
            inner,
            context: context.clone(),
            id,
            tx: context.sender(),
        }
    }

    /// Adds a slot.
    pub fn connect(&self, mut f: impl FnMut() + 'static) -> DispatchSlotId {
        self.connect_fallible(move || {
            f();
            Ok(())
        })
    }

    /// Adds a slot that can fail. Failures go to the exception handlers of
    /// the receiving thread.
    pub fn connect_fallible(&self, f: impl FnMut() -> Result<()> + 'static) -> DispatchSlotId {
        let id = self.inner.next_slot.get();
        self.inner.next_slot.set(id + 1);
        self.inner.slots.borrow_mut().push(DispatchSlot {
            id,
            func: Some(Box::new(f)),
        });
        DispatchSlotId(id)
    }

    /// Removes a slot. Returns false if it was not connected.
    pub fn disconnect(&self, id: DispatchSlotId) -> bool {
        let removed = {
            let mut slots = self.inner.slots.borrow_mut();
            let index = slots.iter().position(|s| s.id == id.0);
            index.map(|index| slots.remove(index))
        };
        removed.is_some()
    }

    /// Queues a notification from the receiving thread itself.
    pub fn emit(&self) {
        let _ = self.tx.send(Wakeup::Dispatch(self.id));
    }

    /// A handle other threads can notify through.
    #[must_use]
    pub fn sender(&self) -> DispatchSender {
        DispatchSender {
            id: self.id,
            tx: self.tx.clone(),
        }
    }

    /// The context the slots run in.
    #[must_use]
    pub fn context(&self) -> &MainContext {
        &self.context
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.context.unregister_dispatcher(self.id);
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("slots", &self.inner.slots.borrow().len())
            .finish()
    }
}

/// The sending end of a [`Dispatcher`].
///
/// # Thread Safety
///
/// `Send + Sync`; any number of threads may emit. Notifications for a
/// dispatcher that has been dropped are discarded by the receiving context.
#[derive(Clone)]
pub struct DispatchSender {
    id: u64,
    tx: Sender<Wakeup>,
}

impl DispatchSender {
    /// Queues one notification. Returns false if the receiving context no
    /// longer exists.
    pub fn emit(&self) -> bool {
        self.tx.send(Wakeup::Dispatch(self.id)).is_ok()
    }
}

impl fmt::Debug for DispatchSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchSender").field("id", &self.id).finish()
    }
}

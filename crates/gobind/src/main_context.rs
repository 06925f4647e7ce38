//! A single-threaded event loop.
//!
//! A [`MainContext`] owns idle and timeout sources and a wake-up queue.
//! [`MainContext::iteration`] runs everything that is ready once:
//!
//! 1. queued dispatcher notifications, in arrival order
//! 2. due timeouts, in creation order
//! 3. idle sources, in creation order
//!
//! Source callbacks run inside [`catch_boundary`]; a callback that fails is
//! reported to the exception handlers and its source is removed.
//!
//! The context is `!Send`. The only way in from another thread is the
//! wake-up queue, through a [`DispatchSender`](crate::DispatchSender).

use crate::dispatcher::DispatcherInner;
use crate::error::Result;
use crate::exception::catch_boundary;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use fxhash::FxHashMap;
use gobind_log::trace;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// Whether a source stays attached after its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Keep the source.
    Continue,
    /// Remove the source.
    Break,
}

/// Identifies a source within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

/// A source callback.
pub type SourceFn = Box<dyn FnMut() -> Result<ControlFlow>>;

/// A message on the wake-up queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    Dispatch(u64),
    Wake,
}

enum Trigger {
    Idle,
    Timeout { interval: Duration, deadline: Instant },
}

struct Source {
    trigger: Trigger,
    /// Taken while the callback runs.
    func: Option<SourceFn>,
}

struct ContextInner {
    sources: RefCell<BTreeMap<u64, Source>>,
    dispatchers: RefCell<FxHashMap<u64, Weak<DispatcherInner>>>,
    tx: Sender<Wakeup>,
    rx: Receiver<Wakeup>,
    next_id: Cell<u64>,
}

thread_local! {
    static THREAD_DEFAULT: RefCell<Option<MainContext>> = const { RefCell::new(None) };
}

/// An event loop context.
///
/// Clones refer to the same context.
///
/// # Example
///
/// ```rust
/// use gobind::{ControlFlow, MainContext};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let context = MainContext::new();
/// let runs = Rc::new(Cell::new(0));
/// let counter = Rc::clone(&runs);
/// context.idle_add(move || {
///     counter.set(counter.get() + 1);
///     if counter.get() == 2 { ControlFlow::Break } else { ControlFlow::Continue }
/// });
///
/// while context.iteration(false) {}
/// assert_eq!(runs.get(), 2);
/// assert!(!context.pending());
/// ```
#[derive(Clone)]
pub struct MainContext {
    inner: Rc<ContextInner>,
}

impl MainContext {
    /// Creates a context that is not any thread's default.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        MainContext {
            inner: Rc::new(ContextInner {
                sources: RefCell::new(BTreeMap::new()),
                dispatchers: RefCell::new(FxHashMap::default()),
                tx,
                rx,
                next_id: Cell::new(1),
            }),
        }
    }

    /// The calling thread's default context, created on first use.
    #[must_use]
    pub fn thread_default() -> Self {
        THREAD_DEFAULT.with(|slot| slot.borrow_mut().get_or_insert_with(MainContext::new).clone())
    }

    /// Returns true if both handles refer to the same context.
    #[must_use]
    pub fn ptr_eq(&self, other: &MainContext) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    fn attach(&self, trigger: Trigger, func: SourceFn) -> SourceId {
        let id = self.next_id();
        self.inner.sources.borrow_mut().insert(
            id,
            Source {
                trigger,
                func: Some(func),
            },
        );
        SourceId(id)
    }

    /// Runs `f` whenever the context has nothing more urgent to do.
    pub fn idle_add(&self, mut f: impl FnMut() -> ControlFlow + 'static) -> SourceId {
        self.attach(Trigger::Idle, Box::new(move || Ok(f())))
    }

    /// Like [`MainContext::idle_add`], for callbacks that can fail.
    pub fn idle_add_fallible(&self, f: impl FnMut() -> Result<ControlFlow> + 'static) -> SourceId {
        self.attach(Trigger::Idle, Box::new(f))
    }

    /// Runs `f` every `interval`, first after one interval has passed.
    pub fn timeout_add(&self, interval: Duration, mut f: impl FnMut() -> ControlFlow + 'static) -> SourceId {
        self.timeout_add_fallible(interval, move || Ok(f()))
    }

    /// Like [`MainContext::timeout_add`], for callbacks that can fail.
    pub fn timeout_add_fallible(
        &self,
        interval: Duration,
        f: impl FnMut() -> Result<ControlFlow> + 'static,
    ) -> SourceId {
        let trigger = Trigger::Timeout {
            interval,
            deadline: Instant::now() + interval,
        };
        self.attach(trigger, Box::new(f))
    }

    /// Removes a source. Returns false if it was already gone.
    ///
    /// A source may remove itself from its own callback.
    pub fn remove(&self, id: SourceId) -> bool {
        // Dropped after the table borrow ends: the callback may own values
        // whose drop reenters the context.
        let removed = self.inner.sources.borrow_mut().remove(&id.0);
        removed.is_some()
    }

    /// Wakes a blocked [`MainContext::iteration`].
    pub fn wakeup(&self) {
        let _ = self.inner.tx.send(Wakeup::Wake);
    }

    pub(crate) fn sender(&self) -> Sender<Wakeup> {
        self.inner.tx.clone()
    }

    pub(crate) fn register_dispatcher(&self, dispatcher: Weak<DispatcherInner>) -> u64 {
        let id = self.next_id();
        self.inner.dispatchers.borrow_mut().insert(id, dispatcher);
        id
    }

    pub(crate) fn unregister_dispatcher(&self, id: u64) {
        self.inner.dispatchers.borrow_mut().remove(&id);
    }

    /// Returns true if an iteration would dispatch something right now.
    #[must_use]
    pub fn pending(&self) -> bool {
        !self.inner.rx.is_empty() || !self.ready_sources(Instant::now()).is_empty()
    }

    fn drain(&self, into: &mut Vec<Wakeup>) {
        loop {
            match self.inner.rx.try_recv() {
                Ok(wakeup) => into.push(wakeup),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    fn ready_sources(&self, now: Instant) -> Vec<u64> {
        let sources = self.inner.sources.borrow();
        let runnable = |s: &&Source| s.func.is_some();

        let timeouts = sources.iter().filter(|(_, s)| {
            runnable(s) && matches!(s.trigger, Trigger::Timeout { deadline, .. } if deadline <= now)
        });
        let idles = sources
            .iter()
            .filter(|(_, s)| runnable(s) && matches!(s.trigger, Trigger::Idle));
        timeouts.chain(idles).map(|(id, _)| *id).collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .sources
            .borrow()
            .values()
            .filter_map(|s| match s.trigger {
                Trigger::Timeout { deadline, .. } if s.func.is_some() => Some(deadline),
                _ => None,
            })
            .min()
    }

    /// Runs one round of ready work.
    ///
    /// With `may_block`, waits until a timeout is due or a wake-up arrives
    /// when nothing is ready. Returns true if any callback ran.
    pub fn iteration(&self, may_block: bool) -> bool {
        let mut wakeups = Vec::new();
        self.drain(&mut wakeups);
        let mut ready = self.ready_sources(Instant::now());

        if may_block && wakeups.is_empty() && ready.is_empty() {
            let received = match self.next_deadline() {
                Some(deadline) => self
                    .inner
                    .rx
                    .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    .ok(),
                None => self.inner.rx.recv().ok(),
            };
            wakeups.extend(received);
            self.drain(&mut wakeups);
            ready = self.ready_sources(Instant::now());
        }

        let mut dispatched = false;
        for wakeup in wakeups {
            if let Wakeup::Dispatch(id) = wakeup {
                dispatched |= self.fire_dispatcher(id);
            }
        }
        for id in ready {
            dispatched |= self.dispatch_source(id);
        }
        dispatched
    }

    fn fire_dispatcher(&self, id: u64) -> bool {
        let target = self.inner.dispatchers.borrow().get(&id).and_then(Weak::upgrade);
        match target {
            Some(dispatcher) => dispatcher.fire(),
            None => {
                trace!("wake-up for dropped dispatcher {}", id);
                false
            }
        }
    }

    fn dispatch_source(&self, id: u64) -> bool {
        let func = self
            .inner
            .sources
            .borrow_mut()
            .get_mut(&id)
            .and_then(|s| s.func.take());
        let Some(mut func) = func else {
            return false;
        };

        let flow = catch_boundary(|| func()).unwrap_or(ControlFlow::Break);

        let finished = {
            let mut sources = self.inner.sources.borrow_mut();
            match (flow, sources.get_mut(&id)) {
                (ControlFlow::Continue, Some(source)) => {
                    if let Trigger::Timeout { interval, deadline } = &mut source.trigger {
                        *deadline = Instant::now() + *interval;
                    }
                    source.func = Some(func);
                    None
                }
                (_, Some(_)) => {
                    sources.remove(&id);
                    Some(func)
                }
                (_, None) => Some(func),
            }
        };
        // Captured state is dropped with the source table released.
        drop(finished);
        true
    }
}

impl Default for MainContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainContext")
            .field("sources", &self.inner.sources.borrow().len())
            .field("dispatchers", &self.inner.dispatchers.borrow().len())
            .finish()
    }
}

/// Runs a context until [`MainLoop::quit`].
#[derive(Clone)]
pub struct MainLoop {
    context: MainContext,
    running: Rc<Cell<bool>>,
}

impl MainLoop {
    /// A loop over `context`, or over the thread default.
    #[must_use]
    pub fn new(context: Option<&MainContext>) -> Self {
        MainLoop {
            context: context.cloned().unwrap_or_else(MainContext::thread_default),
            running: Rc::new(Cell::new(false)),
        }
    }

    /// The loop's context.
    #[must_use]
    pub fn context(&self) -> &MainContext {
        &self.context
    }

    /// Iterates until [`MainLoop::quit`] is called from a callback.
    pub fn run(&self) {
        self.running.set(true);
        while self.running.get() {
            self.context.iteration(true);
        }
    }

    /// Makes [`MainLoop::run`] return after the current iteration.
    pub fn quit(&self) {
        self.running.set(false);
        self.context.wakeup();
    }

    /// Returns true while [`MainLoop::run`] is looping.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }
}

impl fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoop")
            .field("running", &self.running.get())
            .finish()
    }
}

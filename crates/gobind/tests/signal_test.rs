//! Signal proxies, handler ordering and connection lifetime.

mod common;

use common::{Recorder, Widget};
use gobind::runtime::signal::handler_disconnect;
use gobind::runtime::{SignalFlags, Type};
use gobind::{
    ClassBuilder, Connection, CustomType, Error, Object, ObjectBase, ObjectImpl, ScopedConnection, SignalProxy, WeakRef,
    construct,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A handler counting its calls, and the drops of its captured state.
fn counting_handler(calls: &Arc<AtomicUsize>, drops: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    let guard = DropCounter(Arc::clone(drops));
    move || {
        let _ = &guard;
        calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Bell {
    parent: Object,
    log: Recorder,
}

impl ObjectImpl for Bell {
    fn base(&self) -> &ObjectBase {
        self.parent.base()
    }
}

impl CustomType for Bell {
    const NAME: Option<&'static str> = Some("SignalTestBell");
    type Parent = Object;

    fn class_init(class: &mut ClassBuilder<Self>) {
        class.signal_with_class_handler("ring", SignalFlags::RUN_LAST, &[], Type::NONE, |bell: &Bell, _| {
            bell.log.push("class");
            Ok(None)
        });
        class.signal("count", SignalFlags::RUN_LAST, &[Type::I32, Type::STRING], Type::I32);
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_default_handler_runs_before_after_handler() {
    let widget = construct(Widget::default()).unwrap();
    let log = Recorder::default();
    let proxy: SignalProxy<'_, (), ()> = widget.base().signal("activate");

    let l = log.clone();
    let _after = proxy.connect(move || l.push("after"), true);
    let l = log.clone();
    let _before = proxy.connect(move || l.push("default"), false);

    proxy.emit(()).unwrap();
    assert_eq!(log.events(), ["default", "after"]);
}

#[test]
fn test_class_handler_between_default_and_after() {
    let bell = construct(Bell::default()).unwrap();
    let proxy: SignalProxy<'_, (), ()> = bell.base().signal("ring");

    let l = bell.log.clone();
    let _a = proxy.connect(move || l.push("after"), true);
    let l = bell.log.clone();
    let _d = proxy.connect(move || l.push("default"), false);

    proxy.emit(()).unwrap();
    assert_eq!(bell.log.events(), ["default", "class", "after"]);
}

#[test]
fn test_emission_stop_skips_remaining_handlers() {
    let bell = construct(Bell::default()).unwrap();
    let weak = WeakRef::new(&bell);
    let proxy: SignalProxy<'_, (), ()> = bell.base().signal("ring");

    let l = bell.log.clone();
    let _first = proxy.connect(
        move || {
            l.push("first");
            if let Some(bell) = weak.upgrade() {
                bell.base().signal::<(), ()>("ring").emission_stop();
            }
        },
        false,
    );
    let l = bell.log.clone();
    let _second = proxy.connect(move || l.push("second"), false);

    proxy.emit(()).unwrap();
    assert_eq!(bell.log.events(), ["first"]);
}

// ============================================================================
// Arguments and return values
// ============================================================================

#[test]
fn test_arguments_and_return_value() {
    let bell = construct(Bell::default()).unwrap();
    let proxy: SignalProxy<'_, (i32, String), i32> = bell.base().signal("count");
    let _conn = proxy.connect(move |n: i32, label: String| n * 10 + label.len() as i32, false);

    assert_eq!(proxy.emit((4, "ab".to_owned())), Ok(42));
}

#[test]
fn test_handler_may_ignore_trailing_arguments() {
    let bell = construct(Bell::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let proxy: SignalProxy<'_, (i32,), i32> = bell.base().signal("count");
    let _conn = proxy.connect(
        move |n: i32| {
            s.lock().unwrap().push(n);
            n
        },
        false,
    );

    let full: SignalProxy<'_, (i32, String), i32> = bell.base().signal("count");
    assert_eq!(full.emit((7, String::new())), Ok(7));
    assert_eq!(*seen.lock().unwrap(), [7]);
}

#[test]
fn test_mismatched_handler_rejected() {
    let bell = construct(Bell::default()).unwrap();

    let wrong_type: SignalProxy<'_, (String,), i32> = bell.base().signal("count");
    assert!(matches!(
        wrong_type.try_connect(|_: String| 0, false),
        Err(Error::SignalArgumentType { index: 0, .. })
    ));

    let too_many: SignalProxy<'_, (i32, String, bool), i32> = bell.base().signal("count");
    assert!(matches!(
        too_many.try_connect(|_: i32, _: String, _: bool| 0, false),
        Err(Error::SignalArgumentCount { expected: 2, got: 3, .. })
    ));

    let partial: SignalProxy<'_, (i32,), i32> = bell.base().signal("count");
    assert!(matches!(partial.emit((1,)), Err(Error::SignalArgumentCount { .. })));
}

// ============================================================================
// Connection lifetime
// ============================================================================

#[test]
fn test_native_teardown_then_disconnect() {
    let widget = construct(Widget::default()).unwrap();
    let (calls, drops) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let proxy: SignalProxy<'_, (), ()> = widget.base().signal("activate");
    let conn = proxy.connect(counting_handler(&calls, &drops), false);

    let id = conn.handler_id().unwrap();
    assert!(handler_disconnect(&widget.instance(), id));
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(!conn.is_connected());

    conn.disconnect();
    proxy.emit(()).unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_disconnect_then_native_teardown() {
    let widget = construct(Widget::default()).unwrap();
    let (calls, drops) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let conn = widget
        .base()
        .signal::<(), ()>("activate")
        .connect(counting_handler(&calls, &drops), false);

    conn.disconnect();
    conn.disconnect();
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    widget.base().signal::<(), ()>("activate").emit(()).unwrap();
    drop(widget);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_instance_disposal_ends_connection() {
    let widget = construct(Widget::default()).unwrap();
    let (calls, drops) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let conn = widget
        .base()
        .signal::<(), ()>("activate")
        .connect(counting_handler(&calls, &drops), false);

    drop(widget);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(!conn.is_connected());
    conn.disconnect();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handler_disconnects_itself() {
    let widget = construct(Widget::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let own: Arc<Mutex<Connection>> = Arc::default();

    let (c, o) = (Arc::clone(&calls), Arc::clone(&own));
    let proxy: SignalProxy<'_, (), ()> = widget.base().signal("activate");
    *own.lock().unwrap() = proxy.connect(
        move || {
            c.fetch_add(1, Ordering::SeqCst);
            o.lock().unwrap().disconnect();
        },
        false,
    );

    proxy.emit(()).unwrap();
    proxy.emit(()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_scoped_connection_disconnects_on_drop() {
    let widget = construct(Widget::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let proxy: SignalProxy<'_, (), ()> = widget.base().signal("activate");

    {
        let _scoped = ScopedConnection::from(proxy.connect(counting_handler(&calls, &drops), false));
        proxy.emit(()).unwrap();
    }
    proxy.emit(()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_blocked_handler_skipped() {
    let widget = construct(Widget::default()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let proxy: SignalProxy<'_, (), ()> = widget.base().signal("activate");
    let conn = proxy.connect(counting_handler(&calls, &drops), false);

    conn.block();
    proxy.emit(()).unwrap();
    conn.unblock();
    proxy.emit(()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

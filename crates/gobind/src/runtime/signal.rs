//! Signals: named, typed event channels on instances.
//!
//! # Emission
//!
//! An emission runs in four phases, checking for a stop request between
//! every step:
//!
//! 1. the class handler, if the signal is `RUN_FIRST`
//! 2. handlers connected without `after`, in connection order
//! 3. the class handler, if the signal is `RUN_LAST`
//! 4. handlers connected with `after`, in connection order
//!
//! Each phase works on a snapshot of the handler list, but every handler is
//! re-checked right before it is invoked, so a handler disconnected or
//! blocked by an earlier one is not called. The instance lock is released
//! while handlers run.
//!
//! # Details
//!
//! `DETAILED` signals accept a `"name::detail"` suffix. A handler connected
//! with a detail only runs for emissions carrying the same detail; a handler
//! without one runs for all of them.

use crate::error::{Error, Result};
use crate::runtime::closure::Closure;
use crate::runtime::instance::{Emission, Handler, Instance, RawInstance, next_id};
use crate::runtime::param::{ParamSpec, canonical_name};
use crate::runtime::types::Type;
use crate::runtime::value::Value;
use bitflags::bitflags;
use fxhash::FxHashMap;
use gobind_log::warn;
use gobind_mem::{Quark, global_arena};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard};

bitflags! {
    /// Signal behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SignalFlags: u32 {
        /// Class handler runs before ordinary handlers.
        const RUN_FIRST = 1 << 0;
        /// Class handler runs after ordinary handlers, before `after` ones.
        const RUN_LAST = 1 << 1;
        /// Accepts a `::detail` suffix.
        const DETAILED = 1 << 4;
    }
}

/// Id of a registered signal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(u32);

struct SignalNode {
    name: &'static str,
    owner: Type,
    flags: SignalFlags,
    params: Vec<Type>,
    return_type: Type,
    class_handler: Option<Quark>,
}

struct SignalTable {
    nodes: Vec<&'static SignalNode>,
    by_owner: FxHashMap<(Type, &'static str), SignalId>,
}

impl SignalTable {
    fn insert(&mut self, node: SignalNode) -> SignalId {
        let node: &'static SignalNode = global_arena().alloc(node);
        let id = SignalId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.by_owner.insert((node.owner, node.name), id);
        id
    }
}

fn table() -> &'static RwLock<SignalTable> {
    static TABLE: OnceLock<RwLock<SignalTable>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = SignalTable {
            nodes: Vec::new(),
            by_owner: FxHashMap::default(),
        };
        table.insert(SignalNode {
            name: "notify",
            owner: Type::OBJECT,
            flags: SignalFlags::RUN_FIRST | SignalFlags::DETAILED,
            params: vec![Type::STRING],
            return_type: Type::NONE,
            class_handler: None,
        });
        RwLock::new(table)
    })
}

fn read_table() -> RwLockReadGuard<'static, SignalTable> {
    match table().read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SignalId {
    /// The built-in `notify` signal of every object.
    pub const NOTIFY: SignalId = SignalId(0);

    fn node(self) -> &'static SignalNode {
        let table = read_table();
        table.nodes.get(self.0 as usize).copied().unwrap_or(table.nodes[0])
    }

    /// Signal name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.node().name
    }

    /// Type the signal was registered on.
    #[must_use]
    pub fn owner(self) -> Type {
        self.node().owner
    }

    /// Behaviour flags.
    #[must_use]
    pub fn flags(self) -> SignalFlags {
        self.node().flags
    }

    /// Parameter types, excluding the instance.
    #[must_use]
    pub fn param_types(self) -> &'static [Type] {
        &self.node().params
    }

    /// Return type, [`Type::NONE`] for signals without one.
    #[must_use]
    pub fn return_type(self) -> Type {
        self.node().return_type
    }
}

impl fmt::Debug for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalId({}, {:?})", self.0, self.name())
    }
}

/// Registers a signal on `owner`.
///
/// # Arguments
///
/// * `name` - signal name; `_` is normalised to `-`
/// * `owner` - object or interface type
/// * `flags` - run phase and detail support
/// * `params` - argument types, excluding the instance
/// * `return_type` - [`Type::NONE`] for no return value
/// * `class_handler` - name of the vfunc run as class handler, looked up
///   on the emitting instance's type at emission time
///
/// # Errors
///
/// - [`Error::InvalidName`] for a malformed name
/// - [`Error::SignalAlreadyExists`] if `owner` already has the signal
pub fn signal_new(
    name: &str,
    owner: Type,
    flags: SignalFlags,
    params: &[Type],
    return_type: Type,
    class_handler: Option<&str>,
) -> Result<SignalId> {
    let name = canonical_name(name)?;

    let mut table = match table().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if table.by_owner.contains_key(&(owner, name.as_str())) {
        return Err(Error::SignalAlreadyExists {
            type_name: owner.name().to_owned(),
            signal: name,
        });
    }

    let id = table.insert(SignalNode {
        name: global_arena().alloc_str(&name),
        owner,
        flags,
        params: params.to_vec(),
        return_type,
        class_handler: class_handler.map(Quark::from_str),
    });
    drop(table);

    gobind_log::debug!("registered signal '{}::{}'", owner, name);
    Ok(id)
}

/// Finds a signal visible on `type_`: its own, its ancestors' and those of
/// the interfaces it implements.
#[must_use]
pub fn signal_lookup(name: &str, type_: Type) -> Option<SignalId> {
    let name = name.replace('_', "-");
    let table = read_table();
    let find = |t: Type| table.by_owner.get(&(t, name.as_str())).copied();

    if let Some(id) = type_.ancestors().find_map(find) {
        return Some(id);
    }
    if type_.is_interface() {
        return type_.prerequisites().into_iter().find_map(|p| p.ancestors().find_map(find));
    }
    type_.interfaces().into_iter().find_map(find)
}

/// Splits `"name::detail"` and resolves the signal on `type_`.
///
/// # Errors
///
/// - [`Error::UnknownSignal`] if no such signal is visible
/// - [`Error::InvalidDetail`] if a detail is given for a signal that is not
///   `DETAILED`
pub fn parse_name(detailed: &str, type_: Type) -> Result<(SignalId, Option<Quark>)> {
    let (name, detail) = match detailed.split_once("::") {
        Some((name, detail)) => (name, Some(detail)),
        None => (detailed, None),
    };

    let id = signal_lookup(name, type_).ok_or_else(|| Error::UnknownSignal {
        type_name: type_.name().to_owned(),
        signal: detailed.to_owned(),
    })?;

    match detail {
        None => Ok((id, None)),
        Some(_) if !id.flags().contains(SignalFlags::DETAILED) => Err(Error::InvalidDetail {
            signal: detailed.to_owned(),
        }),
        Some(detail) => Ok((id, Some(Quark::from_str(&detail.replace('_', "-"))))),
    }
}

/// Connects a closure to a detailed signal name.
///
/// Returns the handler id, unique for the process.
pub fn connect_closure(
    instance: &RawInstance,
    detailed: &str,
    closure: Arc<Closure>,
    after: bool,
) -> Result<u64> {
    let (id, detail) = parse_name(detailed, instance.type_())?;
    Ok(connect_closure_by_id(instance, id, detail, closure, after))
}

/// Connects a closure to a resolved signal.
pub fn connect_closure_by_id(
    instance: &RawInstance,
    signal: SignalId,
    detail: Option<Quark>,
    closure: Arc<Closure>,
    after: bool,
) -> u64 {
    let id = next_id();
    instance.state().handlers.push(Handler {
        id,
        signal,
        detail,
        closure,
        after,
        blocked: 0,
    });
    id
}

/// Disconnects a handler. The closure is released once no emission still
/// uses it.
///
/// Returns false, with a warning, if the instance has no such handler.
pub fn handler_disconnect(instance: &RawInstance, handler_id: u64) -> bool {
    let removed = {
        let mut state = instance.state();
        state
            .handlers
            .iter()
            .position(|h| h.id == handler_id)
            .map(|index| state.handlers.remove(index))
    };

    match removed {
        Some(handler) => {
            drop(handler);
            true
        }
        None => {
            warn!(
                "handler_disconnect(): instance of '{}' has no handler with id {}",
                instance.type_(),
                handler_id
            );
            false
        }
    }
}

/// Returns true if the handler is still connected.
#[must_use]
pub fn handler_is_connected(instance: &RawInstance, handler_id: u64) -> bool {
    instance.state().handlers.iter().any(|h| h.id == handler_id)
}

/// Blocks a handler; blocks nest.
pub fn handler_block(instance: &RawInstance, handler_id: u64) {
    if let Some(h) = instance.state().handlers.iter_mut().find(|h| h.id == handler_id) {
        h.blocked += 1;
    }
}

/// Undoes one [`handler_block`].
pub fn handler_unblock(instance: &RawInstance, handler_id: u64) {
    if let Some(h) = instance.state().handlers.iter_mut().find(|h| h.id == handler_id) {
        h.blocked = h.blocked.saturating_sub(1);
    }
}

fn validate_args(signal: SignalId, args: &[Value]) -> Result<()> {
    let params = signal.param_types();
    if params.len() != args.len() {
        return Err(Error::SignalArgumentCount {
            signal: signal.name().to_owned(),
            expected: params.len(),
            got: args.len(),
        });
    }

    for (index, (arg, param)) in args.iter().zip(params).enumerate() {
        let ok = arg.holds(*param)
            || arg
                .get_object()
                .is_some_and(|obj| obj.type_().is_a(*param));
        if !ok {
            return Err(Error::SignalArgumentType {
                signal: signal.name().to_owned(),
                index,
                expected: param.name().to_owned(),
                found: arg.type_().name().to_owned(),
            });
        }
    }
    Ok(())
}

/// Emits a signal by detailed name.
///
/// Returns the value written by the last handler that ran, or the return
/// type's default.
///
/// # Safety
///
/// `instance` must point at a live instance.
pub unsafe fn emit_by_name(instance: *mut RawInstance, detailed: &str, args: &[Value]) -> Result<Value> {
    // SAFETY: live per the contract.
    let (id, detail) = parse_name(detailed, unsafe { (*instance).type_() })?;
    // SAFETY: forwarded.
    unsafe { emit(instance, id, detail, args) }
}

/// Emits a resolved signal.
///
/// # Errors
///
/// [`Error::SignalArgumentCount`] or [`Error::SignalArgumentType`] if the
/// arguments do not match the signal's parameters.
///
/// # Safety
///
/// `instance` must point at a live instance.
pub unsafe fn emit(
    instance: *mut RawInstance,
    signal: SignalId,
    detail: Option<Quark>,
    args: &[Value],
) -> Result<Value> {
    validate_args(signal, args)?;
    // SAFETY: forwarded.
    Ok(unsafe { emit_unchecked(instance, signal, detail, args) })
}

pub(crate) fn emit_notify(instance: *mut RawInstance, spec: &ParamSpec) {
    let args = [Value::from_string(spec.name())];
    // SAFETY: called from a method on the live instance.
    unsafe { emit_unchecked(instance, SignalId::NOTIFY, Some(Quark::from_str(spec.name())), &args) };
}

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    Handlers { after: bool },
    Class,
}

unsafe fn emit_unchecked(
    instance: *mut RawInstance,
    signal: SignalId,
    detail: Option<Quark>,
    args: &[Value],
) -> Value {
    // Handlers may drop every other reference; keep the instance alive.
    // SAFETY: live per the contract.
    let guard = unsafe { Instance::from_raw_none(instance) };
    let node = signal.node();
    let mut ret = Value::new(node.return_type);
    let wants_ret = node.return_type != Type::NONE;

    guard.state().emissions.push(Emission {
        signal,
        stopped: false,
    });

    let mut phases = Vec::with_capacity(4);
    if node.flags.contains(SignalFlags::RUN_FIRST) {
        phases.push(Phase::Class);
    }
    phases.push(Phase::Handlers { after: false });
    if node.flags.contains(SignalFlags::RUN_LAST) {
        phases.push(Phase::Class);
    }
    phases.push(Phase::Handlers { after: true });

    'phases: for phase in phases {
        match phase {
            Phase::Class => {
                if is_stopped(&guard, signal) {
                    break 'phases;
                }
                let Some(name) = node.class_handler else {
                    continue;
                };
                let vfunc = if node.owner.is_interface() {
                    guard.type_().lookup_interface_vfunc(node.owner, name)
                } else {
                    guard.type_().lookup_vfunc(name)
                };
                if let Some(vfunc) = vfunc {
                    // SAFETY: the guard keeps the instance alive.
                    unsafe { vfunc.call(instance, args, wants_ret.then_some(&mut ret)) };
                }
            }
            Phase::Handlers { after } => {
                let snapshot: Vec<u64> = guard
                    .state()
                    .handlers
                    .iter()
                    .filter(|h| h.signal == signal && h.after == after)
                    .filter(|h| h.detail.is_none() || h.detail == detail)
                    .map(|h| h.id)
                    .collect();

                for handler_id in snapshot {
                    if is_stopped(&guard, signal) {
                        break 'phases;
                    }
                    let closure = guard
                        .state()
                        .handlers
                        .iter()
                        .find(|h| h.id == handler_id && h.blocked == 0)
                        .map(|h| Arc::clone(&h.closure));

                    if let Some(closure) = closure {
                        // SAFETY: the guard keeps the instance alive.
                        unsafe { closure.invoke(instance, args, wants_ret.then_some(&mut ret)) };
                    }
                }
            }
        }
    }

    {
        let mut state = guard.state();
        if let Some(index) = state.emissions.iter().rposition(|e| e.signal == signal) {
            state.emissions.remove(index);
        }
    }
    ret
}

fn is_stopped(instance: &RawInstance, signal: SignalId) -> bool {
    instance
        .state()
        .emissions
        .iter()
        .rev()
        .find(|e| e.signal == signal)
        .is_some_and(|e| e.stopped)
}

/// Stops the innermost in-flight emission of `signal` on `instance`.
///
/// Remaining handlers and phases of that emission are skipped. Logs a
/// warning if the signal is not being emitted.
pub fn stop_emission(instance: &RawInstance, signal: SignalId) {
    let found = {
        let mut state = instance.state();
        match state.emissions.iter_mut().rev().find(|e| e.signal == signal) {
            Some(emission) => {
                emission.stopped = true;
                true
            }
            None => false,
        }
    };

    if !found {
        warn!(
            "stop_emission(): no emission of signal '{}' to stop on instance of '{}'",
            signal.name(),
            instance.type_()
        );
    }
}

/// Stops an emission by detailed name.
///
/// # Errors
///
/// Same as [`parse_name`].
pub fn stop_emission_by_name(instance: &RawInstance, detailed: &str) -> Result<()> {
    let (id, _) = parse_name(detailed, instance.type_())?;
    stop_emission(instance, id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::closure::VFunc;
    use crate::runtime::param::ParamFlags;
    use crate::runtime::types::TypeFlags;
    use std::ffi::c_void;
    use std::sync::Mutex;

    struct Log(Mutex<Vec<String>>);

    unsafe extern "C" fn record(
        data: *const c_void,
        _instance: *mut RawInstance,
        args: *const Value,
        n_args: usize,
        _ret: *mut Value,
    ) {
        // SAFETY: tests pass (&'static Log, &'static str) pairs as data.
        let (log, tag) = unsafe { &*data.cast::<(&'static Log, &'static str)>() };
        // SAFETY: args points at n_args values.
        let args = unsafe { std::slice::from_raw_parts(args, n_args) };
        let arg = args.first().and_then(Value::get_string).unwrap_or("");
        log.0.lock().unwrap().push(format!("{tag}:{arg}"));
    }

    fn leak_closure(log: &'static Log, tag: &'static str) -> Arc<Closure> {
        let data: &'static (&'static Log, &'static str) = Box::leak(Box::new((log, tag)));
        Arc::new(unsafe { Closure::new(record, std::ptr::from_ref(data).cast(), None) })
    }

    fn leak_log() -> &'static Log {
        Box::leak(Box::new(Log(Mutex::new(Vec::new()))))
    }

    #[test]
    fn test_phase_order() {
        let t = Type::register_static(Type::OBJECT, "SignalTestOrder", TypeFlags::empty()).unwrap();
        let id = signal_new("changed", t, SignalFlags::RUN_LAST, &[Type::STRING], Type::NONE, Some("changed")).unwrap();

        let log = leak_log();
        let data: &'static (&'static Log, &'static str) = Box::leak(Box::new((log, "class")));
        t.override_vfunc("changed", VFunc { func: record, data: std::ptr::from_ref(data).cast() });

        let obj = Instance::new(t).unwrap();
        connect_closure(&obj, "changed", leak_closure(log, "after"), true).unwrap();
        connect_closure(&obj, "changed", leak_closure(log, "first"), false).unwrap();
        connect_closure(&obj, "changed", leak_closure(log, "second"), false).unwrap();

        unsafe { emit(obj.as_ptr(), id, None, &[Value::from_string("x")]).unwrap() };
        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["first:x", "second:x", "class:x", "after:x"]
        );
    }

    #[test]
    fn test_detail_filtering() {
        let t = Type::register_static(Type::OBJECT, "SignalTestDetail", TypeFlags::empty()).unwrap();
        t.install_property(ParamSpec::new("a", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).unwrap()).unwrap();
        t.install_property(ParamSpec::new("b", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).unwrap()).unwrap();

        let log = leak_log();
        let obj = Instance::new(t).unwrap();
        connect_closure(&obj, "notify::a", leak_closure(log, "a"), false).unwrap();
        connect_closure(&obj, "notify", leak_closure(log, "any"), false).unwrap();

        obj.set_property("a", Value::from_i32(1)).unwrap();
        obj.set_property("b", Value::from_i32(1)).unwrap();
        assert_eq!(*log.0.lock().unwrap(), vec!["a:a", "any:a", "any:b"]);
    }

    #[test]
    fn test_detail_rejected_on_plain_signal() {
        let t = Type::register_static(Type::OBJECT, "SignalTestPlain", TypeFlags::empty()).unwrap();
        signal_new("ping", t, SignalFlags::RUN_LAST, &[], Type::NONE, None).unwrap();

        assert!(matches!(parse_name("ping::x", t), Err(Error::InvalidDetail { .. })));
        assert!(matches!(parse_name("pong", t), Err(Error::UnknownSignal { .. })));
        assert!(parse_name("notify::anything", t).is_ok());
    }

    #[test]
    fn test_argument_validation() {
        let t = Type::register_static(Type::OBJECT, "SignalTestArgs", TypeFlags::empty()).unwrap();
        let id = signal_new("sized", t, SignalFlags::RUN_LAST, &[Type::I32], Type::NONE, None).unwrap();
        let obj = Instance::new(t).unwrap();

        assert!(matches!(
            unsafe { emit(obj.as_ptr(), id, None, &[]) },
            Err(Error::SignalArgumentCount { expected: 1, got: 0, .. })
        ));
        assert!(matches!(
            unsafe { emit(obj.as_ptr(), id, None, &[Value::from_string("x")]) },
            Err(Error::SignalArgumentType { index: 0, .. })
        ));
    }

    #[test]
    fn test_block_and_disconnect() {
        let t = Type::register_static(Type::OBJECT, "SignalTestBlock", TypeFlags::empty()).unwrap();
        signal_new("tick", t, SignalFlags::RUN_LAST, &[Type::STRING], Type::NONE, None).unwrap();

        let log = leak_log();
        let obj = Instance::new(t).unwrap();
        let handler = connect_closure(&obj, "tick", leak_closure(log, "h"), false).unwrap();

        handler_block(&obj, handler);
        unsafe { emit_by_name(obj.as_ptr(), "tick", &[Value::from_string("1")]).unwrap() };
        handler_unblock(&obj, handler);
        unsafe { emit_by_name(obj.as_ptr(), "tick", &[Value::from_string("2")]).unwrap() };

        assert!(handler_disconnect(&obj, handler));
        assert!(!handler_is_connected(&obj, handler));
        unsafe { emit_by_name(obj.as_ptr(), "tick", &[Value::from_string("3")]).unwrap() };

        assert_eq!(*log.0.lock().unwrap(), vec!["h:2"]);

        let (removed, records) = gobind_log::capture(|| handler_disconnect(&obj, handler));
        assert!(!removed);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_stop_without_emission_warns() {
        let obj = Instance::new(Type::OBJECT).unwrap();
        let ((), records) = gobind_log::capture(|| stop_emission(&obj, SignalId::NOTIFY));
        assert_eq!(records.len(), 1);
        assert!(records[0].message.contains("no emission"));
    }
}

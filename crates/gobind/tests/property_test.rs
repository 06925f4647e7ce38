//! Property proxy behaviour against live native instances.

mod common;

use common::{INITIAL_VALUE, Widget};
use gobind::converter::{Converter, ConverterFlags};
use gobind::runtime::Type;
use gobind::{
    ClassBuilder, CustomType, Error, Object, ObjectBase, ObjectImpl, ParamFlags, ParamSpec, Value, ValueType, construct,
};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct AllTypes {
    parent: Object,
}

impl ObjectImpl for AllTypes {
    fn base(&self) -> &ObjectBase {
        self.parent.base()
    }
}

impl CustomType for AllTypes {
    const NAME: Option<&'static str> = Some("PropertyTestAllTypes");
    type Parent = Object;

    fn class_init(class: &mut ClassBuilder<Self>) {
        let specs = [
            ("flag", Type::BOOL, Value::from_bool(false)),
            ("int", Type::I32, Value::from_i32(0)),
            ("uint", Type::U32, Value::from_u32(0)),
            ("long", Type::I64, Value::from_i64(0)),
            ("ulong", Type::U64, Value::from_u64(0)),
            ("float", Type::F32, Value::from_f32(0.0)),
            ("double", Type::F64, Value::from_f64(0.0)),
            ("text", Type::STRING, Value::from_string("")),
        ];
        for (name, type_, default) in specs {
            class.property(ParamSpec::new(name, type_, default, ParamFlags::READWRITE).unwrap());
        }
        class.property(ParamSpec::new("secret", Type::I32, Value::from_i32(0), ParamFlags::WRITABLE).unwrap());
        class.property(ParamSpec::new("version", Type::I32, Value::from_i32(3), ParamFlags::READABLE).unwrap());
    }
}

fn roundtrip<T: ValueType + PartialEq + Debug + Clone>(base: &ObjectBase, name: &str, values: &[T]) {
    let proxy = base.property::<T>(name);
    for value in values {
        proxy.set_value(value.clone()).unwrap();
        assert_eq!(&proxy.get_value().unwrap(), value, "property '{name}'");
    }
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_roundtrip_fundamental_types() {
    let obj = construct(AllTypes::default()).unwrap();
    let base = obj.base();

    roundtrip(base, "flag", &[true, false]);
    roundtrip(base, "int", &[0, -1, i32::MIN, i32::MAX]);
    roundtrip(base, "uint", &[0, 7, u32::MAX]);
    roundtrip(base, "long", &[i64::MIN, 0, i64::MAX]);
    roundtrip(base, "ulong", &[0, u64::MAX]);
    roundtrip(base, "float", &[0.5f32, -1.25, f32::MAX]);
    roundtrip(base, "double", &[std::f64::consts::PI, -0.0, f64::MIN_POSITIVE]);
    roundtrip(
        base,
        "text",
        &[String::new(), "ascii".to_owned(), "ünïcödé ✓".to_owned()],
    );
}

#[test]
fn test_reset_restores_default() {
    let obj = construct(AllTypes::default()).unwrap();
    let int = obj.base().property::<i32>("int");
    int.set_value(42).unwrap();
    int.reset_value().unwrap();
    assert_eq!(int.get_value(), Ok(0));
}

// ============================================================================
// Access and type checks
// ============================================================================

#[test]
fn test_access_flags_enforced() {
    let obj = construct(AllTypes::default()).unwrap();

    assert!(matches!(
        obj.base().property::<i32>("secret").get_value(),
        Err(Error::PropertyNotReadable { .. })
    ));
    obj.base().property_write_only::<i32>("secret").set_value(1).unwrap();

    assert!(matches!(
        obj.base().property::<i32>("version").set_value(4),
        Err(Error::PropertyNotWritable { .. })
    ));
    assert_eq!(obj.base().property_read_only::<i32>("version").get_value(), Ok(3));
}

#[test]
fn test_wrong_type_and_unknown_name() {
    let obj = construct(AllTypes::default()).unwrap();

    let err = obj.base().property::<String>("int").get_value().unwrap_err();
    assert!(matches!(err, Error::PropertyTypeMismatch { .. }));

    let err = obj.base().property::<i32>("missing").get_value().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Object type 'PropertyTestAllTypes' has no property named 'missing'"
    );
}

// ============================================================================
// Custom subtype with an interface (end-to-end)
// ============================================================================

#[test]
fn test_custom_subtype_end_to_end() {
    let widget = construct(Widget::default()).unwrap();
    let prop = widget.base().property::<String>("custom-prop");

    assert_eq!(prop.get_value().unwrap(), INITIAL_VALUE);

    prop.set_value("X".to_owned()).unwrap();
    assert_eq!(prop.get_value().unwrap(), "X");

    // A native-side write is visible through the proxy: nothing is cached.
    widget
        .instance()
        .set_property("custom-prop", Value::from_string("native"))
        .unwrap();
    assert_eq!(prop.get_value().unwrap(), "native");

    let converter = widget.base().interface::<Converter>().unwrap();
    let out = converter.convert(b"bytes", 3, ConverterFlags::empty()).unwrap();
    assert_eq!(out.output, b"byt");
    assert_eq!(widget.base().type_name(), "TestWidget");
}

// ============================================================================
// Change notification
// ============================================================================

#[test]
fn test_frozen_notifications_coalesce() {
    let widget = construct(Widget::default()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let _conn = widget.base().connect_property_changed("level", move || {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let level = widget.base().property::<i32>("level");
    widget.base().freeze_notify();
    level.set_value(1).unwrap();
    level.set_value(2).unwrap();
    level.set_value(3).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);

    widget.base().thaw_notify();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(level.get_value(), Ok(3));
}

#[test]
fn test_detail_filters_notifications() {
    let widget = construct(Widget::default()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let _conn = widget
        .base()
        .property::<bool>("enabled")
        .signal_changed()
        .connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, false);

    widget.base().property::<i32>("level").set_value(5).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
    widget.base().property::<bool>("enabled").set_value(true).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

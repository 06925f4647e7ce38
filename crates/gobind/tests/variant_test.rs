//! Typed variants, alone and carried through properties.

use gobind::runtime::Type;
use gobind::{
    ClassBuilder, CustomType, DictEntry, Error, Object, ObjectBase, ObjectImpl, ObjectPath, ParamFlags, ParamSpec,
    Value, Variant, VariantBase, construct,
};
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Settings {
    parent: Object,
}

impl ObjectImpl for Settings {
    fn base(&self) -> &ObjectBase {
        self.parent.base()
    }
}

impl CustomType for Settings {
    const NAME: Option<&'static str> = Some("VariantTestSettings");
    type Parent = Object;

    fn class_init(class: &mut ClassBuilder<Self>) {
        let default: BTreeMap<String, VariantBase> = BTreeMap::new();
        let default = Variant::create(&default).into_base();
        class.property(
            ParamSpec::new(
                "options",
                Type::VARIANT,
                Value::from_variant(Some(default.into_raw())),
                ParamFlags::READWRITE,
            )
            .unwrap(),
        );
    }
}

fn boxed<T: gobind::VariantKind>(value: T) -> VariantBase {
    Variant::create(&value).into_base()
}

// ============================================================================
// Checked casts
// ============================================================================

#[test]
fn test_cast_dynamic_accepts_matching_signature() {
    let base = boxed(vec![(1i32, "one".to_owned()), (2, "two".to_owned())]);
    assert_eq!(base.type_string(), "a(is)");
    assert!(base.is_of_type::<Vec<(i32, String)>>());

    let typed = base.cast_dynamic::<Vec<(i32, String)>>().unwrap();
    assert_eq!(typed.get()[1], (2, "two".to_owned()));
}

#[test]
fn test_cast_dynamic_mismatch_reports_types() {
    let base = boxed(42u32);

    let err = base.cast_dynamic::<String>().unwrap_err();
    assert_eq!(
        err,
        Error::VariantTypeMismatch {
            expected: "s".to_owned(),
            found: "u".to_owned(),
        }
    );
    assert_eq!(err.to_string(), "Variant type mismatch: expected 's', found 'u'");
    assert!(base.cast_dynamic::<i32>().is_err());
}

#[test]
fn test_object_path_reads_as_string() {
    let path = boxed(ObjectPath::new("/org/example/Widget").unwrap());
    assert_eq!(path.type_string(), "o");
    assert_eq!(path.cast_dynamic::<String>().unwrap().get(), "/org/example/Widget");
}

#[test]
fn test_string_does_not_cast_to_object_path() {
    let text = boxed("not a path".to_owned());
    assert!(matches!(
        text.cast_dynamic::<ObjectPath>(),
        Err(Error::VariantTypeMismatch { found, .. }) if found == "s"
    ));
}

// ============================================================================
// Containers
// ============================================================================

#[test]
fn test_nested_containers() {
    let mut inner = BTreeMap::new();
    inner.insert("depth".to_owned(), vec![Some(1i64), None, Some(3)]);
    let outer = vec![inner.clone(), BTreeMap::new()];

    let base = boxed(outer.clone());
    assert_eq!(base.type_string(), "aa{samx}");
    assert_eq!(base.n_children(), 2);

    let first = base.get_child(0).unwrap();
    assert_eq!(first.cast_dynamic::<BTreeMap<String, Vec<Option<i64>>>>().unwrap().get(), inner);
    assert_eq!(base.cast_dynamic::<Vec<BTreeMap<String, Vec<Option<i64>>>>>().unwrap().get(), outer);
}

#[test]
fn test_boxed_variants_keep_inner_type() {
    let mut map = HashMap::new();
    map.insert("name".to_owned(), boxed("gobind".to_owned()));
    map.insert("size".to_owned(), boxed(7u64));

    let dict = Variant::create(&map);
    assert_eq!(dict.type_string(), "a{sv}");

    let size = dict.lookup(&"size".to_owned()).unwrap();
    assert_eq!(size.cast_dynamic::<u64>().unwrap().get(), 7);
    assert!(size.cast_dynamic::<String>().is_err());
    assert_eq!(dict.lookup(&"missing".to_owned()), None);
}

#[test]
fn test_untyped_lookup_checks_value_type() {
    let entries = vec![DictEntry {
        key: 1u32,
        value: "one".to_owned(),
    }];
    let base = boxed(entries);

    assert_eq!(base.lookup::<u32, String>(&1).unwrap(), Some("one".to_owned()));
    assert_eq!(base.lookup::<u32, String>(&2).unwrap(), None);
    assert!(matches!(
        base.lookup::<u32, i32>(&1),
        Err(Error::VariantTypeMismatch { .. })
    ));
}

// ============================================================================
// Through properties
// ============================================================================

#[test]
fn test_variant_property_round_trip() {
    let settings = construct(Settings::default()).unwrap();
    let options = settings.base().property::<Variant<BTreeMap<String, VariantBase>>>("options");

    assert!(options.get_value().unwrap().get().is_empty());

    let mut map = BTreeMap::new();
    map.insert("dark".to_owned(), boxed(true));
    options.set_value(Variant::create(&map)).unwrap();

    let read = options.get_value().unwrap();
    let dark = read.lookup(&"dark".to_owned()).unwrap();
    assert!(dark.cast_dynamic::<bool>().unwrap().get());
}

#[test]
fn test_variant_property_of_other_shape_is_rejected_on_read() {
    let settings = construct(Settings::default()).unwrap();
    settings
        .base()
        .property::<VariantBase>("options")
        .set_value(boxed(vec![1u8, 2, 3]))
        .unwrap();

    let typed = settings.base().property::<Variant<BTreeMap<String, VariantBase>>>("options");
    assert!(matches!(
        typed.get_value(),
        Err(Error::VariantTypeMismatch { found, .. }) if found == "ay"
    ));
}

// Shared fixtures for the gobind integration tests.
//
// `Widget` is a custom type with one string property, one signal and a
// `GConverter` implementation; most scenarios run against it.

#![allow(dead_code)]

use gobind::converter::{ConvertOutput, ConverterFlags, ConverterImpl, ConverterResult, implement_converter};
use gobind::runtime::{SignalFlags, Type};
use gobind::{ClassBuilder, CustomType, Object, ObjectBase, ObjectImpl, ParamFlags, ParamSpec, Result, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const INITIAL_VALUE: &str = "Initial value.";

#[derive(Default)]
pub struct Widget {
    parent: Object,
}

impl ObjectImpl for Widget {
    fn base(&self) -> &ObjectBase {
        self.parent.base()
    }
}

impl CustomType for Widget {
    const NAME: Option<&'static str> = Some("TestWidget");
    type Parent = Object;

    fn class_init(class: &mut ClassBuilder<Self>) {
        class.property(
            ParamSpec::new(
                "custom-prop",
                Type::STRING,
                Value::from_string(INITIAL_VALUE),
                ParamFlags::READWRITE,
            )
            .expect("valid property"),
        );
        class.property(ParamSpec::new("level", Type::I32, Value::from_i32(0), ParamFlags::READWRITE).expect("valid property"));
        class.property(ParamSpec::new("enabled", Type::BOOL, Value::from_bool(false), ParamFlags::READWRITE).expect("valid property"));
        class.signal("activate", SignalFlags::RUN_LAST, &[], Type::NONE);
        class.signal("value-changed", SignalFlags::RUN_LAST, &[Type::I32], Type::NONE);
        implement_converter(class);
    }
}

impl ConverterImpl for Widget {
    fn convert(&self, input: &[u8], output_size: usize, _flags: ConverterFlags) -> Result<ConvertOutput> {
        let n = input.len().min(output_size);
        Ok(ConvertOutput::new(ConverterResult::Converted, n, input[..n].to_vec()))
    }
}

/// Ordered log shared between handlers.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

/// Unique type names for tests that register types of their own.
pub fn unique_name(prefix: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("{prefix}{}", NEXT.fetch_add(1, Ordering::SeqCst))
}

//! Process-wide initialization.

use crate::config::RuntimeConfig;
use crate::error::register_builtin_domains;
use crate::object::object_factory;
use crate::runtime::Type;
use crate::wrap::register_wrapped_type;
use crate::{binding, cancellable, converter};
use gobind_log::debug;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

static INIT: Once = Once::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Prepares the binding layer.
///
/// Applies [`RuntimeConfig::from_env`], registers the built-in error
/// domains and the wrapper factories of the built-in types. Safe to call
/// any number of times from any thread; only the first call does work.
/// Every entry point that creates wrappers calls it, so calling it
/// explicitly is only needed to pick the moment configuration is read.
pub fn init() {
    INIT.call_once(|| {
        RuntimeConfig::from_env().apply();
        register_builtins();
    });
}

/// Like [`init`], with explicit settings instead of the environment.
///
/// The settings are applied even if the layer was already initialized;
/// registration still happens only once.
pub fn init_with(config: RuntimeConfig) {
    INIT.call_once(register_builtins);
    config.apply();
}

/// Returns true once [`init`] or [`init_with`] has finished.
#[must_use]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Runs inside the `Once`: nothing here may call back into [`init`].
fn register_builtins() {
    register_builtin_domains();

    register_wrapped_type(Type::OBJECT, object_factory);
    register_wrapped_type(binding::register_type(), binding::binding_factory);
    register_wrapped_type(cancellable::register_type(), cancellable::cancellable_factory);
    register_wrapped_type(converter::register_type(), converter::converter_factory);

    // Formatting in Rust does not depend on the process locale, so there
    // is no locale to set up.
    INITIALIZED.store(true, Ordering::Release);
    debug!("gobind initialized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DomainError, Error, IoError, IoErrorEnum};

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        assert!(is_initialized());
        assert_eq!(Type::from_name("GCancellable"), Some(cancellable::register_type()));
    }

    #[test]
    fn test_builtin_domains_registered() {
        init();
        let err = Error::from_domain(DomainError::new(IoError::domain(), IoErrorEnum::NotFound as i32, "gone"));
        assert_eq!(err, Error::Io(IoError::new(IoErrorEnum::NotFound, "gone")));
    }
}

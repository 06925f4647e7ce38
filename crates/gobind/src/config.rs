//! Process-wide runtime switches.
//!
//! | Variable       | Values                                               |
//! |----------------|------------------------------------------------------|
//! | `GOBIND_LOG`   | a level name: `error`, `critical`, `warn`, ... `trace` |
//! | `GOBIND_DEBUG` | comma separated: `refcount`, `fatal-criticals`, `no-color` |
//!
//! Unknown values are reported with a warning and ignored.

use crate::exception::set_fatal_criticals;
use crate::runtime::set_debug_refcounting;
use gobind_log::{Level, warn};
use std::env;

/// Environment variable holding debug switches.
pub const DEBUG_ENV: &str = "GOBIND_DEBUG";

/// Settings applied by [`init_with`](crate::init_with).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Log level; `None` keeps the logger's current level.
    pub log_level: Option<Level>,
    /// Trace every reference count change.
    pub debug_refcounting: bool,
    /// Abort on unclaimed domain errors too.
    pub fatal_criticals: bool,
    /// Colour log output.
    pub color: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            log_level: None,
            debug_refcounting: false,
            fatal_criticals: false,
            color: true,
        }
    }
}

impl RuntimeConfig {
    /// Reads `GOBIND_LOG` and `GOBIND_DEBUG`.
    #[must_use]
    pub fn from_env() -> Self {
        let log = env::var(gobind_log::LOG_ENV).ok();
        let debug = env::var(DEBUG_ENV).ok();
        Self::parse(log.as_deref(), debug.as_deref())
    }

    /// Builds a config from the raw values of the two variables.
    #[must_use]
    pub fn parse(log: Option<&str>, debug: Option<&str>) -> Self {
        let mut config = RuntimeConfig::default();

        if let Some(log) = log {
            match Level::from_str(log.trim()) {
                Ok(level) => config.log_level = Some(level),
                Err(e) => warn!("{}: {}", gobind_log::LOG_ENV, e),
            }
        }

        for flag in debug.unwrap_or_default().split(',').map(str::trim) {
            match flag {
                "" => {}
                "refcount" => config.debug_refcounting = true,
                "fatal-criticals" => config.fatal_criticals = true,
                "no-color" => config.color = false,
                other => warn!("{}: unknown flag '{}'", DEBUG_ENV, other),
            }
        }
        config
    }

    pub(crate) fn apply(&self) {
        if let Some(level) = self.log_level {
            gobind_log::set_level(level);
        }
        gobind_log::set_color(self.color);
        set_debug_refcounting(self.debug_refcounting);
        set_fatal_criticals(self.fatal_criticals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_debug_flags() {
        let config = RuntimeConfig::parse(Some("debug"), Some("refcount, no-color"));
        assert_eq!(config.log_level, Some(Level::Debug));
        assert!(config.debug_refcounting);
        assert!(!config.fatal_criticals);
        assert!(!config.color);
    }

    #[test]
    fn test_unknown_values_warn() {
        let (config, records) = gobind_log::capture(|| RuntimeConfig::parse(Some("loud"), Some("bogus")));
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.level == Level::Warn));
    }

    #[test]
    fn test_empty_is_default() {
        assert_eq!(RuntimeConfig::parse(None, None), RuntimeConfig::default());
        assert_eq!(RuntimeConfig::parse(None, Some("")), RuntimeConfig::default());
    }
}

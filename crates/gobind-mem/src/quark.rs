//! Process-wide interned strings.
//!
//! A [`Quark`] is a non-zero 32-bit id for a string. Two quarks are equal
//! exactly when their strings are equal, so quarks are cheap keys for qdata,
//! signal details and error domains. Interned strings are copied into the
//! global arena and are never freed.
//!
//! # Examples
//!
//! ```
//! use gobind_mem::Quark;
//!
//! let a = Quark::from_str("g-io-error-quark");
//! let b = Quark::from_str("g-io-error-quark");
//!
//! assert_eq!(a, b);
//! assert_eq!(a.as_str(), "g-io-error-quark");
//! assert_eq!(Quark::try_from_str("never-interned-string"), None);
//! ```

use crate::arena::global_arena;
use fxhash::FxBuildHasher;
use hashbrown::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{OnceLock, RwLock};

/// An interned string id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quark(NonZeroU32);

struct QuarkTable {
    ids: HashMap<&'static str, Quark, FxBuildHasher>,
    strings: Vec<&'static str>,
}

fn table() -> &'static RwLock<QuarkTable> {
    static TABLE: OnceLock<RwLock<QuarkTable>> = OnceLock::new();
    TABLE.get_or_init(|| {
        RwLock::new(QuarkTable {
            ids: HashMap::with_hasher(FxBuildHasher::default()),
            strings: Vec::new(),
        })
    })
}

impl Quark {
    /// Interns `s`, returning its quark.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX - 1` distinct strings are interned.
    #[allow(clippy::should_implement_trait)]
    #[must_use]
    pub fn from_str(s: &str) -> Quark {
        if let Some(quark) = Self::try_from_str(s) {
            return quark;
        }

        let mut table = match table().write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(&quark) = table.ids.get(s) {
            return quark;
        }

        let interned = global_arena().alloc_str(s);
        let id = u32::try_from(table.strings.len() + 1)
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or_else(|| panic!("quark table exhausted"));
        let quark = Quark(id);

        table.strings.push(interned);
        table.ids.insert(interned, quark);
        quark
    }

    /// Returns the quark for `s` if it was interned before.
    #[must_use]
    pub fn try_from_str(s: &str) -> Option<Quark> {
        let table = match table().read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.ids.get(s).copied()
    }

    /// Returns the interned string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        let table = match table().read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Quarks are only minted by from_str, so the index is always valid.
        table.strings[self.0.get() as usize - 1]
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quark({}, {:?})", self.0, self.as_str())
    }
}

impl fmt::Display for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_interning_is_stable() {
        let a = Quark::from_str("quark-test-stable");
        let b = Quark::from_str(&String::from("quark-test-stable"));

        assert_eq!(a, b);
        assert_eq!(a.as_u32(), b.as_u32());
        assert_eq!(a.as_str(), "quark-test-stable");
    }

    #[test]
    fn test_distinct_strings_distinct_quarks() {
        let a = Quark::from_str("quark-test-a");
        let b = Quark::from_str("quark-test-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_try_from_str_does_not_intern() {
        assert_eq!(Quark::try_from_str("quark-test-missing"), None);
        assert_eq!(Quark::try_from_str("quark-test-missing"), None);

        let q = Quark::from_str("quark-test-missing-later");
        assert_eq!(Quark::try_from_str("quark-test-missing-later"), Some(q));
    }

    #[test]
    fn test_concurrent_interning() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| Quark::from_str("quark-test-concurrent")))
            .collect();

        let quarks: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(quarks.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_display_and_debug() {
        let q = Quark::from_str("quark-test-display");
        assert_eq!(q.to_string(), "quark-test-display");
        assert!(format!("{q:?}").contains("quark-test-display"));
    }
}

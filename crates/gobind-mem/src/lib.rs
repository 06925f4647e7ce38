//! Memory infrastructure for `gobind`.
//!
//! - **Global arena**: bump allocation for metadata that lives as long as the
//!   process (type nodes, signal nodes, interned strings, vtable slots)
//! - **Quarks**: process-wide interned strings identified by a 32-bit id,
//!   used for qdata keys, signal details and error domains
//!   (requires the `quark` feature)

#[cfg(feature = "global-arena")]
pub mod arena;

#[cfg(feature = "quark")]
pub mod quark;

#[cfg(feature = "global-arena")]
pub use arena::{ArenaStats, GlobalArena, global_arena};

#[cfg(feature = "quark")]
pub use quark::Quark;

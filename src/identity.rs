//! Build-time identity of the bridge
//!
//! `build.rs` turns the packaging pipeline's `MEGATRACE_MOD_ID`,
//! `MEGATRACE_MOD_NAME`, `MEGATRACE_MOD_VERSION` and `MEGATRACE_ROOT_PKG`
//! variables into compile-time constants. They tag every session handshake so a
//! viewer can tell which build produced a stream.
//!
//! The `*_C` variants are NUL-terminated for the C boundary.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Mod identifier (e.g. `megatrace`)
pub const MOD_ID: &str = env!("MEGATRACE_MOD_ID");
/// Display name (e.g. `MEGATrace`)
pub const MOD_NAME: &str = env!("MEGATRACE_MOD_NAME");
/// Semantic version of the host mod
pub const MOD_VERSION: &str = env!("MEGATRACE_MOD_VERSION");
/// Root namespace of the host mod (e.g. `mega.trace`)
pub const ROOT_PKG: &str = env!("MEGATRACE_ROOT_PKG");

pub(crate) const MOD_ID_C: &str = concat!(env!("MEGATRACE_MOD_ID"), "\0");
pub(crate) const MOD_NAME_C: &str = concat!(env!("MEGATRACE_MOD_NAME"), "\0");
pub(crate) const MOD_VERSION_C: &str = concat!(env!("MEGATRACE_MOD_VERSION"), "\0");
pub(crate) const ROOT_PKG_C: &str = concat!(env!("MEGATRACE_ROOT_PKG"), "\0");

/// Identity metadata carried in the session handshake
///
/// Built-in constants are borrowed (zero-copy); hosts that override the
/// identity at runtime pass owned strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub mod_id: Cow<'static, str>,
    pub mod_name: Cow<'static, str>,
    pub mod_version: Cow<'static, str>,
    pub root_pkg: Cow<'static, str>,
}

impl Identity {
    /// Identity compiled into this binary
    pub const fn build() -> Self {
        Identity {
            mod_id: Cow::Borrowed(MOD_ID),
            mod_name: Cow::Borrowed(MOD_NAME),
            mod_version: Cow::Borrowed(MOD_VERSION),
            root_pkg: Cow::Borrowed(ROOT_PKG),
        }
    }

    /// Identity supplied by the host at runtime
    pub fn new(
        mod_id: impl Into<String>,
        mod_name: impl Into<String>,
        mod_version: impl Into<String>,
        root_pkg: impl Into<String>,
    ) -> Self {
        Identity {
            mod_id: Cow::Owned(mod_id.into()),
            mod_name: Cow::Owned(mod_name.into()),
            mod_version: Cow::Owned(mod_version.into()),
            root_pkg: Cow::Owned(root_pkg.into()),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Identity::build()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.mod_name, self.mod_version, self.mod_id)
    }
}

//! Constants and functions for shared access to documentation and build metadata.

use once_cell::sync::OnceCell;
use semver::Version;

pub mod link;

/// The git SHA for the current build.
pub fn build_sha() -> &'static str {
    // This value is set in `build.rs` and evaluated at compile time.
    static LAZY: OnceCell<&'static str> = OnceCell::new();
    LAZY.get_or_init(|| env!("GIT_HASH"))
}

/// The crate repo URL.
pub fn repo_home() -> &'static str {
    // This value is set by Cargo and evaluated at compile time.
    static LAZY: OnceCell<&'static str> = OnceCell::new();
    LAZY.get_or_init(|| env!("CARGO_PKG_REPOSITORY"))
}

/// The crate's package name, as recorded by the database to detect
/// cross-version access.
pub fn crate_name() -> &'static str {
    static LAZY: OnceCell<&'static str> = OnceCell::new();
    LAZY.get_or_init(|| env!("CARGO_PKG_NAME"))
}

/// The crate's current version, parsed once and cached.
pub fn crate_version() -> &'static Version {
    static LAZY: OnceCell<Version> = OnceCell::new();
    LAZY.get_or_init(|| Version::parse(env!("CARGO_PKG_VERSION")).expect("crate version must be valid semver"))
}

//! Protocol version constants and the supported band.
//!
//! The on-the-wire version is the first field of every request so that
//! mixed-version zone graphs can coexist; each service proxy negotiates its
//! own effective version downward from [`current_version`].

/// Protocol version 2.
pub const VERSION_2: u64 = 2;

/// Protocol version 3.
pub const VERSION_3: u64 = 3;

/// The oldest version this build still speaks.
pub const LOWEST_SUPPORTED_VERSION: u64 = VERSION_2;

/// The newest version this build speaks.
pub const HIGHEST_SUPPORTED_VERSION: u64 = VERSION_3;

/// The version new proxies start negotiating from.
pub fn current_version() -> u64 {
    HIGHEST_SUPPORTED_VERSION
}

/// Whether a version on an incoming request is within the supported band.
pub fn is_supported(version: u64) -> bool {
    (LOWEST_SUPPORTED_VERSION..=HIGHEST_SUPPORTED_VERSION).contains(&version)
}

use lazy_static::lazy_static;
use std::env;

lazy_static! {
    static ref FLAGS: DebugFlags = DebugFlags::from_env();
}

/// Process-wide debugging switches, read once from `PROCTL_DEBUG`.
///
/// `PROCTL_DEBUG` is a comma-separated list of words. Recognised words:
/// `mutexes` enables the error-checking variant of the per-target
/// recursive lock (every guarded state access is verified against the
/// recorded lock holder).
#[derive(Clone)]
pub struct DebugFlags {
    /// Verify lock ownership on every guarded state access.
    pub debug_mutexes: bool,
}

impl DebugFlags {
    pub fn get() -> &'static DebugFlags {
        &*FLAGS
    }

    fn from_env() -> DebugFlags {
        let raw = env::var("PROCTL_DEBUG").unwrap_or_default();
        DebugFlags {
            debug_mutexes: raw.split(',').any(|w| w.trim() == "mutexes"),
        }
    }
}

/// True when error-checking mutexes were requested for this process.
pub fn debug_mutexes() -> bool {
    DebugFlags::get().debug_mutexes
}

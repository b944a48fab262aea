pub mod classify;
pub mod config;
pub mod coverage;
pub mod forkserver;
mod hash;
pub mod shmem;

pub use classify::{
    CrashFilter, ErrnoFilter, FaultContext, FilterError, KindFilter, SignalFilter, crash_at,
    raise_crash_signal,
};
pub use config::HarnessConfig;
pub use coverage::{CoverageMap, WorkerContext};
pub use forkserver::{ForkServer, ForkServerError, Role, SessionState, SessionSummary};
pub use shmem::{SharedRegion, ShmemError};

/// Standalone hash entry point, compiled in only for test builds (set
/// `WARREN_TEST_FNV` to a non-empty, non-"0" value at build time).
#[cfg(warren_test_fnv)]
pub use hash::location_hash;

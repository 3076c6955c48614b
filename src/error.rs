//! Fatal-error reporting.
//!
//! This layer's contract with callers is "either the op completes or the process terminates"
//! (see the error handling design in `SPEC_FULL.md` §4/§7). There is nothing to recover from a
//! usage error, a resource-pool exhaustion the allocator can't service, or a barrier mismatch:
//! each is a programming error or an unrecoverable transport condition, so we log a descriptive
//! message and abort rather than threading a `Result` a caller could accidentally swallow.

use thiserror::Error;

/// Kinds of unrecoverable condition this layer can hit.
///
/// Every variant here is fatal: constructing one and handing it to [`fatal`] always ends the
/// process. The enum exists so the message and the `tracing` event carry a stable, matchable
/// shape (useful in tests that want to assert *which* fatal condition fired, via
/// [`FatalError::kind_for_test`]) even though nothing downstream ever catches it.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("collio: used before init() / after a prior init() (call before init)")]
    NotInitialized,

    #[error("collio: bad flag combination: {0}")]
    BadFlags(String),

    #[error("collio: buffer claimed in-segment is out of bounds: {0}")]
    SegmentBounds(String),

    #[error("collio: unknown team handle {0}")]
    UnknownTeam(u32),

    #[error("collio: unknown tree kind")]
    UnknownTreeKind,

    #[error("collio: no algorithm applies to this combination of flags and sizes")]
    NoApplicableAlgorithm,

    #[error("collio: consensus barrier name mismatch (program structure diverged across processes)")]
    BarrierMismatch,

    #[error("collio: transport reported failure: {0}")]
    Transport(String),
}

#[cfg(test)]
impl FatalError {
    /// Cheap discriminant for tests that want to assert which kind of fatal condition a code
    /// path would have raised, without actually aborting the test process.
    pub fn kind_for_test(&self) -> &'static str {
        match self {
            FatalError::NotInitialized => "not_initialized",
            FatalError::BadFlags(_) => "bad_flags",
            FatalError::SegmentBounds(_) => "segment_bounds",
            FatalError::UnknownTeam(_) => "unknown_team",
            FatalError::UnknownTreeKind => "unknown_tree_kind",
            FatalError::NoApplicableAlgorithm => "no_applicable_algorithm",
            FatalError::BarrierMismatch => "barrier_mismatch",
            FatalError::Transport(_) => "transport",
        }
    }
}

/// Report `err` and terminate the process.
///
/// In test builds this panics instead of aborting, so `#[should_panic]` tests can observe which
/// fatal path fired without killing the test harness.
#[cold]
pub fn fatal(err: FatalError) -> ! {
    tracing::error!(error = %err, "fatal condition, aborting");
    #[cfg(not(test))]
    {
        std::process::abort();
    }
    #[cfg(test)]
    {
        panic!("{err}");
    }
}

use nix::sys::signal::{Signal, raise};
use thiserror::Error;

/// Largest signal number the classifier accepts (covers the realtime range).
pub const MAX_SIGNAL: i32 = 64;

/// Invalid-argument failures raised during filter construction.
///
/// These are reported to the caller immediately and are never a crash
/// determination: a filter that fails validation classifies nothing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("signal number {0} is outside the valid range 0..={MAX_SIGNAL}")]
    InvalidSignal(i32),
    #[error("OS error code {0} is invalid; errno values are non-negative")]
    InvalidErrno(i32),
    #[error("exception kind at position {0} is empty")]
    EmptyKind(usize),
}

/// Which exception/error kinds count as a crash. `Any` (the absent filter)
/// and an empty `OneOf` both match every fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KindFilter {
    #[default]
    Any,
    OneOf(Vec<String>),
}

/// Which OS error codes count as a crash. Same sentinel semantics as
/// [`KindFilter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ErrnoFilter {
    #[default]
    Any,
    OneOf(Vec<i32>),
}

/// Which delivered signal counts as a crash. `Exactly(0)` is the "no
/// signal" sentinel and is normalized to `Any` during validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignalFilter {
    #[default]
    Any,
    Exactly(i32),
}

/// The fault being classified: the kind of the error that was just caught,
/// the OS error code attached to it, and the signal that was just
/// delivered, each absent when it does not apply.
///
/// Classification is only meaningful at a point where such a context
/// exists; building one is the caller's job (typically the worker's
/// catch-all error handler).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultContext {
    pub kind: Option<String>,
    pub errno: Option<i32>,
    pub signal: Option<i32>,
}

impl FaultContext {
    pub fn from_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn from_errno(errno: i32) -> Self {
        Self {
            errno: Some(errno),
            ..Self::default()
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            signal: Some(signal),
            ..Self::default()
        }
    }
}

/// A validated crash predicate over three independent filter axes.
///
/// The axes combine disjunctively: a fault is a crash when its kind is in
/// the kind set, OR its error code is in the errno set, OR its signal
/// equals the target signal. An absent axis matches anything, which makes
/// the fully-absent filter permissive: every fault is a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashFilter {
    kinds: KindFilter,
    errnos: ErrnoFilter,
    signal: SignalFilter,
}

impl CrashFilter {
    /// Validates the three axes and builds the filter.
    ///
    /// Validation precedes any classification and is strict: an errno
    /// outside the non-negative range, a signal outside `0..=MAX_SIGNAL`,
    /// or an empty kind string is an invalid-argument failure, never a
    /// silent coercion.
    pub fn new(
        kinds: KindFilter,
        errnos: ErrnoFilter,
        signal: SignalFilter,
    ) -> Result<Self, FilterError> {
        if let KindFilter::OneOf(kinds) = &kinds {
            if let Some(position) = kinds.iter().position(|k| k.is_empty()) {
                return Err(FilterError::EmptyKind(position));
            }
        }
        if let ErrnoFilter::OneOf(codes) = &errnos {
            if let Some(&code) = codes.iter().find(|&&c| c < 0) {
                return Err(FilterError::InvalidErrno(code));
            }
        }
        let signal = match signal {
            // 0 is the "no signal" sentinel: no filtering on this axis.
            SignalFilter::Exactly(0) => SignalFilter::Any,
            SignalFilter::Exactly(n) if !(0..=MAX_SIGNAL).contains(&n) => {
                return Err(FilterError::InvalidSignal(n));
            }
            other => other,
        };
        Ok(Self {
            kinds,
            errnos,
            signal,
        })
    }

    /// The match-anything filter: every fault classifies as a crash.
    pub fn permissive() -> Self {
        Self {
            kinds: KindFilter::Any,
            errnos: ErrnoFilter::Any,
            signal: SignalFilter::Any,
        }
    }

    /// Classifies a fault. Pure: no side effect beyond the determination;
    /// whether to terminate the worker is the caller's decision.
    pub fn is_crash(&self, fault: &FaultContext) -> bool {
        self.kind_matches(fault) || self.errno_matches(fault) || self.signal_matches(fault)
    }

    fn kind_matches(&self, fault: &FaultContext) -> bool {
        match &self.kinds {
            KindFilter::Any => true,
            KindFilter::OneOf(kinds) if kinds.is_empty() => true,
            KindFilter::OneOf(kinds) => fault
                .kind
                .as_deref()
                .is_some_and(|kind| kinds.iter().any(|k| k == kind)),
        }
    }

    fn errno_matches(&self, fault: &FaultContext) -> bool {
        match &self.errnos {
            ErrnoFilter::Any => true,
            ErrnoFilter::OneOf(codes) if codes.is_empty() => true,
            ErrnoFilter::OneOf(codes) => fault.errno.is_some_and(|code| codes.contains(&code)),
        }
    }

    fn signal_matches(&self, fault: &FaultContext) -> bool {
        match self.signal {
            SignalFilter::Any => true,
            SignalFilter::Exactly(target) => fault.signal == Some(target),
        }
    }
}

/// One-shot entry point: validate the three filter axes and classify
/// `fault` in a single call.
///
/// `None` means "absent" (no filtering on that axis); passing `Some(0)` for
/// the signal is the equivalent sentinel. Invalid values are reported as
/// `Err`, not as a crash determination.
pub fn crash_at(
    kinds: Option<&[&str]>,
    errnos: Option<&[i32]>,
    signal: Option<i32>,
    fault: &FaultContext,
) -> Result<bool, FilterError> {
    let kinds = match kinds {
        None => KindFilter::Any,
        Some(list) => KindFilter::OneOf(list.iter().map(|k| k.to_string()).collect()),
    };
    let errnos = match errnos {
        None => ErrnoFilter::Any,
        Some(list) => ErrnoFilter::OneOf(list.to_vec()),
    };
    let signal = match signal {
        None => SignalFilter::Any,
        Some(n) => SignalFilter::Exactly(n),
    };
    Ok(CrashFilter::new(kinds, errnos, signal)?.is_crash(fault))
}

/// Delivers `signal` to the current process so the driving fuzzer observes
/// a signal-terminated worker.
///
/// This is the termination half of crash classification: a worker that
/// classified its fault as a crash calls this instead of exiting normally.
/// Signals outside the OS-supported set are reported as invalid.
pub fn raise_crash_signal(signal: i32) -> Result<(), FilterError> {
    let signal = Signal::try_from(signal).map_err(|_| FilterError::InvalidSignal(signal))?;
    raise(signal).map_err(|_| FilterError::InvalidSignal(signal as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_filters_classify_everything_as_a_crash() {
        let fault = FaultContext::from_kind("RuntimeError");
        assert_eq!(crash_at(None, None, None, &fault), Ok(true));
        assert_eq!(crash_at(None, None, None, &FaultContext::default()), Ok(true));
    }

    #[test]
    fn empty_filters_and_zero_signal_are_permissive() {
        let fault = FaultContext::default();
        assert_eq!(crash_at(Some(&[]), Some(&[]), Some(0), &fault), Ok(true));
    }

    #[test]
    fn matching_fault_on_each_axis_is_a_crash() {
        let filter = CrashFilter::new(
            KindFilter::OneOf(vec!["IOError".into()]),
            ErrnoFilter::OneOf(vec![libc::EINVAL]),
            SignalFilter::Exactly(libc::SIGUSR1),
        )
        .expect("filter should validate");

        assert!(filter.is_crash(&FaultContext::from_kind("IOError")));
        assert!(filter.is_crash(&FaultContext::from_errno(libc::EINVAL)));
        assert!(filter.is_crash(&FaultContext::from_signal(libc::SIGUSR1)));
    }

    #[test]
    fn non_matching_fault_is_not_a_crash() {
        let filter = CrashFilter::new(
            KindFilter::OneOf(vec!["IOError".into()]),
            ErrnoFilter::OneOf(vec![libc::EINVAL]),
            SignalFilter::Exactly(libc::SIGUSR1),
        )
        .expect("filter should validate");

        let fault = FaultContext {
            kind: Some("ArgumentError".into()),
            errno: Some(libc::ENOENT),
            signal: Some(libc::SIGUSR2),
        };
        assert!(!filter.is_crash(&fault));
        assert!(!filter.is_crash(&FaultContext::default()));
    }

    #[test]
    fn one_permissive_axis_keeps_the_predicate_permissive() {
        // The kind axis is absent, so it matches any fault on its own.
        let filter = CrashFilter::new(
            KindFilter::Any,
            ErrnoFilter::OneOf(vec![libc::EINVAL]),
            SignalFilter::Exactly(libc::SIGUSR1),
        )
        .expect("filter should validate");
        assert!(filter.is_crash(&FaultContext::default()));
    }

    #[test]
    fn invalid_arguments_are_reported_not_classified() {
        let fault = FaultContext::default();
        assert_eq!(
            crash_at(None, Some(&[-1]), None, &fault),
            Err(FilterError::InvalidErrno(-1))
        );
        assert_eq!(
            crash_at(None, None, Some(-9), &fault),
            Err(FilterError::InvalidSignal(-9))
        );
        assert_eq!(
            crash_at(None, None, Some(MAX_SIGNAL + 1), &fault),
            Err(FilterError::InvalidSignal(MAX_SIGNAL + 1))
        );
        assert_eq!(
            crash_at(Some(&["IOError", ""]), None, None, &fault),
            Err(FilterError::EmptyKind(1))
        );
    }

    #[test]
    fn zero_signal_normalizes_to_the_absent_filter() {
        let filter = CrashFilter::new(KindFilter::Any, ErrnoFilter::Any, SignalFilter::Exactly(0))
            .expect("filter should validate");
        assert_eq!(filter, CrashFilter::permissive());
    }

    #[test]
    fn permissive_filter_always_matches() {
        let filter = CrashFilter::permissive();
        assert!(filter.is_crash(&FaultContext::default()));
        assert!(filter.is_crash(&FaultContext::from_signal(libc::SIGKILL)));
    }
}

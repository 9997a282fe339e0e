//! Error taxonomy for the jitter entropy engine.
//!
//! A single enum is the only error currency in the crate. Initialization
//! failures carry the historical positive status codes, per-read failures the
//! negative ones; both are reachable through [`Error::code`] for callers that
//! log or compare numeric codes.

use thiserror::Error;

/// All failure conditions of the entropy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Timer service not available.
    #[error("timer service not available")]
    NoTime,
    /// Timer too coarse to carry jitter.
    #[error("timer resolution too coarse for entropy collection")]
    CoarseTime,
    /// Timer is not monotonically increasing.
    #[error("timer is not monotonic")]
    NonMonotonic,
    /// Timer variations too small.
    #[error("timer variations too small")]
    MinVariation,
    /// Second derivative of the time is zero.
    #[error("timer does not produce variations of variations")]
    VarVar,
    /// Variations of variations too small.
    #[error("timer variations of variations too small")]
    MinVarVar,
    /// Internal programming error.
    #[error("internal programming error")]
    ProgErr,
    /// Too many stuck measurements during initialization.
    #[error("too many stuck results during initialization")]
    Stuck,
    /// Unspecific health test failure during initialization.
    #[error("health test failed during initialization")]
    Health,
    /// Repetition count test failed during initialization.
    #[error("repetition count test failed during initialization")]
    Rct,
    /// SHA-3 known-answer test failed.
    #[error("hash self-test failed")]
    Hash,
    /// Memory allocation failed.
    #[error("memory allocation failed")]
    Mem,
    /// GCD self-test failed.
    #[error("GCD self-test failed")]
    Gcd,
    /// Adaptive proportion test failed during initialization.
    #[error("adaptive proportion test failed during initialization")]
    Apt,
    /// Lag predictor test failed during initialization.
    #[error("lag predictor test failed during initialization")]
    Lag,
    /// Distribution test failed during initialization.
    #[error("distribution test failed during initialization")]
    Dist,

    /// The collector handle is unusable.
    #[error("entropy collector is invalid")]
    InvalidHandle,
    /// Repetition count test failed while reading.
    #[error("repetition count test failure")]
    RctFailure,
    /// Adaptive proportion test failed while reading.
    #[error("adaptive proportion test failure")]
    AptFailure,
    /// The internal timer thread could not be started.
    #[error("internal timer could not be started")]
    TimerStart,
    /// Lag predictor test failed while reading.
    #[error("lag predictor test failure")]
    LagFailure,
    /// Distribution test failed while reading.
    #[error("distribution proportion test failure")]
    DistFailure,
}

impl Error {
    /// Stable numeric status code.
    ///
    /// Positive codes are initialization failures, negative codes per-read
    /// failures; the values match the historical C interface so that
    /// operators comparing logged codes across implementations see the same
    /// numbers.
    pub fn code(&self) -> i32 {
        match self {
            Error::NoTime => 1,
            Error::CoarseTime => 2,
            Error::NonMonotonic => 3,
            Error::MinVariation => 4,
            Error::VarVar => 5,
            Error::MinVarVar => 6,
            Error::ProgErr => 7,
            Error::Stuck => 8,
            Error::Health => 9,
            Error::Rct => 10,
            Error::Hash => 11,
            Error::Mem => 12,
            Error::Gcd => 13,
            Error::Apt => 14,
            Error::Lag => 15,
            Error::Dist => 16,
            Error::InvalidHandle => -1,
            Error::RctFailure => -2,
            Error::AptFailure => -3,
            Error::TimerStart => -4,
            Error::LagFailure => -5,
            Error::DistFailure => -6,
        }
    }

    /// True for the per-read health failures that `read_safe` recovers from
    /// by escalating the oversampling rate.
    pub fn is_recoverable_health_failure(&self) -> bool {
        matches!(
            self,
            Error::RctFailure | Error::AptFailure | Error::LagFailure | Error::DistFailure
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::NoTime.code(), 1);
        assert_eq!(Error::CoarseTime.code(), 2);
        assert_eq!(Error::NonMonotonic.code(), 3);
        assert_eq!(Error::Stuck.code(), 8);
        assert_eq!(Error::Rct.code(), 10);
        assert_eq!(Error::Hash.code(), 11);
        assert_eq!(Error::Gcd.code(), 13);
        assert_eq!(Error::Apt.code(), 14);
        assert_eq!(Error::Lag.code(), 15);
        assert_eq!(Error::Dist.code(), 16);
        assert_eq!(Error::InvalidHandle.code(), -1);
        assert_eq!(Error::RctFailure.code(), -2);
        assert_eq!(Error::AptFailure.code(), -3);
        assert_eq!(Error::TimerStart.code(), -4);
        assert_eq!(Error::LagFailure.code(), -5);
        assert_eq!(Error::DistFailure.code(), -6);
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::RctFailure.is_recoverable_health_failure());
        assert!(Error::AptFailure.is_recoverable_health_failure());
        assert!(Error::LagFailure.is_recoverable_health_failure());
        assert!(Error::DistFailure.is_recoverable_health_failure());
        assert!(!Error::TimerStart.is_recoverable_health_failure());
        assert!(!Error::InvalidHandle.is_recoverable_health_failure());
    }
}

//! Error types for the tacview environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    /// A virtual clock was asked to move backwards
    #[error("Clock regression: current {current_ns}ns, requested {requested_ns}ns")]
    ClockRegression { current_ns: u64, requested_ns: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EnvError::ClockRegression {
            current_ns: 10,
            requested_ns: 5,
        };
        assert_eq!(err.to_string(), "Clock regression: current 10ns, requested 5ns");
    }
}

//! Centralized error types.
//!
//! Subsystems define their own error enums ([`ExprError`], [`NetError`])
//! next to the code that raises them; this module unifies them behind
//! [`MapflowError`] for the public API surface.

use thiserror::Error;

use crate::expr::ExprError;
use crate::net::NetError;

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum MapflowError {
    /// Expression compilation failed.
    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    /// Socket setup or transmission failed.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// A named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call contradicts the object's declared shape (writing an
    /// input, min above max, incompatible vector lengths).
    #[error("invalid use: {0}")]
    Misuse(String),

    /// A name or argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl MapflowError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Expr(_) => "expression_error",
            Self::Net(_) => "network_error",
            Self::NotFound(_) => "not_found",
            Self::Misuse(_) => "invalid_use",
            Self::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Convenient result alias for public operations.
pub type MapflowResult<T> = Result<T, MapflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            MapflowError::NotFound("b.1/in".into()).code(),
            "not_found"
        );
        assert_eq!(
            MapflowError::Misuse("min above max".into()).code(),
            "invalid_use"
        );
    }

    #[test]
    fn expr_errors_convert() {
        let e: MapflowError = ExprError::DivisionByZero.into();
        assert_eq!(e.code(), "expression_error");
        assert!(e.to_string().contains("division"));
    }
}

//! Error types for the prediction exchange core.

use num_derive::FromPrimitive;
use thiserror::Error;

/// Result alias used throughout the exchange core.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors that may be returned by the exchange core.
///
/// Discriminants are stable wire codes: hosts may persist or transmit them
/// and decode with [`ExchangeError::from_code`]. Every variant except
/// `Internal` is user-recoverable - the failed operation mutated nothing and
/// the caller may retry with corrected input.
#[derive(Clone, Copy, Debug, Eq, Error, FromPrimitive, PartialEq)]
pub enum ExchangeError {
    // === General Errors (0-99) ===

    #[error("Invalid parameters")]
    InvalidParameters = 1,

    #[error("Insufficient available balance")]
    InsufficientBalance = 2,

    #[error("Internal error")]
    Internal = 3,

    // === Market Errors (100-199) ===

    #[error("Market is closed")]
    MarketClosed = 100,

    #[error("Outcome does not belong to market")]
    InvalidOutcome = 101,

    #[error("Market already resolved")]
    AlreadyResolved = 102,

    #[error("Caller is not the market oracle")]
    NotOracle = 103,

    // === Order Errors (200-299) ===

    #[error("User already has an order in this market")]
    OrderAlreadyExists = 200,

    #[error("No such order")]
    NoSuchOrder = 201,
}

impl ExchangeError {
    /// Stable numeric code for the host wire.
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Decode a wire code back into an error.
    pub fn from_code(code: u32) -> Option<Self> {
        num_traits::FromPrimitive::from_u32(code)
    }

    /// Whether the caller may retry after correcting its input. `Internal`
    /// is the only fatal kind: storage faults and invariant breaches.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ExchangeError::Internal)
    }
}

//! Utility functions for the prediction exchange.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ExchangeError, ExchangeResult};
use crate::state::{MAX_PRICE_E6, MIN_PRICE_E6};

/// Bits reserved for the per-millisecond sequence in generated ids.
const ID_SEQUENCE_BITS: u32 = 20;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Safe addition for u64
pub fn safe_add_u64(a: u64, b: u64) -> ExchangeResult<u64> {
    a.checked_add(b).ok_or(ExchangeError::Internal)
}

/// Safe subtraction for u64
pub fn safe_sub_u64(a: u64, b: u64) -> ExchangeResult<u64> {
    a.checked_sub(b).ok_or(ExchangeError::Internal)
}

/// Safe multiplication for u64
pub fn safe_mul_u64(a: u64, b: u64) -> ExchangeResult<u64> {
    a.checked_mul(b).ok_or(ExchangeError::Internal)
}

/// Safe addition for i64
pub fn safe_add_i64(a: i64, b: i64) -> ExchangeResult<i64> {
    a.checked_add(b).ok_or(ExchangeError::Internal)
}

/// Safe subtraction for i64
pub fn safe_sub_i64(a: i64, b: i64) -> ExchangeResult<i64> {
    a.checked_sub(b).ok_or(ExchangeError::Internal)
}

/// `a * b / divisor` with a u128 intermediate, rounded down.
pub fn mul_div_u64(a: u64, b: u64, divisor: u64) -> ExchangeResult<u64> {
    if divisor == 0 {
        return Err(ExchangeError::Internal);
    }
    let wide = (a as u128) * (b as u128) / (divisor as u128);
    u64::try_from(wide).map_err(|_| ExchangeError::Internal)
}

/// Apply a signed delta to an unsigned amount, failing on under/overflow.
/// Used for balance and escrow arithmetic where negative results are
/// invariant violations.
pub fn apply_delta_u64(value: u64, delta_e6: i64) -> ExchangeResult<u64> {
    if delta_e6 >= 0 {
        safe_add_u64(value, delta_e6 as u64)
    } else {
        safe_sub_u64(value, delta_e6.unsigned_abs())
    }
}

/// Validate a limit price is inside the admissible band.
pub fn validate_price(price_e6: u64) -> ExchangeResult<()> {
    if price_e6 < MIN_PRICE_E6 || price_e6 > MAX_PRICE_E6 {
        tracing::debug!(
            price_e6,
            min = MIN_PRICE_E6,
            max = MAX_PRICE_E6,
            "rejecting out-of-band price"
        );
        return Err(ExchangeError::InvalidParameters);
    }
    Ok(())
}

/// Validate an order quantity against the exchange cap.
pub fn validate_quantity(quantity: u64, max_quantity: u64) -> ExchangeResult<()> {
    if quantity == 0 || quantity > max_quantity {
        tracing::debug!(quantity, max_quantity, "rejecting out-of-band quantity");
        return Err(ExchangeError::InvalidParameters);
    }
    Ok(())
}

/// Monotone id generator: millisecond timestamp since a configurable epoch,
/// shifted left over a sequence counter. Generated ids are rendered as
/// fixed-width hex, so lexicographic order equals generation order.
pub struct IdGen {
    epoch_ms: i64,
    state: AtomicU64,
}

impl IdGen {
    pub fn new(epoch_ms: i64) -> Self {
        Self {
            epoch_ms,
            state: AtomicU64::new(0),
        }
    }

    /// Produce the next id. Monotone across threads: concurrent calls with
    /// equal timestamps fall back to the sequence counter.
    pub fn next(&self, now_ms: i64) -> String {
        let elapsed = now_ms.saturating_sub(self.epoch_ms).max(0) as u64;
        let candidate = elapsed << ID_SEQUENCE_BITS;
        let prev = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(prev.max(candidate).wrapping_add(1))
            })
            .unwrap_or(0);
        let raw = prev.max(candidate).wrapping_add(1);
        format!("{raw:016x}")
    }
}

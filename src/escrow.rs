//! Escrow computation for order admission.
//!
//! The exchange is fully collateralised at every instant: the cash locked
//! here is exactly what the order can cost its owner in the worst case.
//!
//! - A buy can pay at most its limit price per contract, so the escrow is
//!   `quantity * price`.
//! - A sell delivers contracts the user already owns for free; only the
//!   shortfall is a short, which co-mints a basket on match. The seller
//!   receives `price` per short contract at match time and owes the
//!   complementary `1 - price` at resolution, so locking
//!   `shortfall * (1 - price)` completes the basket's collateral.

use crate::state::{OrderDirection, CONTRACT_PRECISION, PRICE_PRECISION};

/// Escrow for a buy order: the full limit cost.
pub fn buy_escrow_e6(quantity: u64, price_e6: u64) -> u64 {
    quantity * price_e6
}

/// Escrow for a sell order given the seller's current signed micro-contract
/// holding of the targeted outcome. Owned contracts need no collateral;
/// negative holdings count as owning nothing.
pub fn sell_escrow_e6(quantity: u64, price_e6: u64, holding_e6: i64) -> u64 {
    let owned_e6 = holding_e6.max(0) as u64;
    let quantity_e6 = quantity * CONTRACT_PRECISION as u64;
    let shortfall_e6 = quantity_e6.saturating_sub(owned_e6);
    let complement_e6 = PRICE_PRECISION - price_e6;
    ((shortfall_e6 as u128) * (complement_e6 as u128) / (PRICE_PRECISION as u128)) as u64
}

/// Escrow required to admit an order.
pub fn required_escrow_e6(
    direction: OrderDirection,
    quantity: u64,
    price_e6: u64,
    holding_e6: i64,
) -> u64 {
    match direction {
        OrderDirection::Buy => buy_escrow_e6(quantity, price_e6),
        OrderDirection::Sell => sell_escrow_e6(quantity, price_e6, holding_e6),
    }
}

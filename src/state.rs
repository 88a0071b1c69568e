//! State definitions for the prediction exchange.
//!
//! All persisted entities and the read views served to the host.
//!
//! Currency amounts and prices are fixed-point integers with six decimal
//! places (`*_e6`). Contract quantities on orders are whole contracts;
//! contract quantities inside positions are signed micro-contracts, so
//! short holdings are literal negatives and pro-rata surplus shares stay
//! exact integers.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

// ============================================================================
// Constants
// ============================================================================

/// Price precision (1.00 currency unit = 1_000_000)
pub const PRICE_PRECISION: u64 = 1_000_000;

/// Contract precision (1 contract = 1_000_000 micro-contracts)
pub const CONTRACT_PRECISION: i64 = 1_000_000;

/// Minimum admissible order price (0.01 = 1%)
pub const MIN_PRICE_E6: u64 = 10_000;

/// Maximum admissible order price (0.99 = 99%)
pub const MAX_PRICE_E6: u64 = 990_000;

/// Maximum order quantity in contracts
pub const MAX_ORDER_QUANTITY: u64 = 1_000;

/// Maximum number of outcomes per market
pub const MAX_OUTCOMES: usize = 32;

/// Maximum length of a market description (bytes)
pub const MAX_DESCRIPTION_LEN: usize = 256;

/// Maximum length of an outcome description (bytes)
pub const MAX_OUTCOME_DESCRIPTION_LEN: usize = 100;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque user identifier, assigned by the host (e.g. a chat platform id).
pub type UserId = String;
/// Opaque market identifier, assigned by the exchange id generator.
pub type MarketId = String;
/// Opaque outcome identifier.
pub type OutcomeId = String;
/// Opaque order identifier.
pub type OrderId = String;
/// Opaque execution identifier.
pub type ExecutionId = String;

// ============================================================================
// Enums
// ============================================================================

/// Order direction (buy/sell)
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Buy = 0,
    Sell = 1,
}

/// Market lifecycle status
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketStatus {
    /// Open and tradeable
    Open = 0,
    /// Resolved (winning outcome finalized)
    Resolved = 1,
}

impl Default for MarketStatus {
    fn default() -> Self {
        MarketStatus::Open
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A participant account.
///
/// Created on first reference, never destroyed. `locked_e6` is the cash set
/// aside to back the user's resting orders; it is counted inside
/// `balance_e6` and subtracted from the spendable amount.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,

    /// Total balance, including locked escrow (micro-currency)
    pub balance_e6: u64,

    /// Escrow backing resting orders (micro-currency)
    pub locked_e6: u64,

    /// Creation timestamp (Unix millis)
    pub created_at: i64,
}

impl User {
    pub fn new(id: UserId, created_at: i64) -> Self {
        Self {
            id,
            balance_e6: 0,
            locked_e6: 0,
            created_at,
        }
    }

    /// Spendable balance: total minus locked escrow.
    pub fn available_e6(&self) -> u64 {
        self.balance_e6.saturating_sub(self.locked_e6)
    }
}

/// A single prediction market.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct Market {
    pub id: MarketId,

    /// Human-visible monotone market number, unique per exchange
    pub number: u64,

    /// Host community the market belongs to
    pub guild_id: String,

    /// User who created the market
    pub creator_id: UserId,

    /// Market question / descriptor text
    pub description: String,

    /// User authorised to declare the winning outcome
    pub oracle_user_id: UserId,

    pub status: MarketStatus,

    /// Winning outcome, set exactly once on resolution
    pub winning_outcome_id: Option<OutcomeId>,

    /// Complete sets minted by synthetic matches (informational)
    pub total_minted_sets: u64,

    /// Gross direct-match volume in micro-currency (informational)
    pub volume_e6: u64,

    /// Creation timestamp (Unix millis)
    pub created_at: i64,

    /// Resolution timestamp (Unix millis)
    pub resolved_at: Option<i64>,
}

impl Market {
    pub fn is_open(&self) -> bool {
        self.status == MarketStatus::Open
    }
}

/// One of a market's mutually exclusive outcomes. Immutable after creation.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub id: OutcomeId,

    pub market_id: MarketId,

    /// 1-indexed outcome number within the market
    pub number: u16,

    pub description: String,
}

/// A resting limit order.
///
/// At most one per (user, market). `quantity` is the remaining unfilled
/// amount and is always positive for a persisted order; `escrow_e6` always
/// corresponds to that remaining quantity (it is released proportionally on
/// partial fills).
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,

    pub user_id: UserId,

    pub market_id: MarketId,

    pub outcome_id: OutcomeId,

    pub direction: OrderDirection,

    /// Remaining unfilled quantity (whole contracts, > 0)
    pub quantity: u64,

    /// Limit price (micro-currency per contract)
    pub price_e6: u64,

    /// Cash locked to back this order (micro-currency)
    pub escrow_e6: u64,

    /// Creation timestamp (Unix millis); FIFO tie-break key
    pub created_at: i64,
}

impl Order {
    pub fn is_buy(&self) -> bool {
        self.direction == OrderDirection::Buy
    }
}

/// A user's contract holdings in one market.
///
/// Keyed logically by (user, market). Holdings are signed micro-contracts
/// per outcome; a short position is a negative entry. Entries that reach
/// zero are removed, and an emptied position row is deleted.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub id: String,

    pub user_id: UserId,

    pub market_id: MarketId,

    /// Outcome id -> signed micro-contracts
    pub holdings: BTreeMap<OutcomeId, i64>,

    /// Creation timestamp (Unix millis)
    pub created_at: i64,

    /// Last mutation timestamp (Unix millis)
    pub updated_at: i64,
}

impl Position {
    pub fn new(id: String, user_id: UserId, market_id: MarketId, created_at: i64) -> Self {
        Self {
            id,
            user_id,
            market_id,
            holdings: BTreeMap::new(),
            created_at,
            updated_at: created_at,
        }
    }

    /// Signed micro-contract holding for an outcome (0 when absent).
    pub fn holding_e6(&self, outcome_id: &str) -> i64 {
        self.holdings.get(outcome_id).copied().unwrap_or(0)
    }

    /// Apply a signed micro-contract delta, dropping the entry at zero.
    pub fn apply_delta(&mut self, outcome_id: &str, delta_e6: i64, now_ms: i64) {
        let next = self.holding_e6(outcome_id) + delta_e6;
        if next == 0 {
            self.holdings.remove(outcome_id);
        } else {
            self.holdings.insert(outcome_id.to_string(), next);
        }
        self.updated_at = now_ms;
    }

    pub fn is_empty(&self) -> bool {
        self.holdings.is_empty()
    }

    /// Settlement credit (signed micro-currency) if `winning_outcome_id`
    /// wins: every winning micro-contract pays one micro-currency unit, and
    /// a short holding settles as the mirrored liability.
    pub fn payout_e6(&self, winning_outcome_id: &str) -> i64 {
        self.holding_e6(winning_outcome_id)
    }
}

/// One participant's leg of an execution.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecutionParticipant {
    pub user_id: UserId,

    pub outcome_id: OutcomeId,

    pub direction: OrderDirection,

    /// Headline contracts traded (whole contracts)
    pub quantity: u64,

    /// Effective price paid or received per contract (micro-currency)
    pub price_e6: u64,
}

/// An executed match. Append-only audit record.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub id: ExecutionId,

    pub market_id: MarketId,

    /// Execution timestamp (Unix millis)
    pub timestamp_ms: i64,

    pub participants: Vec<ExecutionParticipant>,
}

// ============================================================================
// Read views
// ============================================================================

/// A market together with its outcomes, as returned by market creation and
/// market queries.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct MarketWithOutcomes {
    pub market: Market,
    pub outcomes: Vec<Outcome>,
}

/// Aggregated quantity resting at one price.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct BookLevel {
    pub price_e6: u64,
    pub quantity: u64,
}

/// Bid/ask ladder for one outcome. Bids are sorted best (highest) first,
/// asks best (lowest) first.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutcomeBook {
    pub outcome_id: OutcomeId,
    pub number: u16,
    pub description: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

/// Full order book view of one market.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct OrderBookView {
    pub market_id: MarketId,
    pub outcomes: Vec<OutcomeBook>,
}

/// One page of open markets, oldest first.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct OpenMarketsPage {
    pub markets: Vec<Market>,
    /// Total number of open markets, independent of paging
    pub total: u64,
}

/// One user's settlement credit from a market resolution.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub user_id: UserId,
    /// Signed micro-currency: negative settles a short liability
    pub amount_e6: i64,
}

/// Summary returned by market resolution.
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResolveSummary {
    pub market_id: MarketId,
    pub winning_outcome_id: OutcomeId,
    pub payouts: Vec<Payout>,
    /// Sum of positive payouts (micro-currency)
    pub total_paid_e6: u64,
    /// Number of users credited a positive payout
    pub winner_count: u64,
}

//! Settlement events published to subscribers after each committed operation.

use crate::address::Address;
use crate::clock::UnixSecs;
use crate::ledger::Amount;
use crate::settlement::market::Side;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Capacity of the broadcast channel. Slow subscribers see `Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub event_id: Uuid,
    pub market: Address,
    pub at: UnixSecs,
    pub kind: SettlementEventKind,
}

impl SettlementEvent {
    pub fn new(market: Address, at: UnixSecs, kind: SettlementEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            market,
            at,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEventKind {
    MarketCreated {
        creator: Address,
        seed: u64,
        deposit: Amount,
    },
    BetPlaced {
        bettor: Address,
        side: Side,
        amount: Amount,
        bettor_count: u64,
    },
    MarketResolved {
        observed: u64,
        winning_side: Side,
        /// Nobody backed the winning side; all stakes are refunded.
        void: bool,
    },
    MarketCancelled,
    PayoutClaimed {
        bettor: Address,
        side: Side,
        payout: Amount,
        fee: Amount,
    },
    FeesClaimed {
        creator: Address,
        amount: Amount,
    },
    MarketClosed {
        creator: Address,
        returned_float: Amount,
    },
}

impl SettlementEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MarketCreated { .. } => "market_created",
            Self::BetPlaced { .. } => "bet_placed",
            Self::MarketResolved { .. } => "market_resolved",
            Self::MarketCancelled => "market_cancelled",
            Self::PayoutClaimed { .. } => "payout_claimed",
            Self::FeesClaimed { .. } => "fees_claimed",
            Self::MarketClosed { .. } => "market_closed",
        }
    }
}

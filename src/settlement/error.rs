//! Settlement error taxonomy.
//!
//! Every rejection happens before any state mutation. `class()` groups the
//! variants by what the caller can do about them.

use crate::address::Address;
use crate::clock::UnixSecs;
use crate::ledger::{Amount, LedgerError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad category of a failure, shared with the computation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Bad input; retry with corrected input.
    Validation,
    /// Wrong signer for the operation.
    Authority,
    /// Conflicts with current state (duplicate, already terminal, full).
    StateConflict,
    /// Not yet possible; wait and retry.
    NotReady,
    /// An external wait exceeded its bound.
    ExternalTimeout,
    /// Internal accounting would break; the operation was aborted.
    Conservation,
    /// Failure reported by an external collaborator.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// Market terms failed validation.
    InvalidTerms(String),
    /// Unsupported comparison operator symbol.
    InvalidOperator(String),
    /// Stake differs from the market's required amount.
    InvalidBetAmount { expected: Amount, got: Amount },
    /// Caller is not the market creator.
    Unauthorized { action: &'static str, caller: Address },
    /// Caller is not the configured resolver authority.
    UnauthorizedResolver { caller: Address },
    /// `(creator, seed)` already names a market.
    AccountInUse { market: Address },
    /// No market at this address.
    MarketNotFound { market: Address },
    /// Bettor has no record on this market.
    BetNotFound { market: Address, bettor: Address },
    /// Bettor already holds a record on this market.
    AlreadyBet { bettor: Address },
    /// All bettor slots are taken.
    MarketFull { max_player_count: u64 },
    AlreadyResolved,
    /// Market was cancelled; only refunds remain.
    MarketCancelled,
    AlreadyClaimed,
    /// Betting window is over.
    BettingClosed { market_end: UnixSecs, now: UnixSecs },
    /// Resolution is not allowed before the market ends.
    MarketNotEnded { market_end: UnixSecs, now: UnixSecs },
    /// Market is neither resolved nor cancelled.
    MarketNotSettled,
    /// Market cannot be closed while value or claims remain.
    OutstandingClaims { unclaimed_records: u64, fee_balance: Amount },
    /// Ledger rejected a transfer.
    Ledger(LedgerError),
    /// Computed movement would break `vault == principal + fees + float`.
    ConservationViolation(String),
    MathOverflow,
}

impl SettlementError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidTerms(_)
            | Self::InvalidOperator(_)
            | Self::InvalidBetAmount { .. }
            | Self::MarketNotFound { .. }
            | Self::BetNotFound { .. } => ErrorClass::Validation,
            Self::Unauthorized { .. } | Self::UnauthorizedResolver { .. } => ErrorClass::Authority,
            Self::AccountInUse { .. }
            | Self::AlreadyBet { .. }
            | Self::MarketFull { .. }
            | Self::AlreadyResolved
            | Self::MarketCancelled
            | Self::AlreadyClaimed
            | Self::BettingClosed { .. } => ErrorClass::StateConflict,
            Self::MarketNotEnded { .. } | Self::MarketNotSettled | Self::OutstandingClaims { .. } => {
                ErrorClass::NotReady
            }
            Self::Ledger(_) => ErrorClass::External,
            Self::ConservationViolation(_) | Self::MathOverflow => ErrorClass::Conservation,
        }
    }
}

impl fmt::Display for SettlementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTerms(reason) => write!(f, "invalid market terms: {}", reason),
            Self::InvalidOperator(symbol) => {
                write!(f, "the relational operator {:?} is invalid", symbol)
            }
            Self::InvalidBetAmount { expected, got } => {
                write!(f, "bet amount {} is invalid, market requires {}", got, expected)
            }
            Self::Unauthorized { action, caller } => {
                write!(f, "{} is not authorized to {}", caller.short(), action)
            }
            Self::UnauthorizedResolver { caller } => {
                write!(f, "unauthorized resolver authority {}", caller.short())
            }
            Self::AccountInUse { market } => write!(f, "market {} already exists", market.short()),
            Self::MarketNotFound { market } => write!(f, "market {} not found", market.short()),
            Self::BetNotFound { market, bettor } => write!(
                f,
                "no bet from {} on market {}",
                bettor.short(),
                market.short()
            ),
            Self::AlreadyBet { bettor } => write!(f, "{} has already bet", bettor.short()),
            Self::MarketFull { max_player_count } => {
                write!(f, "maximum number of players reached ({})", max_player_count)
            }
            Self::AlreadyResolved => write!(f, "market already resolved"),
            Self::MarketCancelled => write!(f, "market was cancelled"),
            Self::AlreadyClaimed => write!(f, "bet already claimed"),
            Self::BettingClosed { market_end, now } => {
                write!(f, "betting closed at {} (now {})", market_end, now)
            }
            Self::MarketNotEnded { market_end, now } => {
                write!(f, "market has not ended yet: ends {} (now {})", market_end, now)
            }
            Self::MarketNotSettled => write!(f, "market is neither resolved nor cancelled"),
            Self::OutstandingClaims {
                unclaimed_records,
                fee_balance,
            } => write!(
                f,
                "market still holds {} unclaimed records and {} in fees",
                unclaimed_records, fee_balance
            ),
            Self::Ledger(e) => write!(f, "ledger transfer failed: {}", e),
            Self::ConservationViolation(detail) => {
                write!(f, "CONSERVATION VIOLATION (aborted): {}", detail)
            }
            Self::MathOverflow => write!(f, "math operation overflowed"),
        }
    }
}

impl std::error::Error for SettlementError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Ledger(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LedgerError> for SettlementError {
    fn from(e: LedgerError) -> Self {
        Self::Ledger(e)
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;

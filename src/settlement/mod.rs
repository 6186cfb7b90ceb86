//! Market Settlement
//!
//! Fixed-stake binary markets held in escrow:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    SettlementEngine                      │
//! │  (authority + timing checks, one mutex per market)       │
//! └───────────────┬───────────────────────────┬──────────────┘
//!                 ▼                           ▼
//!          ┌─────────────┐             ┌─────────────┐
//!          │   Market    │             │  Treasury   │──▶ Ledger (vault)
//!          │ + BetRecord │             │ (pools)     │
//!          └─────────────┘             └─────────────┘
//! ```
//!
//! Every committed operation is published as a `SettlementEvent`.

pub mod engine;
pub mod error;
pub mod events;
pub mod market;
pub mod treasury;

pub use engine::{ClaimKind, ClaimReceipt, SettlementEngine, TreasuryAudit};
pub use error::{ErrorClass, SettlementError, SettlementResult};
pub use events::{SettlementEvent, SettlementEventKind};
pub use market::{BetRecord, ComparisonOp, Market, MarketStatus, MarketTerms, Side};
pub use treasury::{PayoutQuote, Treasury};

#[cfg(test)]
mod payout_tests;

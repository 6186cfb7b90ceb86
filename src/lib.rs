//! Escrow Settlement Library
//!
//! Two subsystems:
//! - `settlement`: fixed-stake binary markets held in escrow, resolved by a
//!   configured authority, paid out pro rata with a protocol fee.
//! - `confidential`: encrypted computation jobs submitted to an external
//!   cluster and awaited with bounded polling.
//!
//! `game` joins the two: encrypted card games seated by market bets.
//!
//! Value moves only through the `ledger::Ledger` boundary; time comes only
//! from a `clock::Clock`.

pub mod address;
pub mod clock;
pub mod confidential;
pub mod config;
pub mod game;
pub mod ledger;
pub mod settlement;
pub mod telemetry;

pub use address::Address;
pub use confidential::{ComputationClient, ComputationError};
pub use config::{ComputationConfig, Config, SettlementConfig};
pub use game::{GameError, GameTable};
pub use ledger::{Amount, InMemoryLedger, Ledger, LedgerError};
pub use settlement::{SettlementEngine, SettlementError};

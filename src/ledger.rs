//! Host Ledger Boundary
//!
//! The settlement engine never touches balances directly. All value movement
//! goes through `Ledger::transfer`, which is atomic: either both sides of the
//! transfer are applied or neither is.
//!
//! `InMemoryLedger` is the in-process implementation used by simulations and
//! tests. It keeps an append-only journal of applied transfers so totals can
//! be audited after the fact.

use crate::address::Address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Smallest indivisible unit of the escrowed asset.
pub type Amount = u64;

/// Errors surfaced by the ledger collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Source account cannot cover the transfer.
    InsufficientFunds {
        account: Address,
        needed: Amount,
        available: Amount,
    },
    /// Crediting the destination would overflow.
    Overflow { account: Address },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientFunds {
                account,
                needed,
                available,
            } => write!(
                f,
                "insufficient funds in {}: needed {}, available {}",
                account.short(),
                needed,
                available
            ),
            Self::Overflow { account } => write!(f, "balance overflow in {}", account.short()),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Atomic debit/credit primitives of the host ledger.
pub trait Ledger: Send + Sync {
    /// Current balance of an account (zero if never seen).
    fn balance(&self, account: &Address) -> Amount;

    /// Move `amount` from `from` to `to`. Fails without effect on
    /// insufficient balance.
    fn transfer(&self, from: &Address, to: &Address, amount: Amount) -> Result<(), LedgerError>;
}

/// One applied transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub seq: u64,
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<Address, Amount>,
    journal: Vec<TransferRecord>,
    minted: Amount,
}

/// In-process ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an account out of thin air (test funding).
    pub fn fund(&self, account: &Address, amount: Amount) {
        let mut state = self.state.lock();
        let balance = state.balances.entry(*account).or_insert(0);
        *balance = balance.saturating_add(amount);
        state.minted = state.minted.saturating_add(amount);
    }

    /// Total ever funded; equals the sum of all balances.
    pub fn total_supply(&self) -> Amount {
        self.state.lock().minted
    }

    /// Sum of all balances.
    pub fn total_balances(&self) -> Amount {
        self.state.lock().balances.values().sum()
    }

    /// Snapshot of applied transfers.
    pub fn journal(&self) -> Vec<TransferRecord> {
        self.state.lock().journal.clone()
    }
}

impl Ledger for InMemoryLedger {
    fn balance(&self, account: &Address) -> Amount {
        self.state.lock().balances.get(account).copied().unwrap_or(0)
    }

    fn transfer(&self, from: &Address, to: &Address, amount: Amount) -> Result<(), LedgerError> {
        let mut state = self.state.lock();

        let available = state.balances.get(from).copied().unwrap_or(0);
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                account: *from,
                needed: amount,
                available,
            });
        }
        if from == to || amount == 0 {
            return Ok(());
        }
        let dest = state.balances.get(to).copied().unwrap_or(0);
        let credited = dest
            .checked_add(amount)
            .ok_or(LedgerError::Overflow { account: *to })?;

        state.balances.insert(*from, available - amount);
        state.balances.insert(*to, credited);

        let seq = state.journal.len() as u64;
        state.journal.push(TransferRecord {
            seq,
            from: *from,
            to: *to,
            amount,
        });
        Ok(())
    }
}

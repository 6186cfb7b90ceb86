//! Treasury Accounting
//!
//! Each market owns exactly one vault account on the host ledger. The
//! treasury is the engine's view of what that vault holds, partitioned as
//!
//! ```text
//! vault balance == principal_pool + fee_balance + operational_float
//! ```
//!
//! # Payout rule
//!
//! For a winning record with stake `s`, winning-side total `W` and losing-side
//! total `L`:
//!
//! - `share  = floor(s * L / W)` (u128 intermediate)
//! - `fee    = floor(share * fee_bps / 10_000)`
//! - `payout = s + share - fee`
//!
//! Flooring leaves `L - sum(shares)` unpaid. That residual moves from the
//! principal pool to the fee balance when the last winning record claims, so
//! the pool drains to exactly zero and a payout can never overdraw it.

use crate::address::Address;
use crate::config::BPS_DENOMINATOR;
use crate::ledger::Amount;
use crate::settlement::error::{SettlementError, SettlementResult};
use crate::settlement::market::Side;
use serde::{Deserialize, Serialize};

// =============================================================================
// PURE PAYOUT MATH
// =============================================================================

/// Proportional share of the losing pool owed to `stake`.
pub fn winnings_share(
    stake: Amount,
    winning_total: Amount,
    losing_total: Amount,
) -> SettlementResult<Amount> {
    if winning_total == 0 {
        return Ok(0);
    }
    let share = (stake as u128) * (losing_total as u128) / (winning_total as u128);
    Amount::try_from(share).map_err(|_| SettlementError::MathOverflow)
}

/// Protocol fee on a winnings share.
#[inline]
pub fn protocol_fee(share: Amount, fee_bps: u16) -> Amount {
    // fee_bps <= 10_000 so the result never exceeds `share`
    ((share as u128) * (fee_bps as u128) / (BPS_DENOMINATOR as u128)) as Amount
}

/// Breakdown of one winning claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutQuote {
    pub stake: Amount,
    pub share: Amount,
    pub fee: Amount,
    /// Rounding residual swept into fees (non-zero only for the last winner).
    pub residual: Amount,
    /// Amount transferred to the bettor.
    pub payout: Amount,
}

// =============================================================================
// TREASURY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Treasury {
    pub market: Address,
    pub vault: Address,
    /// Stakes not yet paid out.
    pub principal_pool: Amount,
    /// Fees withheld from winnings plus rounding residual.
    pub fee_balance: Amount,
    /// Creation deposit, returned on close.
    pub operational_float: Amount,
    pub yes_stake: Amount,
    pub no_stake: Amount,
    pub yes_count: u64,
    pub no_count: u64,
    /// Losing-side stake not yet distributed as winnings.
    pub losing_pool_remaining: Amount,
    /// Winning records that have not claimed yet.
    pub winners_unclaimed: u64,
    /// Set when the market resolved to a side nobody backed.
    pub void: bool,
}

impl Treasury {
    pub fn new(market: Address, operational_float: Amount) -> Self {
        Self {
            market,
            vault: Address::treasury_vault(&market),
            principal_pool: 0,
            fee_balance: 0,
            operational_float,
            yes_stake: 0,
            no_stake: 0,
            yes_count: 0,
            no_count: 0,
            losing_pool_remaining: 0,
            winners_unclaimed: 0,
            void: false,
        }
    }

    pub fn side_stake(&self, side: Side) -> Amount {
        match side {
            Side::Yes => self.yes_stake,
            Side::No => self.no_stake,
        }
    }

    pub fn side_count(&self, side: Side) -> u64 {
        match side {
            Side::Yes => self.yes_count,
            Side::No => self.no_count,
        }
    }

    /// Balance the vault must hold.
    pub fn expected_vault_balance(&self) -> SettlementResult<Amount> {
        self.principal_pool
            .checked_add(self.fee_balance)
            .and_then(|v| v.checked_add(self.operational_float))
            .ok_or(SettlementError::MathOverflow)
    }

    /// Treasury after accepting one stake. `self` is untouched so the caller
    /// can commit only once the ledger transfer succeeds.
    pub fn with_stake(&self, side: Side, amount: Amount) -> SettlementResult<Self> {
        let mut next = self.clone();
        next.principal_pool = next
            .principal_pool
            .checked_add(amount)
            .ok_or(SettlementError::MathOverflow)?;
        match side {
            Side::Yes => {
                next.yes_stake = next
                    .yes_stake
                    .checked_add(amount)
                    .ok_or(SettlementError::MathOverflow)?;
                next.yes_count += 1;
            }
            Side::No => {
                next.no_stake = next
                    .no_stake
                    .checked_add(amount)
                    .ok_or(SettlementError::MathOverflow)?;
                next.no_count += 1;
            }
        }
        next.expected_vault_balance()?;
        Ok(next)
    }

    /// Freeze the pools at resolution. A winning side with no stake voids the
    /// market and every record becomes refundable.
    pub fn settle(&mut self, winning_side: Side) {
        if self.side_stake(winning_side) == 0 {
            self.void = true;
            self.losing_pool_remaining = 0;
            self.winners_unclaimed = 0;
        } else {
            self.losing_pool_remaining = self.side_stake(winning_side.opposite());
            self.winners_unclaimed = self.side_count(winning_side);
        }
    }

    /// Price a winning claim without mutating anything.
    pub fn quote_winning_claim(
        &self,
        stake: Amount,
        winning_side: Side,
        fee_bps: u16,
    ) -> SettlementResult<PayoutQuote> {
        let winning_total = self.side_stake(winning_side);
        let losing_total = self.side_stake(winning_side.opposite());
        let share = winnings_share(stake, winning_total, losing_total)?;
        let fee = protocol_fee(share, fee_bps);

        if share > self.losing_pool_remaining {
            return Err(SettlementError::ConservationViolation(format!(
                "share {} exceeds remaining losing pool {}",
                share, self.losing_pool_remaining
            )));
        }
        if self.winners_unclaimed == 0 {
            return Err(SettlementError::ConservationViolation(
                "winning claim with no winners outstanding".into(),
            ));
        }
        let residual = if self.winners_unclaimed == 1 {
            self.losing_pool_remaining - share
        } else {
            0
        };
        let gross = stake
            .checked_add(share)
            .and_then(|v| v.checked_add(residual))
            .ok_or(SettlementError::MathOverflow)?;
        if gross > self.principal_pool {
            return Err(SettlementError::ConservationViolation(format!(
                "claim of {} exceeds principal pool {}",
                gross, self.principal_pool
            )));
        }

        Ok(PayoutQuote {
            stake,
            share,
            fee,
            residual,
            payout: stake + share - fee,
        })
    }

    /// Apply a quote produced by `quote_winning_claim` after the payout
    /// transfer succeeded.
    pub fn apply_winning_claim(&mut self, quote: &PayoutQuote) {
        self.principal_pool -= quote.stake + quote.share + quote.residual;
        self.fee_balance += quote.fee + quote.residual;
        self.losing_pool_remaining -= quote.share + quote.residual;
        self.winners_unclaimed -= 1;
    }

    /// Check a full-stake refund can be paid from the pool.
    pub fn check_refund(&self, stake: Amount) -> SettlementResult<()> {
        if stake > self.principal_pool {
            return Err(SettlementError::ConservationViolation(format!(
                "refund of {} exceeds principal pool {}",
                stake, self.principal_pool
            )));
        }
        Ok(())
    }

    pub fn apply_refund(&mut self, stake: Amount) {
        self.principal_pool -= stake;
    }

    /// Zero the fee balance, returning what it held.
    pub fn take_fees(&mut self) -> Amount {
        std::mem::take(&mut self.fee_balance)
    }

    /// Zero the operational float, returning what it held.
    pub fn take_float(&mut self) -> Amount {
        std::mem::take(&mut self.operational_float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: Amount = 1_000_000_000;

    fn funded(yes: u64, no: u64, stake: Amount) -> Treasury {
        let mut t = Treasury::new(Address::random(), 0);
        for _ in 0..yes {
            t = t.with_stake(Side::Yes, stake).unwrap();
        }
        for _ in 0..no {
            t = t.with_stake(Side::No, stake).unwrap();
        }
        t
    }

    #[test]
    fn test_share_and_fee_floor() {
        assert_eq!(winnings_share(UNIT, 2 * UNIT, UNIT).unwrap(), UNIT / 2);
        assert_eq!(winnings_share(1, 3, 1).unwrap(), 0);
        assert_eq!(winnings_share(5, 0, 10).unwrap(), 0);
        assert_eq!(protocol_fee(UNIT / 2, 200), 10_000_000);
        assert_eq!(protocol_fee(49, 200), 0);
        assert_eq!(protocol_fee(100, 10_000), 100);
    }

    #[test]
    fn test_share_handles_large_products() {
        let big = u64::MAX / 2;
        assert_eq!(winnings_share(big, big, big).unwrap(), big);
    }

    #[test]
    fn test_with_stake_leaves_original_untouched() {
        let t = Treasury::new(Address::random(), 7);
        let next = t.with_stake(Side::No, 10).unwrap();
        assert_eq!(t.principal_pool, 0);
        assert_eq!(next.principal_pool, 10);
        assert_eq!(next.no_count, 1);
        assert_eq!(next.expected_vault_balance().unwrap(), 17);
    }

    #[test]
    fn test_last_winner_sweeps_residual() {
        // 3 YES, 1 NO with stake 1: shares floor to 0, residual 1 goes to fees
        let mut t = funded(3, 1, 1);
        t.settle(Side::Yes);
        assert_eq!(t.winners_unclaimed, 3);

        for i in 0..3 {
            let q = t.quote_winning_claim(1, Side::Yes, 200).unwrap();
            assert_eq!(q.payout, 1);
            assert_eq!(q.residual, if i == 2 { 1 } else { 0 }, "residual only on last claim");
            t.apply_winning_claim(&q);
        }
        assert_eq!(t.principal_pool, 0);
        assert_eq!(t.fee_balance, 1);
        assert_eq!(t.losing_pool_remaining, 0);
    }

    #[test]
    fn test_settle_void_when_winning_side_empty() {
        let mut t = funded(0, 2, UNIT);
        t.settle(Side::Yes);
        assert!(t.void);
        assert_eq!(t.winners_unclaimed, 0);
        assert!(t.quote_winning_claim(UNIT, Side::Yes, 200).is_err());
    }

    #[test]
    fn test_refund_cannot_overdraw() {
        let t = funded(1, 0, 5);
        assert!(t.check_refund(5).is_ok());
        assert!(matches!(
            t.check_refund(6),
            Err(SettlementError::ConservationViolation(_))
        ));
    }

    #[test]
    fn test_take_fees_zeroes_balance() {
        let mut t = Treasury::new(Address::random(), 0);
        t.fee_balance = 42;
        assert_eq!(t.take_fees(), 42);
        assert_eq!(t.take_fees(), 0);
    }
}

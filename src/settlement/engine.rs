//! Settlement Engine
//!
//! Orchestrates the market lifecycle:
//!
//! ```text
//! create ─▶ Open ──bet*──▶ Open ──resolve──▶ Resolved ──claim*/claim_fees──▶ close
//!                 └──────────cancel────────▶ Cancelled ──claim*──────────────▶ close
//! ```
//!
//! # Atomicity
//!
//! Each market lives behind its own mutex, so every operation on a market is
//! serialized. Operations validate first, then perform the single ledger
//! transfer (which either applies fully or not at all), and only then commit
//! the in-memory state. A rejected operation leaves nothing behind.
//!
//! # Lock order
//!
//! `markets` (map) before any market mutex. Only `create` and `close` take
//! the map write lock; everything else clones the market handle under a read
//! lock and drops it before locking the market.

use crate::address::Address;
use crate::clock::{Clock, UnixSecs};
use crate::config::SettlementConfig;
use crate::ledger::{Amount, Ledger};
use crate::settlement::error::{SettlementError, SettlementResult};
use crate::settlement::events::{SettlementEvent, SettlementEventKind, EVENT_CHANNEL_CAPACITY};
use crate::settlement::market::{BetRecord, Market, MarketStatus, MarketTerms, Side};
use crate::settlement::treasury::Treasury;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

// =============================================================================
// RECEIPTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    /// Cancelled or void market: full stake back, no fee.
    Refund,
    /// Winning side: stake plus share of the losing pool, less fee.
    Winnings,
    /// Losing side: nothing paid, record marked claimed.
    Forfeit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReceipt {
    pub market: Address,
    pub bettor: Address,
    pub side: Side,
    pub kind: ClaimKind,
    pub stake: Amount,
    pub share: Amount,
    pub fee: Amount,
    pub payout: Amount,
}

/// Result of reconciling a treasury against the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryAudit {
    pub market: Address,
    pub vault_balance: Amount,
    pub principal_pool: Amount,
    pub fee_balance: Amount,
    pub operational_float: Amount,
    pub unclaimed_records: u64,
    /// Sum of stakes on records not yet claimed.
    pub unclaimed_stake: Amount,
}

// =============================================================================
// ENGINE
// =============================================================================

struct MarketBook {
    market: Market,
    treasury: Treasury,
    /// Keyed by bettor.
    bets: HashMap<Address, BetRecord>,
}

impl MarketBook {
    fn unclaimed_records(&self) -> u64 {
        self.bets.values().filter(|b| !b.claimed).count() as u64
    }
}

pub struct SettlementEngine {
    config: SettlementConfig,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    markets: RwLock<HashMap<Address, Arc<Mutex<MarketBook>>>>,
    events: broadcast::Sender<SettlementEvent>,
}

impl SettlementEngine {
    pub fn new(config: SettlementConfig, ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            ledger,
            clock,
            markets: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.events.subscribe()
    }

    fn book(&self, market: &Address) -> SettlementResult<Arc<Mutex<MarketBook>>> {
        self.markets
            .read()
            .get(market)
            .cloned()
            .ok_or(SettlementError::MarketNotFound { market: *market })
    }

    fn publish(&self, market: Address, at: UnixSecs, kind: SettlementEventKind) {
        debug!(market = %market.short(), event = kind.name(), "Publishing settlement event");
        // No subscribers is fine
        let _ = self.events.send(SettlementEvent::new(market, at, kind));
    }

    // =========================================================================
    // CREATE
    // =========================================================================

    /// Create a market for `(creator, seed)` and move the creation deposit
    /// into its vault. Returns the market address.
    pub fn create(
        &self,
        creator: Address,
        seed: u64,
        terms: MarketTerms,
    ) -> SettlementResult<Address> {
        let operator = terms.validate(&self.config).map_err(|e| {
            warn!(creator = %creator.short(), seed, error = %e, "Market terms rejected");
            e
        })?;
        let now = self.clock.now();
        let market = Market::new(creator, seed, terms, operator, now);
        let address = market.address;
        let treasury = Treasury::new(address, self.config.creation_deposit);

        let mut markets = self.markets.write();
        if markets.contains_key(&address) {
            return Err(SettlementError::AccountInUse { market: address });
        }
        self.ledger
            .transfer(&creator, &treasury.vault, self.config.creation_deposit)?;

        info!(
            market = %address.short(),
            creator = %creator.short(),
            seed,
            name = %market.name,
            operator = %market.operator,
            target = market.target_value,
            stake = market.required_bet_amount,
            max_players = market.max_player_count,
            "Market created"
        );
        metrics::increment_counter!("escrow_markets_created_total");

        markets.insert(
            address,
            Arc::new(Mutex::new(MarketBook {
                market,
                treasury,
                bets: HashMap::new(),
            })),
        );
        drop(markets);

        self.publish(
            address,
            now,
            SettlementEventKind::MarketCreated {
                creator,
                seed,
                deposit: self.config.creation_deposit,
            },
        );
        Ok(address)
    }

    // =========================================================================
    // BET
    // =========================================================================

    /// Place the fixed stake on `side`.
    pub fn bet(
        &self,
        market: &Address,
        bettor: Address,
        side: Side,
        amount: Amount,
    ) -> SettlementResult<BetRecord> {
        let book = self.book(market)?;
        let mut book = book.lock();
        let now = self.clock.now();

        book.market.require_open()?;
        if now >= book.market.market_end {
            return Err(SettlementError::BettingClosed {
                market_end: book.market.market_end,
                now,
            });
        }
        if amount != book.market.required_bet_amount {
            return Err(SettlementError::InvalidBetAmount {
                expected: book.market.required_bet_amount,
                got: amount,
            });
        }
        if book.market.bettor_count >= book.market.max_player_count {
            return Err(SettlementError::MarketFull {
                max_player_count: book.market.max_player_count,
            });
        }
        if book.bets.contains_key(&bettor) {
            return Err(SettlementError::AlreadyBet { bettor });
        }
        let treasury = book.treasury.with_stake(side, amount)?;

        self.ledger.transfer(&bettor, &treasury.vault, amount)?;

        let record = BetRecord {
            address: Address::bet(market, &bettor),
            market: *market,
            bettor,
            side,
            amount,
            claimed: false,
        };
        book.treasury = treasury;
        book.bets.insert(bettor, record.clone());
        book.market.bettor_count += 1;
        book.market.updated_at = now;
        let bettor_count = book.market.bettor_count;
        drop(book);

        info!(
            market = %market.short(),
            bettor = %bettor.short(),
            ?side,
            amount,
            bettor_count,
            "Bet placed"
        );
        metrics::increment_counter!("escrow_bets_placed_total");
        self.publish(
            *market,
            now,
            SettlementEventKind::BetPlaced {
                bettor,
                side,
                amount,
                bettor_count,
            },
        );
        Ok(record)
    }

    // =========================================================================
    // RESOLVE / CANCEL
    // =========================================================================

    /// Assert the observed value. Only the configured resolver authority may
    /// call this, and only once the market has ended.
    pub fn resolve(
        &self,
        market: &Address,
        resolver: Address,
        observed: u64,
    ) -> SettlementResult<Side> {
        if resolver != self.config.resolver_authority {
            warn!(
                market = %market.short(),
                resolver = %resolver.short(),
                "Resolve rejected: wrong authority"
            );
            return Err(SettlementError::UnauthorizedResolver { caller: resolver });
        }
        let book = self.book(market)?;
        let mut book = book.lock();
        let now = self.clock.now();

        book.market.require_open()?;
        if now < book.market.market_end {
            return Err(SettlementError::MarketNotEnded {
                market_end: book.market.market_end,
                now,
            });
        }

        let winning_side = book.market.outcome_for(observed);
        book.treasury.settle(winning_side);
        book.market.status = MarketStatus::Resolved { winning_side };
        book.market.resolve_value = Some(observed);
        book.market.updated_at = now;
        let void = book.treasury.void;
        drop(book);

        info!(
            market = %market.short(),
            observed,
            ?winning_side,
            void,
            "Market resolved"
        );
        metrics::increment_counter!("escrow_markets_resolved_total");
        self.publish(
            *market,
            now,
            SettlementEventKind::MarketResolved {
                observed,
                winning_side,
                void,
            },
        );
        Ok(winning_side)
    }

    /// Cancel an open market. Every record becomes refundable in full.
    pub fn cancel(&self, market: &Address, caller: Address) -> SettlementResult<()> {
        let book = self.book(market)?;
        let mut book = book.lock();
        if caller != book.market.creator {
            return Err(SettlementError::Unauthorized {
                action: "cancel",
                caller,
            });
        }
        book.market.require_open()?;

        let now = self.clock.now();
        book.market.status = MarketStatus::Cancelled;
        book.market.updated_at = now;
        let bettors = book.market.bettor_count;
        drop(book);

        info!(market = %market.short(), bettors, "Market cancelled");
        metrics::increment_counter!("escrow_markets_cancelled_total");
        self.publish(*market, now, SettlementEventKind::MarketCancelled);
        Ok(())
    }

    // =========================================================================
    // CLAIMS
    // =========================================================================

    /// Settle one bettor's record. Pays at most once per record.
    pub fn claim(&self, market: &Address, bettor: Address) -> SettlementResult<ClaimReceipt> {
        let book = self.book(market)?;
        let mut book = book.lock();

        let record = book
            .bets
            .get(&bettor)
            .cloned()
            .ok_or(SettlementError::BetNotFound {
                market: *market,
                bettor,
            })?;
        if record.claimed {
            return Err(SettlementError::AlreadyClaimed);
        }

        let fee_bps = self.config.fee_bps;
        let vault = book.treasury.vault;
        let mut receipt = ClaimReceipt {
            market: *market,
            bettor,
            side: record.side,
            kind: ClaimKind::Forfeit,
            stake: record.amount,
            share: 0,
            fee: 0,
            payout: 0,
        };

        let status = book.market.status;
        let void = book.treasury.void;
        match status {
            MarketStatus::Open => return Err(SettlementError::MarketNotSettled),
            MarketStatus::Cancelled => {
                self.refund(&mut book.treasury, &vault, &record, &mut receipt)?;
            }
            MarketStatus::Resolved { .. } if void => {
                self.refund(&mut book.treasury, &vault, &record, &mut receipt)?;
            }
            MarketStatus::Resolved { winning_side } if record.side == winning_side => {
                let quote = book
                    .treasury
                    .quote_winning_claim(record.amount, winning_side, fee_bps)
                    .map_err(|e| {
                        error!(
                            market = %market.short(),
                            bettor = %bettor.short(),
                            error = %e,
                            "Winning claim aborted"
                        );
                        e
                    })?;
                self.ledger.transfer(&vault, &bettor, quote.payout)?;
                book.treasury.apply_winning_claim(&quote);
                receipt.kind = ClaimKind::Winnings;
                receipt.share = quote.share;
                receipt.fee = quote.fee + quote.residual;
                receipt.payout = quote.payout;
            }
            MarketStatus::Resolved { .. } => {
                // Forfeit: the stake already counts toward the winners' shares
            }
        }

        if let Some(r) = book.bets.get_mut(&bettor) {
            r.claimed = true;
        }
        let now = self.clock.now();
        book.market.updated_at = now;
        drop(book);

        info!(
            market = %market.short(),
            bettor = %bettor.short(),
            kind = ?receipt.kind,
            payout = receipt.payout,
            fee = receipt.fee,
            "Claim settled"
        );
        metrics::increment_counter!("escrow_claims_total");
        self.publish(
            *market,
            now,
            SettlementEventKind::PayoutClaimed {
                bettor,
                side: receipt.side,
                payout: receipt.payout,
                fee: receipt.fee,
            },
        );
        Ok(receipt)
    }

    fn refund(
        &self,
        treasury: &mut Treasury,
        vault: &Address,
        record: &BetRecord,
        receipt: &mut ClaimReceipt,
    ) -> SettlementResult<()> {
        treasury.check_refund(record.amount)?;
        self.ledger.transfer(vault, &record.bettor, record.amount)?;
        treasury.apply_refund(record.amount);
        receipt.kind = ClaimKind::Refund;
        receipt.payout = record.amount;
        Ok(())
    }

    /// Sweep the accumulated fee balance to the creator. Returns the amount
    /// moved; zero once already swept.
    pub fn claim_fees(&self, market: &Address, caller: Address) -> SettlementResult<Amount> {
        let book = self.book(market)?;
        let mut book = book.lock();
        if caller != book.market.creator {
            return Err(SettlementError::Unauthorized {
                action: "claim fees",
                caller,
            });
        }
        match book.market.status {
            MarketStatus::Resolved { .. } => {}
            MarketStatus::Cancelled => return Err(SettlementError::MarketCancelled),
            MarketStatus::Open => return Err(SettlementError::MarketNotSettled),
        }

        let amount = book.treasury.fee_balance;
        if amount == 0 {
            debug!(market = %market.short(), "No fees to claim");
            return Ok(0);
        }
        let vault = book.treasury.vault;
        self.ledger.transfer(&vault, &caller, amount)?;
        book.treasury.take_fees();
        let now = self.clock.now();
        book.market.updated_at = now;
        drop(book);

        info!(market = %market.short(), amount, "Fees claimed");
        metrics::increment_counter!("escrow_fee_claims_total");
        self.publish(
            *market,
            now,
            SettlementEventKind::FeesClaimed {
                creator: caller,
                amount,
            },
        );
        Ok(amount)
    }

    /// Return the creation deposit and retire the market. Requires a
    /// terminal market with every record claimed and no fees left.
    pub fn close(&self, market: &Address, caller: Address) -> SettlementResult<Amount> {
        let mut markets = self.markets.write();
        let handle = markets
            .get(market)
            .cloned()
            .ok_or(SettlementError::MarketNotFound { market: *market })?;
        let mut book = handle.lock();

        if caller != book.market.creator {
            return Err(SettlementError::Unauthorized {
                action: "close",
                caller,
            });
        }
        if !book.market.status.is_terminal() {
            return Err(SettlementError::MarketNotSettled);
        }
        let unclaimed_records = book.unclaimed_records();
        if unclaimed_records > 0 || book.treasury.fee_balance > 0 {
            return Err(SettlementError::OutstandingClaims {
                unclaimed_records,
                fee_balance: book.treasury.fee_balance,
            });
        }

        let float = book.treasury.operational_float;
        let vault = book.treasury.vault;
        self.ledger.transfer(&vault, &caller, float)?;
        book.treasury.take_float();
        drop(book);
        markets.remove(market);
        drop(markets);

        let now = self.clock.now();
        info!(market = %market.short(), returned_float = float, "Market closed");
        self.publish(
            *market,
            now,
            SettlementEventKind::MarketClosed {
                creator: caller,
                returned_float: float,
            },
        );
        Ok(float)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn market(&self, market: &Address) -> Option<Market> {
        self.book(market).ok().map(|b| {
            let book = b.lock();
            book.market.clone()
        })
    }

    pub fn treasury(&self, market: &Address) -> Option<Treasury> {
        self.book(market).ok().map(|b| {
            let book = b.lock();
            book.treasury.clone()
        })
    }

    pub fn bet_record(&self, market: &Address, bettor: &Address) -> Option<BetRecord> {
        self.book(market).ok().and_then(|b| {
            let book = b.lock();
            book.bets.get(bettor).cloned()
        })
    }

    /// Addresses of all live markets.
    pub fn markets(&self) -> Vec<Address> {
        self.markets.read().keys().copied().collect()
    }

    /// Reconcile the treasury of `market` against the ledger.
    pub fn audit(&self, market: &Address) -> SettlementResult<TreasuryAudit> {
        let book = self.book(market)?;
        let book = book.lock();
        let vault_balance = self.ledger.balance(&book.treasury.vault);
        let expected = book.treasury.expected_vault_balance()?;
        if vault_balance != expected {
            error!(
                market = %market.short(),
                vault_balance,
                expected,
                "Vault balance does not match treasury"
            );
            return Err(SettlementError::ConservationViolation(format!(
                "vault holds {} but treasury accounts for {}",
                vault_balance, expected
            )));
        }
        let unclaimed_stake: Amount = book
            .bets
            .values()
            .filter(|b| !b.claimed)
            .map(|b| b.amount)
            .sum();
        Ok(TreasuryAudit {
            market: *market,
            vault_balance,
            principal_pool: book.treasury.principal_pool,
            fee_balance: book.treasury.fee_balance,
            operational_float: book.treasury.operational_float,
            unclaimed_records: book.unclaimed_records(),
            unclaimed_stake,
        })
    }
}

impl std::fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementEngine")
            .field("config", &self.config)
            .field("markets", &self.markets.read().len())
            .finish()
    }
}

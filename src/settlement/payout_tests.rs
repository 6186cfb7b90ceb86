//! Payout and Conservation Tests
//!
//! Verifies that resolution never creates or destroys value:
//! winning payouts + fee balance == total staked, for seeded random
//! distributions and the degenerate single-winner / no-winner cases.

use crate::address::Address;
use crate::clock::ManualClock;
use crate::config::SettlementConfig;
use crate::ledger::{Amount, InMemoryLedger, Ledger};
use crate::settlement::{ClaimKind, MarketTerms, SettlementEngine, SettlementError, Side};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

const END: i64 = 2_000;

type Fixture = (SettlementEngine, Arc<InMemoryLedger>, Arc<ManualClock>, Address, Address);

fn setup(fee_bps: u16) -> Fixture {
    let resolver = Address::random();
    let config = SettlementConfig {
        fee_bps,
        resolver_authority: resolver,
        ..SettlementConfig::default()
    };
    let ledger = Arc::new(InMemoryLedger::new());
    let clock = Arc::new(ManualClock::new(0));
    let creator = Address::random();
    ledger.fund(&creator, config.creation_deposit);
    let engine = SettlementEngine::new(config, ledger.clone(), clock.clone());
    (engine, ledger, clock, resolver, creator)
}

fn terms(stake: Amount, max_players: u64) -> MarketTerms {
    MarketTerms {
        name: "SOL market".into(),
        description: "SOL above target".into(),
        token: "SOL".into(),
        market_start: 0,
        market_end: END,
        operator: ">".into(),
        target_value: 100,
        required_bet_amount: stake,
        max_player_count: max_players,
    }
}

/// Place bets, resolve YES, claim everything. Returns (sum of winning
/// payouts, fee balance before sweep).
fn run_market(stake: Amount, yes: usize, no: usize, fee_bps: u16) -> (Amount, Amount) {
    let (engine, ledger, clock, resolver, creator) = setup(fee_bps);
    let market = engine
        .create(creator, 1, terms(stake, (yes + no) as u64))
        .unwrap();

    let mut bettors = Vec::new();
    for i in 0..yes + no {
        let who = Address::random();
        ledger.fund(&who, stake);
        let side = if i < yes { Side::Yes } else { Side::No };
        engine.bet(&market, who, side, stake).unwrap();
        bettors.push((who, side));

        let audit = engine.audit(&market).unwrap();
        assert_eq!(audit.principal_pool, audit.unclaimed_stake);
    }

    clock.advance_to(END);
    assert_eq!(engine.resolve(&market, resolver, 101).unwrap(), Side::Yes);

    let mut paid = 0;
    for (who, side) in &bettors {
        let receipt = engine.claim(&market, *who).unwrap();
        assert_eq!(receipt.side, *side);
        assert_eq!(ledger.balance(who), receipt.payout);
        paid += receipt.payout;
        engine.audit(&market).unwrap();
    }

    let treasury = engine.treasury(&market).unwrap();
    assert_eq!(treasury.principal_pool, 0, "principal fully distributed");
    assert_eq!(treasury.losing_pool_remaining, 0);
    (paid, treasury.fee_balance)
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[test]
fn test_two_yes_one_no_resolved_yes() {
    let stake: Amount = 1_000_000_000;
    let (engine, ledger, clock, resolver, creator) = setup(200);
    let market = engine.create(creator, 1, terms(stake, 3)).unwrap();

    let yes_a = Address::random();
    let yes_b = Address::random();
    let no_c = Address::random();
    for (who, side) in [(yes_a, Side::Yes), (yes_b, Side::Yes), (no_c, Side::No)] {
        ledger.fund(&who, stake);
        engine.bet(&market, who, side, stake).unwrap();
    }
    clock.advance_to(END);
    engine.resolve(&market, resolver, 150).unwrap();

    // share = 1 * 1/2 of the losing pool, fee = 2% of the share
    let share = stake / 2;
    let fee = share / 50;
    for who in [yes_a, yes_b] {
        let receipt = engine.claim(&market, who).unwrap();
        assert_eq!(receipt.kind, ClaimKind::Winnings);
        assert_eq!(receipt.share, share);
        assert_eq!(receipt.fee, fee);
        assert_eq!(receipt.payout, stake + share - fee);
    }
    let losing = engine.claim(&market, no_c).unwrap();
    assert_eq!(losing.payout, 0);
    assert_eq!(ledger.balance(&no_c), 0);

    assert_eq!(engine.treasury(&market).unwrap().fee_balance, 2 * fee);
    assert_eq!(engine.claim_fees(&market, creator).unwrap(), 2 * fee);
}

#[test]
fn test_single_unit_stakes_residual_goes_to_fees() {
    // stake 1: shares floor to zero, the whole losing unit lands in fees
    let (paid, fees) = run_market(1, 2, 1, 200);
    assert_eq!(paid, 2);
    assert_eq!(fees, 1);
    assert_eq!(paid + fees, 3);
}

#[test]
fn test_single_winner_takes_losing_pool() {
    let stake = 1_000;
    let (paid, fees) = run_market(stake, 1, 4, 200);
    // share 4000, fee 80
    assert_eq!(paid, stake + 4 * stake - 80);
    assert_eq!(fees, 80);
    assert_eq!(paid + fees, 5 * stake);
}

#[test]
fn test_no_losers_returns_stakes_fee_free() {
    let stake = 777;
    let (paid, fees) = run_market(stake, 3, 0, 200);
    assert_eq!(paid, 3 * stake);
    assert_eq!(fees, 0);
}

#[test]
fn test_conservation_across_random_distributions() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    for _ in 0..40 {
        let stake: Amount = rng.gen_range(1..=10_000);
        let yes = rng.gen_range(1..=7);
        let no = rng.gen_range(0..=7);
        let fee_bps = rng.gen_range(0..=1_000);

        let (paid, fees) = run_market(stake, yes, no, fee_bps);
        let total = stake * (yes + no) as Amount;
        assert_eq!(
            paid + fees,
            total,
            "stake={} yes={} no={} fee_bps={}",
            stake,
            yes,
            no,
            fee_bps
        );
    }
}

#[test]
fn test_no_winners_voids_and_refunds() {
    let stake = 500;
    let (engine, ledger, clock, resolver, creator) = setup(200);
    let market = engine.create(creator, 1, terms(stake, 4)).unwrap();
    let mut bettors = Vec::new();
    for _ in 0..2 {
        let who = Address::random();
        ledger.fund(&who, stake);
        engine.bet(&market, who, Side::No, stake).unwrap();
        bettors.push(who);
    }
    clock.advance_to(END);
    // 200 > 100 so YES wins, but nobody backed YES
    assert_eq!(engine.resolve(&market, resolver, 200).unwrap(), Side::Yes);
    assert!(engine.treasury(&market).unwrap().void);

    for who in bettors {
        let receipt = engine.claim(&market, who).unwrap();
        assert_eq!(receipt.kind, ClaimKind::Refund);
        assert_eq!(ledger.balance(&who), stake);
    }
    assert_eq!(engine.claim_fees(&market, creator).unwrap(), 0);
    assert_eq!(
        engine.close(&market, creator).unwrap(),
        SettlementConfig::default().creation_deposit
    );
}

#[test]
fn test_partial_claims_keep_vault_balanced() {
    let stake = 3;
    let (engine, ledger, clock, resolver, creator) = setup(200);
    let market = engine.create(creator, 9, terms(stake, 5)).unwrap();
    let mut winners = Vec::new();
    for i in 0..5 {
        let who = Address::random();
        ledger.fund(&who, stake);
        let side = if i % 2 == 0 { Side::Yes } else { Side::No };
        engine.bet(&market, who, side, stake).unwrap();
        if side == Side::Yes {
            winners.push(who);
        }
    }
    clock.advance_to(END);
    engine.resolve(&market, resolver, 1_000).unwrap();

    // claim only some winners; vault must still reconcile
    engine.claim(&market, winners[0]).unwrap();
    let audit = engine.audit(&market).unwrap();
    assert_eq!(
        audit.vault_balance,
        audit.principal_pool + audit.fee_balance + audit.operational_float
    );
    assert!(audit.principal_pool > 0);
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[test]
fn test_concurrent_bets_never_exceed_capacity() {
    let stake = 10;
    let (engine, ledger, _clock, _resolver, creator) = setup(200);
    let engine = Arc::new(engine);
    let market = engine.create(creator, 1, terms(stake, 5)).unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let engine = engine.clone();
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                let who = Address::random();
                ledger.fund(&who, stake);
                let side = Side::from(i % 2 == 0);
                engine.bet(&market, who, side, stake)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let full = results
        .iter()
        .filter(|r| matches!(r, Err(SettlementError::MarketFull { .. })))
        .count();

    assert_eq!(accepted, 5);
    assert_eq!(full, 11);
    let m = engine.market(&market).unwrap();
    assert_eq!(m.bettor_count, 5);
    let audit = engine.audit(&market).unwrap();
    assert_eq!(audit.principal_pool, 5 * stake);
}

#[test]
fn test_concurrent_claims_conserve_value() {
    let stake = 1_000;
    let (engine, ledger, clock, resolver, creator) = setup(150);
    let engine = Arc::new(engine);
    let market = engine.create(creator, 1, terms(stake, 12)).unwrap();
    let mut bettors = Vec::new();
    for i in 0..12 {
        let who = Address::random();
        ledger.fund(&who, stake);
        let side = if i % 3 == 0 { Side::No } else { Side::Yes };
        engine.bet(&market, who, side, stake).unwrap();
        bettors.push(who);
    }
    clock.advance_to(END);
    engine.resolve(&market, resolver, 500).unwrap();

    let handles: Vec<_> = bettors
        .iter()
        .map(|who| {
            let engine = engine.clone();
            let who = *who;
            std::thread::spawn(move || engine.claim(&market, who).map(|r| r.payout))
        })
        .collect();
    let paid: Amount = handles.into_iter().map(|h| h.join().unwrap().unwrap()).sum();

    let fees = engine.treasury(&market).unwrap().fee_balance;
    assert_eq!(paid + fees, 12 * stake);
    engine.audit(&market).unwrap();
}

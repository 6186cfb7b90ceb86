//! Market records: terms, lifecycle status, and per-bettor records.

use crate::address::Address;
use crate::clock::UnixSecs;
use crate::config::SettlementConfig;
use crate::ledger::Amount;
use crate::settlement::error::{SettlementError, SettlementResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Comparison operator
// =============================================================================

/// How the observed value is compared against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Ge,
    Le,
    Eq,
    Gt,
    Lt,
}

impl ComparisonOp {
    pub const ALL: [ComparisonOp; 5] = [Self::Ge, Self::Le, Self::Eq, Self::Gt, Self::Lt];

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Gt => ">",
            Self::Lt => "<",
        }
    }

    /// `observed <op> target`
    #[inline]
    pub fn evaluate(&self, observed: u64, target: u64) -> bool {
        match self {
            Self::Ge => observed >= target,
            Self::Le => observed <= target,
            Self::Eq => observed == target,
            Self::Gt => observed > target,
            Self::Lt => observed < target,
        }
    }
}

impl FromStr for ComparisonOp {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.symbol() == s.trim())
            .ok_or_else(|| SettlementError::InvalidOperator(s.to_string()))
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl Serialize for ComparisonOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

impl<'de> Deserialize<'de> for ComparisonOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Side
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Yes => Self::No,
            Self::No => Self::Yes,
        }
    }
}

impl From<bool> for Side {
    fn from(choice: bool) -> Self {
        if choice {
            Self::Yes
        } else {
            Self::No
        }
    }
}

// =============================================================================
// Terms
// =============================================================================

/// Terms supplied by the creator at market creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketTerms {
    pub name: String,
    pub description: String,
    /// Reference token or symbol the proposition is about.
    pub token: String,
    pub market_start: UnixSecs,
    pub market_end: UnixSecs,
    /// One of `>=`, `<=`, `==`, `>`, `<`.
    pub operator: String,
    pub target_value: u64,
    /// Every bet must stake exactly this amount.
    pub required_bet_amount: Amount,
    /// Maximum number of distinct bettors.
    pub max_player_count: u64,
}

impl MarketTerms {
    /// Validate against deployment limits and return the parsed operator.
    pub fn validate(&self, config: &SettlementConfig) -> SettlementResult<ComparisonOp> {
        if self.market_end <= self.market_start {
            return Err(SettlementError::InvalidTerms(format!(
                "market_end {} must be after market_start {}",
                self.market_end, self.market_start
            )));
        }
        if self.required_bet_amount == 0 {
            return Err(SettlementError::InvalidTerms(
                "required_bet_amount must be positive".into(),
            ));
        }
        if self.max_player_count == 0 {
            return Err(SettlementError::InvalidTerms(
                "max_player_count must be positive".into(),
            ));
        }
        check_len("name", &self.name, config.max_name_len)?;
        check_len("description", &self.description, config.max_description_len)?;
        check_len("token", &self.token, config.max_token_len)?;
        self.operator.parse()
    }
}

fn check_len(field: &str, value: &str, max: usize) -> SettlementResult<()> {
    if value.len() > max {
        return Err(SettlementError::InvalidTerms(format!(
            "{} is {} bytes, limit is {}",
            field,
            value.len(),
            max
        )));
    }
    Ok(())
}

// =============================================================================
// Market
// =============================================================================

/// Lifecycle status. Exactly one holds; `Resolved` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Resolved { winning_side: Side },
    Cancelled,
}

impl MarketStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub address: Address,
    pub creator: Address,
    /// Creator-chosen sequence number.
    pub seed: u64,
    pub name: String,
    pub description: String,
    pub token: String,
    pub market_start: UnixSecs,
    pub market_end: UnixSecs,
    pub operator: ComparisonOp,
    pub target_value: u64,
    pub required_bet_amount: Amount,
    pub max_player_count: u64,
    pub bettor_count: u64,
    pub status: MarketStatus,
    /// Observed value supplied at resolution.
    pub resolve_value: Option<u64>,
    pub created_at: UnixSecs,
    pub updated_at: UnixSecs,
}

impl Market {
    pub(crate) fn new(
        creator: Address,
        seed: u64,
        terms: MarketTerms,
        operator: ComparisonOp,
        now: UnixSecs,
    ) -> Self {
        Self {
            address: Address::market(&creator, seed),
            creator,
            seed,
            name: terms.name,
            description: terms.description,
            token: terms.token,
            market_start: terms.market_start,
            market_end: terms.market_end,
            operator,
            target_value: terms.target_value,
            required_bet_amount: terms.required_bet_amount,
            max_player_count: terms.max_player_count,
            bettor_count: 0,
            status: MarketStatus::Open,
            resolve_value: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == MarketStatus::Open
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.status, MarketStatus::Resolved { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == MarketStatus::Cancelled
    }

    pub fn winning_side(&self) -> Option<Side> {
        match self.status {
            MarketStatus::Resolved { winning_side } => Some(winning_side),
            _ => None,
        }
    }

    /// Side that wins for a given observed value.
    pub fn outcome_for(&self, observed: u64) -> Side {
        Side::from(self.operator.evaluate(observed, self.target_value))
    }

    /// Reject anything but an open market.
    pub(crate) fn require_open(&self) -> SettlementResult<()> {
        match self.status {
            MarketStatus::Open => Ok(()),
            MarketStatus::Resolved { .. } => Err(SettlementError::AlreadyResolved),
            MarketStatus::Cancelled => Err(SettlementError::MarketCancelled),
        }
    }
}

// =============================================================================
// Bet record
// =============================================================================

/// One bettor's stake on one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BetRecord {
    pub address: Address,
    pub market: Address,
    pub bettor: Address,
    pub side: Side,
    pub amount: Amount,
    /// false -> true exactly once.
    pub claimed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms() -> MarketTerms {
        MarketTerms {
            name: "BTC market".into(),
            description: "Will BTC >= 120k today?".into(),
            token: "BTC".into(),
            market_start: 1_000,
            market_end: 4_600,
            operator: ">=".into(),
            target_value: 120_000,
            required_bet_amount: 1_000_000_000,
            max_player_count: 2,
        }
    }

    #[test]
    fn test_operator_parsing_and_evaluation() {
        for op in ComparisonOp::ALL {
            assert_eq!(op.symbol().parse::<ComparisonOp>().unwrap(), op);
        }
        assert!(matches!(
            "=>".parse::<ComparisonOp>(),
            Err(SettlementError::InvalidOperator(_))
        ));

        assert!(ComparisonOp::Ge.evaluate(120_000, 120_000));
        assert!(!ComparisonOp::Gt.evaluate(120_000, 120_000));
        assert!(ComparisonOp::Le.evaluate(5, 6));
        assert!(ComparisonOp::Lt.evaluate(5, 6));
        assert!(!ComparisonOp::Eq.evaluate(5, 6));
    }

    #[test]
    fn test_operator_serde_uses_symbol() {
        let json = serde_json::to_string(&ComparisonOp::Le).unwrap();
        assert_eq!(json, "\"<=\"");
        let op: ComparisonOp = serde_json::from_str("\"<\"").unwrap();
        assert_eq!(op, ComparisonOp::Lt);
    }

    #[test]
    fn test_terms_validation() {
        let config = SettlementConfig::default();
        assert_eq!(terms().validate(&config).unwrap(), ComparisonOp::Ge);

        let mut bad = terms();
        bad.market_end = bad.market_start;
        assert!(matches!(bad.validate(&config), Err(SettlementError::InvalidTerms(_))));

        let mut bad = terms();
        bad.required_bet_amount = 0;
        assert!(matches!(bad.validate(&config), Err(SettlementError::InvalidTerms(_))));

        let mut bad = terms();
        bad.max_player_count = 0;
        assert!(matches!(bad.validate(&config), Err(SettlementError::InvalidTerms(_))));

        let mut bad = terms();
        bad.token = "X".repeat(11);
        assert!(matches!(bad.validate(&config), Err(SettlementError::InvalidTerms(_))));

        let mut bad = terms();
        bad.operator = "!=".into();
        assert!(matches!(bad.validate(&config), Err(SettlementError::InvalidOperator(_))));
    }

    #[test]
    fn test_outcome_for_observed_value() {
        let creator = Address::random();
        let market = Market::new(creator, 1, terms(), ComparisonOp::Ge, 1_000);
        assert_eq!(market.outcome_for(130_000), Side::Yes);
        assert_eq!(market.outcome_for(119_999), Side::No);
        assert_eq!(market.address, Address::market(&creator, 1));
        assert!(market.is_open());
    }
}

//! Encrypted Game Sessions
//!
//! A game hangs off a market and seats one player per side. Its card slots
//! stay encrypted between the table's key and the computation cluster; every
//! change to them runs as a confidential job.
//!
//! ```text
//! init_game(market, id) ──▶ [init_game job] ──▶ GameSession (6 empty slots)
//!
//! join_game(game, payer, bettor, cards)
//!   bet record ─▶ side ─▶ [join_game job over current slots] ─▶ seat payer
//! ```
//!
//! Joins on one game are serialized by the session's async mutex, which is
//! held across the computation round trip. A failed join leaves the seat and
//! the stored slots as they were.

use crate::address::Address;
use crate::confidential::cluster::GAME_STATE_LIMBS;
use crate::confidential::{
    kinds, ComputationClient, ComputationError, EnvelopeCipher, EnvelopeKeypair, JobOutput,
};
use crate::settlement::{ErrorClass, SettlementEngine, Side};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Cards dealt to one player.
pub type Hand = [u8; 3];

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    MarketNotFound { market: Address },
    GameExists { game: Address },
    GameNotFound { game: Address },
    /// Bettor has no record on the game's market.
    BetNotFound { market: Address, bettor: Address },
    /// Payer does not own the bet record.
    InvalidPayer { payer: Address, bettor: Address },
    PlayerAlreadyJoined { side: Side },
    /// Cards run 1..=255; 0 marks an empty slot.
    InvalidCard { index: usize },
    /// The cluster aborted the game computation.
    AbortedComputation { reason: String },
    Computation(ComputationError),
}

pub type GameResult<T> = Result<T, GameError>;

impl GameError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MarketNotFound { .. }
            | Self::GameNotFound { .. }
            | Self::BetNotFound { .. }
            | Self::InvalidCard { .. } => ErrorClass::Validation,
            Self::InvalidPayer { .. } => ErrorClass::Authority,
            Self::GameExists { .. } | Self::PlayerAlreadyJoined { .. } => {
                ErrorClass::StateConflict
            }
            Self::AbortedComputation { .. } => ErrorClass::External,
            Self::Computation(e) => e.class(),
        }
    }
}

impl fmt::Display for GameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarketNotFound { market } => write!(f, "market {} not found", market.short()),
            Self::GameExists { game } => write!(f, "game {} already exists", game.short()),
            Self::GameNotFound { game } => write!(f, "game {} not found", game.short()),
            Self::BetNotFound { market, bettor } => write!(
                f,
                "no bet from {} on market {}",
                bettor.short(),
                market.short()
            ),
            Self::InvalidPayer { payer, bettor } => write!(
                f,
                "payer {} does not own the bet of {}",
                payer.short(),
                bettor.short()
            ),
            Self::PlayerAlreadyJoined { side } => write!(f, "{:?} seat already taken", side),
            Self::InvalidCard { index } => write!(f, "card {} is empty", index),
            Self::AbortedComputation { reason } => {
                write!(f, "game computation aborted: {}", reason)
            }
            Self::Computation(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GameError {}

impl From<ComputationError> for GameError {
    fn from(e: ComputationError) -> Self {
        match e {
            ComputationError::JobFailed { reason, .. } => Self::AbortedComputation { reason },
            other => Self::Computation(other),
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Debug, Clone)]
pub struct GameSession {
    pub address: Address,
    pub market: Address,
    pub game_id: u64,
    pub player_yes: Option<Address>,
    pub player_no: Option<Address>,
    /// Card slots, encrypted by the cluster for the table key.
    pub state: JobOutput,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameSession {
    pub fn player(&self, side: Side) -> Option<Address> {
        match side {
            Side::Yes => self.player_yes,
            Side::No => self.player_no,
        }
    }

    fn seat(&mut self, side: Side) -> &mut Option<Address> {
        match side {
            Side::Yes => &mut self.player_yes,
            Side::No => &mut self.player_no,
        }
    }
}

fn side_limb(side: Side) -> u128 {
    match side {
        Side::Yes => 0,
        Side::No => 1,
    }
}

// =============================================================================
// TABLE
// =============================================================================

pub struct GameTable {
    engine: Arc<SettlementEngine>,
    client: Arc<ComputationClient>,
    keypair: EnvelopeKeypair,
    sessions: RwLock<HashMap<Address, Arc<AsyncMutex<GameSession>>>>,
}

impl GameTable {
    pub fn new(engine: Arc<SettlementEngine>, client: Arc<ComputationClient>) -> Self {
        Self {
            engine,
            client,
            keypair: EnvelopeKeypair::generate(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a game on an existing market with every card slot empty.
    pub async fn init_game(&self, market: &Address, game_id: u64) -> GameResult<Address> {
        if self.engine.market(market).is_none() {
            return Err(GameError::MarketNotFound { market: *market });
        }
        let address = Address::game(market, game_id);
        if self.sessions.read().contains_key(&address) {
            return Err(GameError::GameExists { game: address });
        }

        let state = self.run(kinds::INIT_GAME, &[u128::from(game_id)]).await?;
        let now = Utc::now();
        let session = GameSession {
            address,
            market: *market,
            game_id,
            player_yes: None,
            player_no: None,
            state,
            created_at: now,
            updated_at: now,
        };
        match self.sessions.write().entry(address) {
            Entry::Occupied(_) => return Err(GameError::GameExists { game: address }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(AsyncMutex::new(session)));
            }
        }

        info!(game = %address.short(), market = %market.short(), game_id, "Game created");
        metrics::increment_counter!("escrow_games_created_total");
        Ok(address)
    }

    /// Seat `payer` on the side of their bet and deal `cards` into that
    /// side's slots.
    pub async fn join_game(
        &self,
        game: &Address,
        payer: Address,
        bettor: Address,
        cards: Hand,
    ) -> GameResult<Side> {
        let session = self.session_handle(game)?;
        let mut session = session.lock().await;

        let record = self
            .engine
            .bet_record(&session.market, &bettor)
            .ok_or(GameError::BetNotFound {
                market: session.market,
                bettor,
            })?;
        if record.bettor != payer {
            warn!(
                game = %game.short(),
                payer = %payer.short(),
                "Join rejected: payer does not own bet"
            );
            return Err(GameError::InvalidPayer { payer, bettor });
        }
        let side = record.side;
        if session.player(side).is_some() {
            debug!(game = %game.short(), ?side, "Join rejected: seat taken");
            return Err(GameError::PlayerAlreadyJoined { side });
        }
        if let Some(index) = cards.iter().position(|c| *c == 0) {
            return Err(GameError::InvalidCard { index });
        }

        let mut inputs = vec![side_limb(side)];
        inputs.extend(cards.iter().map(|c| u128::from(*c)));
        inputs.extend(self.open(&session.state)?);
        let state = self.run(kinds::JOIN_GAME, &inputs).await?;

        session.state = state;
        *session.seat(side) = Some(payer);
        session.updated_at = Utc::now();
        info!(game = %game.short(), player = %payer.short(), ?side, "Player joined game");
        metrics::increment_counter!("escrow_game_joins_total");
        Ok(side)
    }

    /// Snapshot of a session.
    pub async fn session(&self, game: &Address) -> Option<GameSession> {
        let handle = self.session_handle(game).ok()?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    /// Decrypted card slots: the yes hand, then the no hand. Empty slots
    /// read as 0.
    pub async fn reveal(&self, game: &Address) -> GameResult<[Hand; 2]> {
        let handle = self.session_handle(game)?;
        let session = handle.lock().await;
        let limbs = self.open(&session.state)?;
        let mut hands = [[0u8; 3]; 2];
        for (i, limb) in limbs.iter().enumerate() {
            hands[i / 3][i % 3] = u8::try_from(*limb).map_err(|_| {
                ComputationError::InvalidInput(format!("card slot {} holds {}", i, limb))
            })?;
        }
        Ok(hands)
    }

    pub fn game_count(&self) -> usize {
        self.sessions.read().len()
    }

    fn session_handle(&self, game: &Address) -> GameResult<Arc<AsyncMutex<GameSession>>> {
        self.sessions
            .read()
            .get(game)
            .cloned()
            .ok_or(GameError::GameNotFound { game: *game })
    }

    fn cipher(&self) -> GameResult<EnvelopeCipher> {
        EnvelopeCipher::between(&self.keypair, &self.client.cluster_public_key())
            .map_err(|e| GameError::Computation(e.into()))
    }

    fn open(&self, state: &JobOutput) -> GameResult<Vec<u128>> {
        let limbs = self
            .cipher()?
            .decrypt(&state.ciphertexts, &state.nonce)
            .map_err(ComputationError::from)?;
        if limbs.len() != GAME_STATE_LIMBS {
            return Err(GameError::Computation(ComputationError::InvalidInput(format!(
                "game state has {} limbs, expected {}",
                limbs.len(),
                GAME_STATE_LIMBS
            ))));
        }
        Ok(limbs)
    }

    /// Submit one game computation and wait for it. Terminal jobs are
    /// released; a job still running after the await bound stays tracked.
    async fn run(&self, kind: &str, plaintext: &[u128]) -> GameResult<JobOutput> {
        let (handle, _) = self
            .client
            .submit_plaintext(kind, &self.keypair, plaintext)
            .await?;
        let result = self.client.await_finalization(&handle).await;
        if !matches!(&result, Err(e) if e.is_retryable()) {
            if let Err(e) = self.client.release(&handle) {
                debug!(offset = %handle.offset, error = %e, "Game job not released");
            }
        }
        let output = result?;
        self.open(&output)?;
        Ok(output)
    }
}

impl fmt::Debug for GameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameTable")
            .field("games", &self.sessions.read().len())
            .finish()
    }
}

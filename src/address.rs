//! Opaque 32-byte Identifiers
//!
//! Every participant (creator, bettor, resolver) and every derived account
//! (market, vault, bet record, game session) is addressed by a 32-byte
//! value. Derived addresses are SHA-256 digests over a seed list, so the same
//! seeds always name the same account.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Seed prefixes for derived accounts.
pub mod seeds {
    pub const MARKET: &[u8] = b"market";
    pub const TREASURY_VAULT: &[u8] = b"treasury_vault";
    pub const BET: &[u8] = b"bet";
    pub const RESOLVER_AUTHORITY: &[u8] = b"resolver_authority";
    pub const GAME: &[u8] = b"game";
}

/// A 32-byte opaque, comparable identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 32]);

impl Address {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh random identity (test wallets, simulated participants).
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive an address from an ordered list of seeds.
    ///
    /// Each seed is length-prefixed before hashing so `["ab", "c"]` and
    /// `["a", "bc"]` never collide.
    pub fn derive(seeds: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update((seed.len() as u32).to_le_bytes());
            hasher.update(seed);
        }
        Self(hasher.finalize().into())
    }

    /// Market address: `"market" ‖ creator ‖ seed_le`.
    pub fn market(creator: &Address, seed: u64) -> Self {
        Self::derive(&[seeds::MARKET, creator.as_bytes(), &seed.to_le_bytes()])
    }

    /// Escrow vault holding a market's funds.
    pub fn treasury_vault(market: &Address) -> Self {
        Self::derive(&[seeds::TREASURY_VAULT, market.as_bytes()])
    }

    /// Bet record slot for one (market, bettor) pair.
    pub fn bet(market: &Address, bettor: &Address) -> Self {
        Self::derive(&[seeds::BET, market.as_bytes(), bettor.as_bytes()])
    }

    /// Game session tied to a market: `"game" ‖ market ‖ game_id_le`.
    pub fn game(market: &Address, game_id: u64) -> Self {
        Self::derive(&[seeds::GAME, market.as_bytes(), &game_id.to_le_bytes()])
    }

    /// Protocol-level resolver authority for a deployment.
    pub fn resolver_authority(program: &Address) -> Self {
        Self::derive(&[seeds::RESOLVER_AUTHORITY, program.as_bytes()])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; 32]> for Address {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.short())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error parsing an address from hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParseError(pub String);

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address: {}", self.0)
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches("0x");
        let bytes = hex::decode(trimmed).map_err(|e| AddressParseError(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| {
                AddressParseError(format!("expected 32 bytes, got {}", b.len()))
            })?;
        Ok(Self(arr))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let creator = Address::new([7u8; 32]);
        assert_eq!(Address::market(&creator, 1), Address::market(&creator, 1));
        assert_ne!(Address::market(&creator, 1), Address::market(&creator, 2));
    }

    #[test]
    fn test_game_address_is_scoped_to_market() {
        let market = Address::market(&Address::new([7u8; 32]), 1);
        let other = Address::market(&Address::new([7u8; 32]), 2);
        assert_eq!(Address::game(&market, 5), Address::game(&market, 5));
        assert_ne!(Address::game(&market, 5), Address::game(&other, 5));
        assert_ne!(Address::game(&market, 5), Address::game(&market, 6));
    }

    #[test]
    fn test_length_prefix_prevents_seed_ambiguity() {
        let a = Address::derive(&[b"ab", b"c"]);
        let b = Address::derive(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_roundtrip_and_serde() {
        let addr = Address::random();
        let parsed: Address = addr.to_hex().parse().unwrap();
        assert_eq!(addr, parsed);

        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr.to_hex()));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!("abcd".parse::<Address>().is_err());
        assert!("zz".repeat(32).parse::<Address>().is_err());
    }
}

//! Computation Definition Registry
//!
//! A computation kind has to be registered and then activated (circuit
//! uploaded or pointed at an off-chain source) before any job of that kind
//! can be queued.
//!
//! ```text
//! Uninitialized ──register──▶ Registered ──activate──▶ Active
//! ```

use crate::confidential::error::{ComputationError, ComputationResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::info;

/// Kinds known to the deployment.
pub mod kinds {
    pub const ADD_TOGETHER: &str = "add_together";
    pub const INIT_GAME: &str = "init_game";
    pub const JOIN_GAME: &str = "join_game";
}

/// Definition offset: first four bytes (LE) of SHA-256(kind).
pub fn definition_offset(kind: &str) -> u32 {
    let digest = Sha256::digest(kind.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionState {
    Uninitialized,
    Registered,
    Active,
}

/// Where the circuit for an activated definition comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CircuitSource {
    /// Raw bytecode built for the definition at `offset`.
    Uploaded { offset: u32, bytecode: Vec<u8> },
    /// Externally hosted circuit, identified by its SHA-256 hash.
    OffChain { url: String, hash: [u8; 32] },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationDefinition {
    pub kind: String,
    pub offset: u32,
    pub state: DefinitionState,
    pub source: Option<CircuitSource>,
}

/// Returned by `register`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionHandle {
    pub kind: String,
    pub offset: u32,
}

#[derive(Debug, Default)]
pub struct ComputationDefinitionRegistry {
    definitions: RwLock<HashMap<String, ComputationDefinition>>,
}

impl ComputationDefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kind`. A second registration fails instead of succeeding
    /// silently.
    pub fn register(&self, kind: &str) -> ComputationResult<DefinitionHandle> {
        if kind.is_empty() {
            return Err(ComputationError::InvalidInput("empty computation kind".into()));
        }
        let mut definitions = self.definitions.write();
        if definitions.contains_key(kind) {
            return Err(ComputationError::AlreadyInitialized { kind: kind.to_string() });
        }
        let offset = definition_offset(kind);
        definitions.insert(
            kind.to_string(),
            ComputationDefinition {
                kind: kind.to_string(),
                offset,
                state: DefinitionState::Registered,
                source: None,
            },
        );
        info!(kind, offset, "Computation definition registered");
        Ok(DefinitionHandle {
            kind: kind.to_string(),
            offset,
        })
    }

    /// Activate a registered definition with its circuit.
    pub fn activate(&self, kind: &str, source: CircuitSource) -> ComputationResult<()> {
        let mut definitions = self.definitions.write();
        let definition = definitions
            .get_mut(kind)
            .ok_or_else(|| ComputationError::DefinitionNotRegistered { kind: kind.to_string() })?;

        if definition.state == DefinitionState::Active {
            return Err(ComputationError::AlreadyActivated { kind: kind.to_string() });
        }
        match &source {
            CircuitSource::Uploaded { offset, bytecode } => {
                if *offset != definition.offset {
                    return Err(ComputationError::CircuitMismatch {
                        kind: kind.to_string(),
                        expected: definition.offset,
                        got: *offset,
                    });
                }
                if bytecode.is_empty() {
                    return Err(ComputationError::InvalidInput("empty circuit bytecode".into()));
                }
            }
            CircuitSource::OffChain { url, .. } => {
                if url.is_empty() {
                    return Err(ComputationError::InvalidInput("empty circuit url".into()));
                }
            }
        }

        definition.state = DefinitionState::Active;
        definition.source = Some(source);
        info!(kind, "Computation definition activated");
        Ok(())
    }

    /// Register and activate from an off-chain source in one call.
    pub fn register_off_chain(
        &self,
        kind: &str,
        url: &str,
        hash: [u8; 32],
    ) -> ComputationResult<DefinitionHandle> {
        let handle = self.register(kind)?;
        self.activate(
            kind,
            CircuitSource::OffChain {
                url: url.to_string(),
                hash,
            },
        )?;
        Ok(handle)
    }

    pub fn state(&self, kind: &str) -> DefinitionState {
        self.definitions
            .read()
            .get(kind)
            .map(|d| d.state)
            .unwrap_or(DefinitionState::Uninitialized)
    }

    pub fn definition(&self, kind: &str) -> Option<ComputationDefinition> {
        self.definitions.read().get(kind).cloned()
    }

    /// Offset of `kind` if jobs may be queued against it.
    pub fn require_active(&self, kind: &str) -> ComputationResult<u32> {
        match self.definitions.read().get(kind) {
            Some(d) if d.state == DefinitionState::Active => Ok(d.offset),
            _ => Err(ComputationError::DefinitionNotReady { kind: kind.to_string() }),
        }
    }
}

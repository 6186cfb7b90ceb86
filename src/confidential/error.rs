//! Errors for the envelope cipher and the computation job protocol.

use crate::confidential::job::JobOffset;
use crate::settlement::ErrorClass;
use std::fmt;
use std::time::Duration;

// =============================================================================
// CIPHER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Peer key is the identity or a low-order point; agreement would be
    /// independent of our secret.
    LowOrderPublicKey,
    /// HKDF refused the requested output length.
    KeyDerivation,
    /// More blocks than the per-message block counter can address.
    TooManyBlocks { count: usize },
    /// Authentication failed: wrong secret, wrong nonce, or tampered block.
    DecryptionFailed { block: usize },
    EncryptionFailed { block: usize },
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowOrderPublicKey => write!(f, "peer public key is a low-order point"),
            Self::KeyDerivation => write!(f, "key derivation failed"),
            Self::TooManyBlocks { count } => write!(f, "too many plaintext blocks: {}", count),
            Self::DecryptionFailed { block } => {
                write!(f, "ciphertext block {} failed authentication", block)
            }
            Self::EncryptionFailed { block } => write!(f, "failed to encrypt block {}", block),
        }
    }
}

impl std::error::Error for CipherError {}

// =============================================================================
// CLUSTER BOUNDARY
// =============================================================================

/// Failure reported by a `ComputationCluster` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// Temporary read/transport failure; the call may be retried.
    Transient(String),
    /// The cluster refused the request outright.
    Rejected(String),
    /// The cluster has no job at this offset.
    UnknownJob(JobOffset),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient cluster error: {}", msg),
            Self::Rejected(msg) => write!(f, "cluster rejected request: {}", msg),
            Self::UnknownJob(offset) => write!(f, "cluster has no job {}", offset),
        }
    }
}

impl std::error::Error for ClusterError {}

// =============================================================================
// PROTOCOL
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputationError {
    /// `register` called twice for the same kind.
    AlreadyInitialized { kind: String },
    /// `activate` called for a kind that was never registered.
    DefinitionNotRegistered { kind: String },
    AlreadyActivated { kind: String },
    /// Jobs may only be queued against an active definition.
    DefinitionNotReady { kind: String },
    /// Uploaded circuit was built for a different definition offset.
    CircuitMismatch { kind: String, expected: u32, got: u32 },
    InvalidInput(String),
    /// Another tracked job already uses this offset.
    OffsetCollision { offset: JobOffset },
    UnknownJob { offset: JobOffset },
    /// Await bound elapsed; the job itself is unaffected.
    Timeout { offset: JobOffset, waited: Duration },
    /// Consecutive transient poll failures hit the attempt limit.
    RetriesExhausted { offset: JobOffset, attempts: u32, last_error: String },
    ClusterRejected { reason: String },
    /// Cluster reported the computation as failed or aborted.
    JobFailed { offset: JobOffset, reason: String },
    /// Cluster never picked the job up.
    JobExpired { offset: JobOffset },
    Cipher(CipherError),
}

impl ComputationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidInput(_)
            | Self::CircuitMismatch { .. }
            | Self::UnknownJob { .. }
            | Self::Cipher(_) => ErrorClass::Validation,
            Self::AlreadyInitialized { .. }
            | Self::AlreadyActivated { .. }
            | Self::OffsetCollision { .. } => ErrorClass::StateConflict,
            Self::DefinitionNotRegistered { .. } | Self::DefinitionNotReady { .. } => {
                ErrorClass::NotReady
            }
            Self::Timeout { .. } | Self::JobExpired { .. } => ErrorClass::ExternalTimeout,
            Self::RetriesExhausted { .. } | Self::ClusterRejected { .. } | Self::JobFailed { .. } => {
                ErrorClass::External
            }
        }
    }

    /// Whether awaiting the same handle again can still succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RetriesExhausted { .. })
    }
}

impl fmt::Display for ComputationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized { kind } => {
                write!(f, "computation definition {} already initialized", kind)
            }
            Self::DefinitionNotRegistered { kind } => {
                write!(f, "computation definition {} was never registered", kind)
            }
            Self::AlreadyActivated { kind } => {
                write!(f, "computation definition {} already activated", kind)
            }
            Self::DefinitionNotReady { kind } => {
                write!(f, "computation definition {} is not active", kind)
            }
            Self::CircuitMismatch { kind, expected, got } => write!(
                f,
                "circuit for {} targets offset {:#010x}, expected {:#010x}",
                kind, got, expected
            ),
            Self::InvalidInput(msg) => write!(f, "invalid computation input: {}", msg),
            Self::OffsetCollision { offset } => {
                write!(f, "job offset {} is already in use", offset)
            }
            Self::UnknownJob { offset } => write!(f, "unknown job {}", offset),
            Self::Timeout { offset, waited } => {
                write!(f, "job {} not finalized after {:?}", offset, waited)
            }
            Self::RetriesExhausted {
                offset,
                attempts,
                last_error,
            } => write!(
                f,
                "polling job {} failed {} times, last error: {}",
                offset, attempts, last_error
            ),
            Self::ClusterRejected { reason } => write!(f, "cluster rejected job: {}", reason),
            Self::JobFailed { offset, reason } => {
                write!(f, "computation {} aborted: {}", offset, reason)
            }
            Self::JobExpired { offset } => write!(f, "job {} expired before execution", offset),
            Self::Cipher(e) => write!(f, "cipher error: {}", e),
        }
    }
}

impl std::error::Error for ComputationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cipher(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CipherError> for ComputationError {
    fn from(e: CipherError) -> Self {
        Self::Cipher(e)
    }
}

pub type ComputationResult<T> = Result<T, ComputationError>;

//! Computation jobs: offsets, lifecycle states, requests and results.

use crate::confidential::cipher::{CipherBlock, EnvelopeNonce, PublicKeyBytes};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-chosen 8-byte job identifier. Unique among tracked jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobOffset(pub u64);

impl JobOffset {
    pub fn random() -> Self {
        Self(rand::thread_rng().next_u64())
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for JobOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// ```text
/// Queued ──▶ Executing ──▶ Finalized
///   │            └───────▶ Failed
///   └──▶ Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Executing,
    Finalized,
    Failed,
    Expired,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed | Self::Expired)
    }

    /// Forward-only transitions. A poll may skip `Executing` entirely.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Executing)
                | (Queued, Finalized)
                | (Queued, Failed)
                | (Queued, Expired)
                | (Executing, Finalized)
                | (Executing, Failed)
        )
    }
}

/// Result ciphertext plus the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub ciphertexts: Vec<CipherBlock>,
    pub nonce: EnvelopeNonce,
}

/// What the cluster reports for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Executing,
    Finalized { output: JobOutput },
    Failed { reason: String },
    Expired,
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        match self {
            Self::Queued => JobState::Queued,
            Self::Executing => JobState::Executing,
            Self::Finalized { .. } => JobState::Finalized,
            Self::Failed { .. } => JobState::Failed,
            Self::Expired => JobState::Expired,
        }
    }
}

// =============================================================================
// REQUEST / JOB
// =============================================================================

/// Everything the cluster needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationRequest {
    pub kind: String,
    pub offset: JobOffset,
    /// Encrypted input limbs.
    pub inputs: Vec<CipherBlock>,
    /// Requester X25519 public key; the cluster derives the shared secret from it.
    pub public_key: PublicKeyBytes,
    pub nonce: EnvelopeNonce,
}

/// Client-side tracking record for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationJob {
    pub request: ComputationRequest,
    /// Definition offset the job was queued against.
    pub definition_offset: u32,
    pub state: JobState,
    pub output: Option<JobOutput>,
    pub failure: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComputationJob {
    pub fn new(request: ComputationRequest, definition_offset: u32) -> Self {
        let now = Utc::now();
        Self {
            request,
            definition_offset,
            state: JobState::Queued,
            output: None,
            failure: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn offset(&self) -> JobOffset {
        self.request.offset
    }

    /// Record a cluster-reported status. Stale or backward reports are
    /// ignored; returns whether the state moved.
    pub fn observe(&mut self, status: &JobStatus) -> bool {
        let next = status.state();
        if !self.state.can_advance_to(next) {
            return false;
        }
        match status {
            JobStatus::Finalized { output } => self.output = Some(output.clone()),
            JobStatus::Failed { reason } => self.failure = Some(reason.clone()),
            _ => {}
        }
        self.state = next;
        self.updated_at = Utc::now();
        true
    }
}

/// Handle returned by `submit`; awaiting it again after a timeout is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub offset: JobOffset,
    pub kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ComputationJob {
        ComputationJob::new(
            ComputationRequest {
                kind: "add_together".into(),
                offset: JobOffset(1),
                inputs: vec![[0u8; 32]; 2],
                public_key: [1u8; 32],
                nonce: [2u8; 16],
            },
            0xdead_beef,
        )
    }

    #[test]
    fn test_state_only_moves_forward() {
        let mut job = job();
        assert!(job.observe(&JobStatus::Executing));
        assert!(!job.observe(&JobStatus::Queued), "no regression");
        assert!(job.observe(&JobStatus::Failed { reason: "abort".into() }));
        assert_eq!(job.failure.as_deref(), Some("abort"));
        assert!(!job.observe(&JobStatus::Executing));
        assert_eq!(job.state, JobState::Failed);
    }

    #[test]
    fn test_finalize_records_output() {
        let mut job = job();
        let output = JobOutput {
            ciphertexts: vec![[9u8; 32]],
            nonce: [5u8; 16],
        };
        assert!(job.observe(&JobStatus::Finalized { output: output.clone() }));
        assert_eq!(job.output, Some(output));
        assert!(job.state.is_terminal());
    }

    #[test]
    fn test_expired_only_from_queued() {
        assert!(JobState::Queued.can_advance_to(JobState::Expired));
        assert!(!JobState::Executing.can_advance_to(JobState::Expired));
        assert!(!JobState::Finalized.can_advance_to(JobState::Failed));
    }

    #[test]
    fn test_offset_display_is_fixed_width() {
        assert_eq!(JobOffset(0xab).to_string(), "00000000000000ab");
    }
}

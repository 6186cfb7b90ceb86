//! Confidential Computation Jobs
//!
//! ```text
//!  requester                                   cluster
//!  ─────────                                   ───────
//!  EnvelopeCipher.encrypt(inputs)
//!  ComputationClient.submit ──── submit_job ────▶ Queued
//!                                                 │
//!  await_finalization ◀──── poll_job ──────────── Executing
//!        ▲                                        │
//!        └──────────── FinalizeEvent (mpsc) ◀──── Finalized | Failed
//!  EnvelopeCipher.decrypt(output)
//! ```
//!
//! Jobs may only be queued against a definition that is registered and
//! activated in the `ComputationDefinitionRegistry`.

pub mod cipher;
pub mod client;
pub mod cluster;
pub mod definition;
pub mod error;
pub mod job;
pub mod retry;

pub use cipher::{
    random_nonce, CipherBlock, EnvelopeCipher, EnvelopeKeypair, EnvelopeNonce, SharedSecret,
};
pub use client::ComputationClient;
pub use cluster::{
    ComputationCluster, FinalizeEvent, FinalizeOutcome, Kernel, LocalCluster, LocalClusterConfig,
};
pub use definition::{
    definition_offset, kinds, CircuitSource, ComputationDefinitionRegistry, DefinitionState,
};
pub use error::{CipherError, ClusterError, ComputationError, ComputationResult};
pub use job::{
    ComputationJob, ComputationRequest, JobHandle, JobOffset, JobOutput, JobState, JobStatus,
};
pub use retry::{AwaitPolicy, BackoffKind, RetryPolicy};

//! Computation Cluster Boundary
//!
//! The cluster is an external collaborator. The client only ever calls
//! `submit_job` and `poll_job`, and listens for `FinalizeEvent`s on a channel.
//! All job state transitions are driven by the cluster.
//!
//! `LocalCluster` is an in-process executor: it decrypts inputs with the
//! requester's shared secret, runs a named kernel on the plaintext, and
//! re-encrypts the result under a fresh nonce.

use crate::confidential::cipher::{EnvelopeCipher, EnvelopeKeypair, EnvelopeNonce, PublicKeyBytes};
use crate::confidential::definition::kinds;
use crate::confidential::error::ClusterError;
use crate::confidential::job::{ComputationRequest, JobOffset, JobOutput, JobStatus};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the finalize-event channel.
pub const FINALIZE_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait ComputationCluster: Send + Sync {
    /// Public key requesters agree with to encrypt inputs.
    fn public_key(&self) -> PublicKeyBytes;

    /// Enqueue a job. Returns once the cluster has accepted it.
    async fn submit_job(&self, request: ComputationRequest) -> Result<(), ClusterError>;

    /// Current status of a job.
    async fn poll_job(&self, offset: JobOffset) -> Result<JobStatus, ClusterError>;

    /// Acknowledge a terminal job the requester has released. The cluster
    /// drops it and the offset may be queued again.
    fn forget_job(&self, offset: JobOffset);
}

/// Terminal notification pushed by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeEvent {
    pub offset: JobOffset,
    /// Nonce of the request that produced the event. Tells a reused offset's
    /// jobs apart.
    pub request_nonce: EnvelopeNonce,
    pub outcome: FinalizeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    Finalized { output: JobOutput },
    Aborted { reason: String },
}

impl FinalizeEvent {
    pub fn status(&self) -> JobStatus {
        match &self.outcome {
            FinalizeOutcome::Finalized { output } => JobStatus::Finalized {
                output: output.clone(),
            },
            FinalizeOutcome::Aborted { reason } => JobStatus::Failed {
                reason: reason.clone(),
            },
        }
    }
}

// =============================================================================
// KERNELS
// =============================================================================

/// Plaintext computation run by `LocalCluster`.
pub type Kernel = Arc<dyn Fn(&[u128]) -> Result<Vec<u128>> + Send + Sync>;

/// Two encrypted u8 limbs in, one u16 sum out.
pub fn add_together(inputs: &[u128]) -> Result<Vec<u128>> {
    if inputs.len() != 2 {
        bail!("add_together takes 2 inputs, got {}", inputs.len());
    }
    for (i, value) in inputs.iter().enumerate() {
        if *value > u8::MAX as u128 {
            bail!("input {} does not fit in u8: {}", i, value);
        }
    }
    Ok(vec![inputs[0] + inputs[1]])
}

/// Limbs of an encrypted game: three yes-side cards, then three no-side cards.
pub const GAME_STATE_LIMBS: usize = 6;

/// Fresh game state from a game id: every card slot empty.
pub fn init_game(inputs: &[u128]) -> Result<Vec<u128>> {
    if inputs.len() != 1 {
        bail!("init_game takes 1 input, got {}", inputs.len());
    }
    Ok(vec![0; GAME_STATE_LIMBS])
}

/// `[side, c1, c2, c3, state..]` in, updated state out. Side 0 fills the
/// yes slots, side 1 the no slots. A side whose slots already hold cards is
/// left untouched.
pub fn join_game(inputs: &[u128]) -> Result<Vec<u128>> {
    if inputs.len() != 4 + GAME_STATE_LIMBS {
        bail!("join_game takes {} inputs, got {}", 4 + GAME_STATE_LIMBS, inputs.len());
    }
    let side = inputs[0];
    if side > 1 {
        bail!("side must be 0 or 1, got {}", side);
    }
    for (i, value) in inputs[1..].iter().enumerate() {
        if *value > u8::MAX as u128 {
            bail!("input {} does not fit in u8: {}", i + 1, value);
        }
    }
    let mut state = inputs[4..].to_vec();
    let start = side as usize * 3;
    let slots = &mut state[start..start + 3];
    if slots.iter().all(|c| *c == 0) {
        slots.copy_from_slice(&inputs[1..4]);
    }
    Ok(state)
}

// =============================================================================
// LOCAL CLUSTER
// =============================================================================

#[derive(Debug, Clone)]
pub struct LocalClusterConfig {
    /// Time a job spends queued, then again executing.
    pub stage_delay: Duration,
    /// Seed for output nonces.
    pub seed: u64,
}

impl Default for LocalClusterConfig {
    fn default() -> Self {
        Self {
            stage_delay: Duration::from_millis(200),
            seed: 42,
        }
    }
}

struct LocalState {
    keypair: EnvelopeKeypair,
    kernels: RwLock<HashMap<String, Kernel>>,
    jobs: Mutex<HashMap<JobOffset, JobStatus>>,
    rng: Mutex<ChaCha8Rng>,
    events: mpsc::Sender<FinalizeEvent>,
    /// Polls still to fail with a transient error.
    failing_polls: AtomicU32,
    stage_delay: Duration,
}

/// In-process cluster with pluggable kernels.
#[derive(Clone)]
pub struct LocalCluster {
    state: Arc<LocalState>,
}

impl LocalCluster {
    /// Build a cluster with the `add_together`, `init_game` and `join_game`
    /// kernels installed. The receiver yields a `FinalizeEvent` per terminal
    /// job.
    pub fn new(config: LocalClusterConfig) -> (Self, mpsc::Receiver<FinalizeEvent>) {
        let (events, rx) = mpsc::channel(FINALIZE_CHANNEL_CAPACITY);
        let cluster = Self {
            state: Arc::new(LocalState {
                keypair: EnvelopeKeypair::generate(),
                kernels: RwLock::new(HashMap::new()),
                jobs: Mutex::new(HashMap::new()),
                rng: Mutex::new(ChaCha8Rng::seed_from_u64(config.seed)),
                events,
                failing_polls: AtomicU32::new(0),
                stage_delay: config.stage_delay,
            }),
        };
        cluster.install_kernel(kinds::ADD_TOGETHER, Arc::new(add_together));
        cluster.install_kernel(kinds::INIT_GAME, Arc::new(init_game));
        cluster.install_kernel(kinds::JOIN_GAME, Arc::new(join_game));
        (cluster, rx)
    }

    pub fn install_kernel(&self, kind: &str, kernel: Kernel) {
        self.state.kernels.write().insert(kind.to_string(), kernel);
    }

    /// Make the next `n` polls fail transiently.
    pub fn fail_next_polls(&self, n: u32) {
        self.state.failing_polls.store(n, Ordering::SeqCst);
    }

    /// Number of jobs the cluster knows about.
    pub fn job_count(&self) -> usize {
        self.state.jobs.lock().len()
    }
}

impl LocalState {
    fn set_status(&self, offset: JobOffset, status: JobStatus) {
        self.jobs.lock().insert(offset, status);
    }

    fn next_nonce(&self) -> EnvelopeNonce {
        let mut nonce = [0u8; 16];
        self.rng.lock().fill_bytes(&mut nonce);
        nonce
    }

    /// Decrypt, compute, re-encrypt.
    fn execute(&self, request: &ComputationRequest, kernel: &Kernel) -> Result<JobOutput> {
        let cipher = EnvelopeCipher::between(&self.keypair, &request.public_key)?;
        let inputs = cipher.decrypt(&request.inputs, &request.nonce)?;
        let outputs = (kernel.as_ref())(&inputs)?;
        let nonce = self.next_nonce();
        let ciphertexts = cipher.encrypt(&outputs, &nonce)?;
        Ok(JobOutput { ciphertexts, nonce })
    }

    async fn run(self: Arc<Self>, request: ComputationRequest, kernel: Kernel) {
        let offset = request.offset;
        tokio::time::sleep(self.stage_delay).await;
        self.set_status(offset, JobStatus::Executing);
        debug!(%offset, kind = %request.kind, "Job executing");
        tokio::time::sleep(self.stage_delay).await;

        let (status, outcome) = match self.execute(&request, &kernel) {
            Ok(output) => (
                JobStatus::Finalized {
                    output: output.clone(),
                },
                FinalizeOutcome::Finalized { output },
            ),
            Err(e) => {
                warn!(%offset, error = %e, "Computation aborted");
                let reason = e.to_string();
                (
                    JobStatus::Failed {
                        reason: reason.clone(),
                    },
                    FinalizeOutcome::Aborted { reason },
                )
            }
        };
        self.set_status(offset, status);
        info!(%offset, kind = %request.kind, "Job reached terminal state");

        let event = FinalizeEvent {
            offset,
            request_nonce: request.nonce,
            outcome,
        };
        if self.events.send(event).await.is_err() {
            debug!(%offset, "No finalize listener");
        }
    }
}

#[async_trait]
impl ComputationCluster for LocalCluster {
    fn public_key(&self) -> PublicKeyBytes {
        self.state.keypair.public_key()
    }

    async fn submit_job(&self, request: ComputationRequest) -> Result<(), ClusterError> {
        let kernel = self
            .state
            .kernels
            .read()
            .get(&request.kind)
            .cloned()
            .ok_or_else(|| ClusterError::Rejected(format!("no kernel for {}", request.kind)))?;
        {
            let mut jobs = self.state.jobs.lock();
            if jobs.contains_key(&request.offset) {
                return Err(ClusterError::Rejected(format!(
                    "offset {} already queued",
                    request.offset
                )));
            }
            jobs.insert(request.offset, JobStatus::Queued);
        }
        debug!(offset = %request.offset, kind = %request.kind, "Job queued");
        tokio::spawn(self.state.clone().run(request, kernel));
        Ok(())
    }

    async fn poll_job(&self, offset: JobOffset) -> Result<JobStatus, ClusterError> {
        let injected = self
            .state
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(ClusterError::Transient("simulated read failure".into()));
        }
        self.state
            .jobs
            .lock()
            .get(&offset)
            .cloned()
            .ok_or(ClusterError::UnknownJob(offset))
    }

    fn forget_job(&self, offset: JobOffset) {
        let mut jobs = self.state.jobs.lock();
        match jobs.get(&offset).map(|status| status.state().is_terminal()) {
            Some(true) => {
                jobs.remove(&offset);
                debug!(%offset, "Job forgotten");
            }
            Some(false) => debug!(%offset, "Refusing to forget a running job"),
            None => {}
        }
    }
}

//! Computation Client
//!
//! Requester side of the job protocol:
//!
//! 1. `submit` checks the definition is active and the offset is unused,
//!    then hands the encrypted request to the cluster.
//! 2. `await_finalization` polls until the job is terminal or the await
//!    timeout elapses. Finalize events arriving through the event pump wake
//!    the waiter early. `await_finalization_with` takes per-call bounds, so a
//!    timed-out wait can be retried with a longer timeout.
//! 3. `release` forgets a terminal job, here and on the cluster, so its
//!    offset can be reused.
//!
//! Dropping either future mid-flight is safe. An abandoned `submit` gives its
//! offset back; an abandoned await leaves the job tracked and the same handle
//! can be awaited again.

use crate::confidential::cipher::{
    random_nonce, CipherBlock, EnvelopeCipher, EnvelopeKeypair, EnvelopeNonce, PublicKeyBytes,
};
use crate::confidential::cluster::{ComputationCluster, FinalizeEvent};
use crate::confidential::definition::ComputationDefinitionRegistry;
use crate::confidential::error::{ClusterError, ComputationError, ComputationResult};
use crate::confidential::job::{
    ComputationJob, ComputationRequest, JobHandle, JobOffset, JobOutput, JobState, JobStatus,
};
use crate::confidential::retry::{AwaitPolicy, RetryPolicy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

struct TrackedJob {
    job: ComputationJob,
    state_tx: watch::Sender<JobState>,
}

type JobTable = Mutex<HashMap<JobOffset, TrackedJob>>;

/// Offset held for a submit in flight. Dropped without `commit`, it removes
/// the tracked job again.
struct Reservation<'a> {
    jobs: &'a JobTable,
    offset: JobOffset,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.jobs.lock().remove(&self.offset);
            debug!(offset = %self.offset, "Offset reservation rolled back");
        }
    }
}

pub struct ComputationClient {
    cluster: Arc<dyn ComputationCluster>,
    registry: Arc<ComputationDefinitionRegistry>,
    policy: AwaitPolicy,
    jobs: JobTable,
}

impl ComputationClient {
    pub fn new(
        cluster: Arc<dyn ComputationCluster>,
        registry: Arc<ComputationDefinitionRegistry>,
        policy: AwaitPolicy,
    ) -> Self {
        Self {
            cluster,
            registry,
            policy,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &AwaitPolicy {
        &self.policy
    }

    pub fn cluster_public_key(&self) -> PublicKeyBytes {
        self.cluster.public_key()
    }

    // =========================================================================
    // SUBMIT
    // =========================================================================

    /// Queue an already-encrypted request.
    pub async fn submit(
        &self,
        kind: &str,
        offset: JobOffset,
        inputs: Vec<CipherBlock>,
        public_key: PublicKeyBytes,
        nonce: EnvelopeNonce,
    ) -> ComputationResult<JobHandle> {
        let definition_offset = self.registry.require_active(kind)?;
        if inputs.is_empty() {
            return Err(ComputationError::InvalidInput("no input ciphertext".into()));
        }
        let request = ComputationRequest {
            kind: kind.to_string(),
            offset,
            inputs,
            public_key,
            nonce,
        };

        // Reserve the offset before talking to the cluster
        let reservation = {
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(&offset) {
                warn!(%offset, kind, "Job offset collision");
                return Err(ComputationError::OffsetCollision { offset });
            }
            let (state_tx, _) = watch::channel(JobState::Queued);
            jobs.insert(
                offset,
                TrackedJob {
                    job: ComputationJob::new(request.clone(), definition_offset),
                    state_tx,
                },
            );
            Reservation {
                jobs: &self.jobs,
                offset,
                committed: false,
            }
        };

        let cluster = self.cluster.clone();
        self.with_retry(&self.policy.retry, offset, "submit", || {
            let cluster = cluster.clone();
            let request = request.clone();
            async move { cluster.submit_job(request).await }
        })
        .await?;
        reservation.commit();

        info!(%offset, kind, "Computation job queued");
        metrics::increment_counter!("escrow_jobs_submitted_total");
        Ok(JobHandle {
            offset,
            kind: kind.to_string(),
        })
    }

    /// Encrypt `plaintext` for the cluster under a random offset and nonce,
    /// then submit. Returns the handle and the cipher needed to read the result.
    pub async fn submit_plaintext(
        &self,
        kind: &str,
        keypair: &EnvelopeKeypair,
        plaintext: &[u128],
    ) -> ComputationResult<(JobHandle, EnvelopeCipher)> {
        let cipher = EnvelopeCipher::between(keypair, &self.cluster.public_key())?;
        let nonce = random_nonce();
        let inputs = cipher.encrypt(plaintext, &nonce)?;
        let handle = self
            .submit(kind, JobOffset::random(), inputs, keypair.public_key(), nonce)
            .await?;
        Ok((handle, cipher))
    }

    // =========================================================================
    // AWAIT
    // =========================================================================

    /// Wait until the job is finalized or failed, bounded by the client's
    /// policy. A timeout leaves the job tracked.
    pub async fn await_finalization(&self, handle: &JobHandle) -> ComputationResult<JobOutput> {
        self.await_finalization_with(handle, &self.policy).await
    }

    /// `await_finalization` with a caller-supplied poll interval, timeout and
    /// retry policy.
    pub async fn await_finalization_with(
        &self,
        handle: &JobHandle,
        policy: &AwaitPolicy,
    ) -> ComputationResult<JobOutput> {
        let offset = handle.offset;
        let mut state_rx = {
            let jobs = self.jobs.lock();
            let tracked = jobs
                .get(&offset)
                .ok_or(ComputationError::UnknownJob { offset })?;
            tracked.state_tx.subscribe()
        };

        let waited = policy.timeout;
        match timeout(waited, self.poll_until_terminal(offset, policy, &mut state_rx)).await {
            Ok(result) => {
                match &result {
                    Ok(_) => {
                        metrics::increment_counter!("escrow_jobs_finalized_total");
                    }
                    Err(e) => {
                        warn!(%offset, error = %e, "Computation job did not finalize");
                        metrics::increment_counter!("escrow_jobs_failed_total");
                    }
                }
                result
            }
            Err(_) => {
                warn!(%offset, ?waited, "Timed out awaiting computation job");
                Err(ComputationError::Timeout { offset, waited })
            }
        }
    }

    /// Await and decrypt in one call.
    pub async fn await_plaintext(
        &self,
        handle: &JobHandle,
        cipher: &EnvelopeCipher,
    ) -> ComputationResult<Vec<u128>> {
        let output = self.await_finalization(handle).await?;
        Ok(cipher.decrypt(&output.ciphertexts, &output.nonce)?)
    }

    async fn poll_until_terminal(
        &self,
        offset: JobOffset,
        policy: &AwaitPolicy,
        state_rx: &mut watch::Receiver<JobState>,
    ) -> ComputationResult<JobOutput> {
        loop {
            if let Some(result) = self.terminal_result(offset) {
                return result;
            }

            let cluster = self.cluster.clone();
            let status = self
                .with_retry(&policy.retry, offset, "poll", || {
                    let cluster = cluster.clone();
                    async move { cluster.poll_job(offset).await }
                })
                .await?;
            self.observe(offset, &status);
            if status.state().is_terminal() {
                continue;
            }

            tokio::select! {
                _ = sleep(policy.poll_interval) => {}
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        // sender dropped: job was released
                        return Err(ComputationError::UnknownJob { offset });
                    }
                }
            }
        }
    }

    /// Run a cluster call, retrying transient failures per the retry policy.
    /// The failure count starts from zero on every call.
    async fn with_retry<T, F, Fut>(
        &self,
        retry: &RetryPolicy,
        offset: JobOffset,
        op: &'static str,
        mut call: F,
    ) -> ComputationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let mut failures = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(ClusterError::Transient(msg)) => {
                    failures += 1;
                    metrics::increment_counter!("escrow_job_poll_retries_total");
                    if retry.exhausted(failures) {
                        warn!(%offset, op, failures, error = %msg, "Giving up on cluster call");
                        return Err(ComputationError::RetriesExhausted {
                            offset,
                            attempts: failures,
                            last_error: msg,
                        });
                    }
                    let delay = retry.delay_after(failures);
                    warn!(
                        %offset,
                        op,
                        attempt = failures,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "Transient cluster error, retrying"
                    );
                    sleep(delay).await;
                }
                Err(ClusterError::Rejected(reason)) => {
                    return Err(ComputationError::ClusterRejected { reason })
                }
                Err(ClusterError::UnknownJob(offset)) => {
                    return Err(ComputationError::UnknownJob { offset })
                }
            }
        }
    }

    /// Outcome of a terminal job, `None` while still outstanding.
    fn terminal_result(&self, offset: JobOffset) -> Option<ComputationResult<JobOutput>> {
        let jobs = self.jobs.lock();
        let Some(tracked) = jobs.get(&offset) else {
            return Some(Err(ComputationError::UnknownJob { offset }));
        };
        let job = &tracked.job;
        match job.state {
            JobState::Queued | JobState::Executing => None,
            JobState::Finalized => Some(
                job.output
                    .clone()
                    .ok_or_else(|| ComputationError::JobFailed {
                        offset,
                        reason: "finalized without output".into(),
                    }),
            ),
            JobState::Failed => Some(Err(ComputationError::JobFailed {
                offset,
                reason: job.failure.clone().unwrap_or_default(),
            })),
            JobState::Expired => Some(Err(ComputationError::JobExpired { offset })),
        }
    }

    /// Apply a cluster-reported status and wake waiters if it moved.
    fn observe(&self, offset: JobOffset, status: &JobStatus) {
        self.apply(offset, status, None);
    }

    fn apply(&self, offset: JobOffset, status: &JobStatus, nonce: Option<&EnvelopeNonce>) {
        let mut jobs = self.jobs.lock();
        let Some(tracked) = jobs.get_mut(&offset) else {
            debug!(%offset, "Status for untracked job ignored");
            return;
        };
        if nonce.map_or(false, |n| *n != tracked.job.request.nonce) {
            debug!(%offset, "Stale finalize event ignored");
            return;
        }
        let from = tracked.job.state;
        if tracked.job.observe(status) {
            debug!(%offset, ?from, to = ?tracked.job.state, "Job state advanced");
            tracked.state_tx.send_replace(tracked.job.state);
        }
    }

    /// Apply a finalize event unless it belongs to an earlier job that held
    /// the same offset.
    fn observe_event(&self, event: &FinalizeEvent) {
        self.apply(event.offset, &event.status(), Some(&event.request_nonce));
    }

    // =========================================================================
    // EVENTS / BOOKKEEPING
    // =========================================================================

    /// Feed finalize events from the cluster into job tracking. The task
    /// ends when the cluster side of the channel closes.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<FinalizeEvent>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(offset = %event.offset, "Finalize event received");
                client.observe_event(&event);
            }
            debug!("Finalize event channel closed");
        })
    }

    /// Forget a terminal job, freeing its offset here and on the cluster.
    pub fn release(&self, handle: &JobHandle) -> ComputationResult<ComputationJob> {
        let mut jobs = self.jobs.lock();
        let tracked = jobs
            .get(&handle.offset)
            .ok_or(ComputationError::UnknownJob { offset: handle.offset })?;
        if !tracked.job.state.is_terminal() {
            return Err(ComputationError::InvalidInput(format!(
                "job {} is still {:?}",
                handle.offset, tracked.job.state
            )));
        }
        let tracked = jobs
            .remove(&handle.offset)
            .ok_or(ComputationError::UnknownJob { offset: handle.offset })?;
        drop(jobs);
        self.cluster.forget_job(handle.offset);
        debug!(offset = %handle.offset, "Job released");
        Ok(tracked.job)
    }

    pub fn job(&self, offset: JobOffset) -> Option<ComputationJob> {
        self.jobs.lock().get(&offset).map(|t| t.job.clone())
    }

    /// Jobs not yet terminal.
    pub fn outstanding(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|t| !t.job.state.is_terminal())
            .count()
    }
}

impl std::fmt::Debug for ComputationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationClient")
            .field("policy", &self.policy)
            .field("jobs", &self.jobs.lock().len())
            .finish()
    }
}

//! Integration tests for the confidential computation protocol
//!
//! Drives the requester side against the in-process `LocalCluster`:
//! definition registration, envelope encryption, concurrent jobs, kernel
//! aborts, offset release and reuse, and per-call await bounds. Time is
//! paused so stage delays and poll intervals elapse instantly.

use escrow_settlement::confidential::{
    kinds, random_nonce, CircuitSource, ComputationClient, ComputationDefinitionRegistry,
    ComputationError, EnvelopeCipher, EnvelopeKeypair, JobOffset, JobState, LocalCluster,
    LocalClusterConfig,
};
use escrow_settlement::{telemetry, Config};
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    Config::from_toml_str(
        r#"
        [computation]
        poll_interval_ms = 100
        timeout_ms = 10000
        max_attempts = 4
        initial_backoff_ms = 50
        backoff = "exponential"
        max_backoff_ms = 400
        "#,
    )
    .expect("valid config")
}

fn registry() -> Arc<ComputationDefinitionRegistry> {
    let registry = Arc::new(ComputationDefinitionRegistry::new());
    registry
        .register_off_chain(
            kinds::ADD_TOGETHER,
            "https://circuits.invalid/add_together.arcis",
            [7u8; 32],
        )
        .expect("add_together active");
    registry
}

fn setup() -> (Arc<ComputationClient>, LocalCluster) {
    telemetry::init_tracing();
    let (cluster, events) = LocalCluster::new(LocalClusterConfig {
        stage_delay: Duration::from_millis(150),
        seed: 7,
    });
    let client = Arc::new(ComputationClient::new(
        Arc::new(cluster.clone()),
        registry(),
        config().computation.await_policy(),
    ));
    client.spawn_event_pump(events);
    (client, cluster)
}

#[tokio::test(start_paused = true)]
async fn test_add_together_round_trip() {
    let (client, cluster) = setup();
    let keypair = EnvelopeKeypair::generate();

    let (handle, cipher) = client
        .submit_plaintext(kinds::ADD_TOGETHER, &keypair, &[19, 23])
        .await
        .unwrap();
    assert_eq!(client.outstanding(), 1);

    let sum = client.await_plaintext(&handle, &cipher).await.unwrap();
    assert_eq!(sum, vec![42]);
    assert_eq!(client.outstanding(), 0);
    assert_eq!(cluster.job_count(), 1);

    let job = client.release(&handle).unwrap();
    assert_eq!(job.state, JobState::Finalized);
    assert!(client.job(handle.offset).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_jobs_finalize_independently() {
    let (client, _cluster) = setup();
    let keypair = EnvelopeKeypair::generate();

    let mut waits = Vec::new();
    for a in 0..8u128 {
        let client = client.clone();
        let (handle, cipher) = client
            .submit_plaintext(kinds::ADD_TOGETHER, &keypair, &[a, a * 10])
            .await
            .unwrap();
        waits.push(tokio::spawn(async move {
            client.await_plaintext(&handle, &cipher).await
        }));
    }

    for (a, wait) in waits.into_iter().enumerate() {
        let sum = wait.await.unwrap().unwrap();
        assert_eq!(sum, vec![a as u128 * 11]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_kernel_abort_reports_failure() {
    let (client, _cluster) = setup();
    let keypair = EnvelopeKeypair::generate();

    // 300 does not fit the u8 limb the kernel expects
    let (handle, _cipher) = client
        .submit_plaintext(kinds::ADD_TOGETHER, &keypair, &[300, 1])
        .await
        .unwrap();
    match client.await_finalization(&handle).await {
        Err(ComputationError::JobFailed { offset, reason }) => {
            assert_eq!(offset, handle.offset);
            assert!(reason.contains("does not fit"), "reason: {reason}");
        }
        other => panic!("expected JobFailed, got {:?}", other),
    }
    assert_eq!(client.job(handle.offset).unwrap().state, JobState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_kind_is_refused_before_submit() {
    let (client, cluster) = setup();
    let keypair = EnvelopeKeypair::generate();

    let err = client
        .submit_plaintext(kinds::JOIN_GAME, &keypair, &[1])
        .await
        .unwrap_err();
    assert!(matches!(err, ComputationError::DefinitionNotReady { .. }));
    assert_eq!(cluster.job_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_uploaded_definition_with_custom_kernel() {
    telemetry::init_tracing();
    let (cluster, events) = LocalCluster::new(LocalClusterConfig::default());
    cluster.install_kernel(
        kinds::JOIN_GAME,
        Arc::new(|inputs: &[u128]| {
            Ok::<_, anyhow::Error>(vec![inputs.iter().sum::<u128>() % 2])
        }),
    );

    let registry = Arc::new(ComputationDefinitionRegistry::new());
    let handle = registry.register(kinds::JOIN_GAME).unwrap();
    registry
        .activate(
            kinds::JOIN_GAME,
            CircuitSource::Uploaded {
                offset: handle.offset,
                bytecode: vec![0xAB; 64],
            },
        )
        .unwrap();

    let client = Arc::new(ComputationClient::new(
        Arc::new(cluster.clone()),
        registry,
        config().computation.await_policy(),
    ));
    client.spawn_event_pump(events);

    let keypair = EnvelopeKeypair::generate();
    let (job, cipher) = client
        .submit_plaintext(kinds::JOIN_GAME, &keypair, &[3, 4, 6])
        .await
        .unwrap();
    assert_eq!(client.await_plaintext(&job, &cipher).await.unwrap(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_poll_failures_within_budget() {
    let (client, cluster) = setup();
    // a fourth consecutive failure would exhaust the budget
    cluster.fail_next_polls(3);
    let keypair = EnvelopeKeypair::generate();

    let (handle, cipher) = client
        .submit_plaintext(kinds::ADD_TOGETHER, &keypair, &[100, 155])
        .await
        .unwrap();
    assert_eq!(client.await_plaintext(&handle, &cipher).await.unwrap(), vec![255]);
}

#[tokio::test(start_paused = true)]
async fn test_released_offset_resubmits_on_local_cluster() {
    let (client, cluster) = setup();
    let keypair = EnvelopeKeypair::generate();
    let cipher = EnvelopeCipher::between(&keypair, &client.cluster_public_key()).unwrap();
    let offset = JobOffset(77);

    let nonce = random_nonce();
    let inputs = cipher.encrypt(&[2, 3], &nonce).unwrap();
    let first = client
        .submit(kinds::ADD_TOGETHER, offset, inputs, keypair.public_key(), nonce)
        .await
        .unwrap();
    assert_eq!(client.await_plaintext(&first, &cipher).await.unwrap(), vec![5]);
    client.release(&first).unwrap();
    assert_eq!(cluster.job_count(), 0);

    let nonce = random_nonce();
    let inputs = cipher.encrypt(&[40, 2], &nonce).unwrap();
    let second = client
        .submit(kinds::ADD_TOGETHER, offset, inputs, keypair.public_key(), nonce)
        .await
        .expect("released offset accepted again");
    assert_eq!(client.await_plaintext(&second, &cipher).await.unwrap(), vec![42]);
}

#[tokio::test(start_paused = true)]
async fn test_short_wait_times_out_then_longer_wait_finalizes() {
    let (client, _cluster) = setup();
    let keypair = EnvelopeKeypair::generate();
    let (handle, _cipher) = client
        .submit_plaintext(kinds::ADD_TOGETHER, &keypair, &[1, 1])
        .await
        .unwrap();

    // two 150ms stages cannot finish inside 100ms
    let mut hasty = client.policy().clone();
    hasty.timeout = Duration::from_millis(100);
    let err = client.await_finalization_with(&handle, &hasty).await.unwrap_err();
    assert!(matches!(err, ComputationError::Timeout { .. }));
    assert_eq!(client.job(handle.offset).unwrap().state, JobState::Queued);

    assert!(client.await_finalization(&handle).await.is_ok());
}

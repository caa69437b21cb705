//! End-to-end scenarios against the scripted replica.

mod common;

use assert_matches::assert_matches;
use common::{canister, MockReplica};
use icx_agent::poll::{ExponentialPollStrategyFactory, PollStrategy, PollStrategyFactory};
use icx_agent::{
    Agent, AgentError, CallOptions, CertificateError, ErrorKind, QueryOptions,
};
use icx_types::{CanisterId, Expiry, Time, TimeProvider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 2025-05-01T12:34:56.789Z.
const NOW: Time = Time::from_nanos_since_unix_epoch(1_746_102_896_789_000_000);
const SIX_MINUTES: Duration = Duration::from_secs(6 * 60);

fn hosted_canister() -> CanisterId {
    canister("uxrrr-q7777-77774-qaaaq-cai")
}

fn agent_builder(replica: &Arc<MockReplica>, clock: Time) -> icx_agent::AgentBuilder {
    Agent::builder(Arc::clone(replica) as Arc<dyn icx_agent::transport::Transport>)
        .with_root_public_key_der(replica.root_public_key_der())
        .with_time_source(Arc::new(TimeProvider::Constant(clock)))
}

#[tokio::test(start_paused = true)]
async fn happy_query_returns_the_reply_with_one_key_fetch() {
    let replica = Arc::new(MockReplica::new(NOW, &hosted_canister()));
    let agent = agent_builder(&replica, NOW).build().unwrap();

    let result = agent
        .query(&hosted_canister(), "greet", b"world".to_vec(), QueryOptions::default())
        .await
        .expect("query failed");

    assert_eq!(result.reply, b"Hello, world!");
    assert_eq!(replica.query_count.load(Ordering::SeqCst), 1);
    assert_eq!(replica.read_state_count(), 1);
    assert_eq!(replica.subnet_read_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn skewed_clock_fails_the_query_before_any_key_fetch() {
    let replica = Arc::new(MockReplica::new(NOW, &hosted_canister()));
    let skewed_clock = NOW + SIX_MINUTES;
    let agent = agent_builder(&replica, skewed_clock)
        .with_retry_times(0)
        .build()
        .unwrap();

    let err = agent
        .query(&hosted_canister(), "greet", b"world".to_vec(), QueryOptions::default())
        .await
        .expect_err("query should have failed");

    assert_eq!(err.kind(), ErrorKind::Trust);
    assert!(err.is_outdated_trust());
    assert_eq!(replica.query_count.load(Ordering::SeqCst), 1);
    assert_eq!(replica.read_state_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_queries_exhaust_the_retry_budget_then_surface() {
    let replica = Arc::new(MockReplica::new(NOW, &hosted_canister()));
    let skewed_clock = NOW + SIX_MINUTES;
    let agent = agent_builder(&replica, skewed_clock)
        .with_retry_times(3)
        .build()
        .unwrap();

    let err = agent
        .query(&hosted_canister(), "greet", b"world".to_vec(), QueryOptions::default())
        .await
        .expect_err("query should have failed");

    assert_eq!(err.kind(), ErrorKind::Trust);
    // Initial attempt plus three retries.
    assert_eq!(replica.query_count.load(Ordering::SeqCst), 4);
    assert_eq!(replica.read_state_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn fetching_keys_for_a_foreign_canister_fails_range_containment() {
    let hosted = canister("v2nog-2aaaa-aaaab-p777q-cai");
    let foreign = canister("jrlun-jiaaa-aaaab-aaaaa-cai");
    let replica = Arc::new(MockReplica::new(NOW, &hosted));
    let agent = agent_builder(&replica, NOW).build().unwrap();

    let err = agent
        .fetch_subnet_keys(&foreign)
        .await
        .expect_err("key fetch should have failed");

    assert_matches!(
        err,
        AgentError::Trust(CertificateError::NotInRanges { canister_id }) if canister_id == foreign
    );
    assert_eq!(replica.read_state_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn initial_time_sync_absorbs_replica_lag() {
    let replica_time = NOW.saturating_sub(SIX_MINUTES);
    let mut replica = MockReplica::new(replica_time, &hosted_canister());
    replica.reply_blob = b"done".to_vec();
    let replica = Arc::new(replica);
    let agent = agent_builder(&replica, NOW)
        .with_should_sync_time(true)
        .build()
        .unwrap();

    let result = agent
        .call(&hosted_canister(), "bump", Vec::new(), CallOptions::default())
        .await
        .expect("call failed");

    assert_eq!(result.reply, b"done");
    assert!(agent.has_synced_time());
    assert_eq!(replica.time_read_count.load(Ordering::SeqCst), 3);
    assert_eq!(agent.drift_estimate_ms(), -(6 * 60 * 1000));

    // The deadline is computed against the replica's clock: five minutes
    // out, floored to the minute.
    let expected =
        Expiry::from_delta(Duration::from_secs(5 * 60), agent.drift_estimate_ms(), NOW);
    assert_eq!(
        replica.last_call_expiry.load(Ordering::SeqCst),
        expected.as_nanos()
    );
    let expiry_ms = expected.as_nanos() / 1_000_000;
    assert_eq!(expiry_ms % 60_000, 0);
}

struct CountingFactory {
    inner: ExponentialPollStrategyFactory,
    instantiations: Arc<AtomicUsize>,
}

impl PollStrategyFactory for CountingFactory {
    fn instantiate(&self) -> Box<dyn PollStrategy> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        self.inner.instantiate()
    }
}

#[tokio::test(start_paused = true)]
async fn each_call_instantiates_its_own_poll_strategy() {
    let replica = Arc::new(MockReplica::new(NOW, &hosted_canister()));
    let instantiations = Arc::new(AtomicUsize::new(0));
    let agent = agent_builder(&replica, NOW)
        .with_poll_strategy_factory(Arc::new(CountingFactory {
            inner: ExponentialPollStrategyFactory::default(),
            instantiations: Arc::clone(&instantiations),
        }))
        .build()
        .unwrap();

    for _ in 0..2 {
        agent
            .call(&hosted_canister(), "bump", Vec::new(), CallOptions::default())
            .await
            .expect("call failed");
    }

    assert_eq!(instantiations.load(Ordering::SeqCst), 2);
    assert_eq!(replica.call_count.load(Ordering::SeqCst), 2);
    assert_eq!(replica.status_read_count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn an_accepted_call_polls_to_a_settled_reply() {
    let mut replica = MockReplica::new(NOW, &hosted_canister());
    replica.reply_blob = b"settled".to_vec();
    let replica = Arc::new(replica);
    let agent = agent_builder(&replica, NOW).build().unwrap();

    let result = agent
        .call(&hosted_canister(), "bump", Vec::new(), CallOptions::default())
        .await
        .expect("call failed");

    assert_eq!(result.reply, b"settled");
    assert_eq!(replica.call_count.load(Ordering::SeqCst), 1);
    assert_eq!(replica.status_read_count.load(Ordering::SeqCst), 1);
    assert_eq!(result.certificate.time(), NOW);
}

#[tokio::test(start_paused = true)]
async fn a_cancelled_token_aborts_before_submission() {
    let replica = Arc::new(MockReplica::new(NOW, &hosted_canister()));
    let agent = agent_builder(&replica, NOW).build().unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = agent
        .call(
            &hosted_canister(),
            "bump",
            Vec::new(),
            CallOptions {
                cancellation_token: Some(token),
                ..Default::default()
            },
        )
        .await
        .expect_err("call should have been cancelled");

    assert_matches!(err, AgentError::Cancelled);
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(replica.call_count.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn queries_reuse_the_cached_subnet_topology() {
    let replica = Arc::new(MockReplica::new(NOW, &hosted_canister()));
    let agent = agent_builder(&replica, NOW).build().unwrap();

    for _ in 0..3 {
        agent
            .query(&hosted_canister(), "greet", b"world".to_vec(), QueryOptions::default())
            .await
            .expect("query failed");
    }

    assert_eq!(replica.query_count.load(Ordering::SeqCst), 3);
    // The node-key fetch happened exactly once.
    assert_eq!(replica.subnet_read_count.load(Ordering::SeqCst), 1);

    let subnet_id = agent
        .get_subnet_id_from_canister(&hosted_canister())
        .await
        .expect("no subnet id");
    assert_eq!(
        agent.fetch_subnet_keys(&hosted_canister()).await.unwrap().subnet_id,
        subnet_id
    );
    assert_eq!(replica.subnet_read_count.load(Ordering::SeqCst), 1);
}

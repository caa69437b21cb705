//! The request engine: builds, signs, submits, polls, and verifies.

use crate::cbor::{self, CallResponse, QueryResponse, ReadStateResponse, StatusResponse};
use crate::error::{AgentError, ErrorKind};
use crate::identity::{AnonymousIdentity, Identity, SignedRequestAuth};
use crate::poll::{ExponentialPollStrategyFactory, PollStrategyFactory};
use crate::query;
use crate::transport::{
    call_path, query_path, read_state_path, subnet_read_state_path, Transport, STATUS_PATH,
};
use icx_certification::{CertificateScope, CertificateVerifier, VerifiedCertificate};
use icx_tree_hash::{Label, LookupStatus, Path};
use icx_types::messages::{
    Blob, HttpCallContent, HttpCanisterUpdate, HttpQueryContent, HttpReadState,
    HttpReadStateContent, HttpUserQuery, MessageId,
};
use icx_types::{CanisterId, Expiry, NodeId, SubnetId, Time, TimeProvider, TimeSource};
use slog::{debug, info, o, Logger};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline delta for freshly built requests.
const DEFAULT_INGRESS_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// How long to keep polling an accepted update before giving up.
const DEFAULT_INGRESS_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// Deadline for a single transport round-trip.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A settled status takes at least the time between consensus batches, so
/// the first poll is not immediate.
const DEFAULT_FIRST_POLL_DELAY: Duration = Duration::from_secs(2);

const DEFAULT_RETRY_TIMES: usize = 3;
const DEFAULT_TIME_SYNC_SAMPLES: usize = 3;
const POLL_DELAY_FALLBACK: Duration = Duration::from_secs(10);

/// A subnet's identity and per-node signing keys, cached per engine.
#[derive(Clone, Debug)]
pub struct SubnetTopology {
    pub subnet_id: SubnetId,
    pub node_keys: BTreeMap<NodeId, Vec<u8>>,
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub nonce: Option<Blob>,
    pub cancellation_token: Option<CancellationToken>,
}

/// Per-query options.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub nonce: Option<Blob>,
    /// Overrides the engine-wide `verify_query_signatures` setting.
    pub verify_signatures: Option<bool>,
    pub cancellation_token: Option<CancellationToken>,
}

/// Outcome of a settled update call.
#[derive(Debug)]
pub struct CallResult {
    pub reply: Vec<u8>,
    pub request_id: MessageId,
    pub certificate: VerifiedCertificate,
}

/// Outcome of a query.
#[derive(Debug)]
pub struct QueryResult {
    pub reply: Vec<u8>,
    pub request_id: MessageId,
}

enum SettledStatus {
    Replied(Vec<u8>),
    Rejected {
        reject_code: u64,
        reject_message: String,
        error_code: Option<String>,
    },
    Done,
    Pending,
}

pub struct AgentBuilder {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn Identity>,
    root_public_key_der: Option<Vec<u8>>,
    ingress_expiry: Duration,
    ingress_timeout: Duration,
    request_timeout: Duration,
    first_poll_delay: Duration,
    retry_times: usize,
    verify_query_signatures: bool,
    should_sync_time: bool,
    time_sync_samples: usize,
    permitted_drift: Duration,
    poll_strategy_factory: Arc<dyn PollStrategyFactory>,
    time_source: Arc<dyn TimeSource>,
    log: Logger,
}

impl AgentBuilder {
    pub fn with_identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = identity;
        self
    }

    /// The network root public key, DER encoded. Required.
    pub fn with_root_public_key_der(mut self, der: Vec<u8>) -> Self {
        self.root_public_key_der = Some(der);
        self
    }

    pub fn with_ingress_expiry(mut self, delta: Duration) -> Self {
        self.ingress_expiry = delta;
        self
    }

    pub fn with_ingress_timeout(mut self, timeout: Duration) -> Self {
        self.ingress_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_first_poll_delay(mut self, delay: Duration) -> Self {
        self.first_poll_delay = delay;
        self
    }

    pub fn with_retry_times(mut self, retry_times: usize) -> Self {
        self.retry_times = retry_times;
        self
    }

    pub fn with_verify_query_signatures(mut self, verify: bool) -> Self {
        self.verify_query_signatures = verify;
        self
    }

    pub fn with_should_sync_time(mut self, sync: bool) -> Self {
        self.should_sync_time = sync;
        self
    }

    pub fn with_time_sync_samples(mut self, samples: usize) -> Self {
        self.time_sync_samples = samples;
        self
    }

    pub fn with_permitted_drift(mut self, drift: Duration) -> Self {
        self.permitted_drift = drift;
        self
    }

    pub fn with_poll_strategy_factory(mut self, factory: Arc<dyn PollStrategyFactory>) -> Self {
        self.poll_strategy_factory = factory;
        self
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn with_logger(mut self, log: Logger) -> Self {
        self.log = log;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let root_public_key_der = self.root_public_key_der.ok_or_else(|| {
            AgentError::InvalidArgument("an agent requires a root public key".to_string())
        })?;
        Ok(Agent {
            transport: self.transport,
            identity: tokio::sync::RwLock::new(self.identity),
            root_public_key_der: RwLock::new(root_public_key_der),
            drift_estimate_ns: AtomicI64::new(0),
            synced_time: AtomicBool::new(false),
            topologies: RwLock::new(HashMap::new()),
            canister_subnets: RwLock::new(HashMap::new()),
            ingress_expiry: self.ingress_expiry,
            ingress_timeout: self.ingress_timeout,
            request_timeout: self.request_timeout,
            first_poll_delay: self.first_poll_delay,
            retry_times: self.retry_times,
            verify_query_signatures: self.verify_query_signatures,
            should_sync_time: self.should_sync_time,
            time_sync_samples: self.time_sync_samples,
            permitted_drift: self.permitted_drift,
            poll_strategy_factory: self.poll_strategy_factory,
            time_source: self.time_source,
            log: self.log,
        })
    }
}

/// The verifying request engine.
///
/// Shared state is limited to the drift estimate, the identity, and the
/// subnet topology cache; everything else is read-only after construction.
/// A concurrent time sync never blocks in-flight calls: each call uses the
/// drift it captured when it was built.
pub struct Agent {
    transport: Arc<dyn Transport>,
    identity: tokio::sync::RwLock<Arc<dyn Identity>>,
    root_public_key_der: RwLock<Vec<u8>>,
    drift_estimate_ns: AtomicI64,
    synced_time: AtomicBool,
    topologies: RwLock<HashMap<SubnetId, Arc<SubnetTopology>>>,
    canister_subnets: RwLock<HashMap<CanisterId, SubnetId>>,
    ingress_expiry: Duration,
    ingress_timeout: Duration,
    request_timeout: Duration,
    first_poll_delay: Duration,
    retry_times: usize,
    verify_query_signatures: bool,
    should_sync_time: bool,
    time_sync_samples: usize,
    permitted_drift: Duration,
    poll_strategy_factory: Arc<dyn PollStrategyFactory>,
    time_source: Arc<dyn TimeSource>,
    log: Logger,
}

impl Agent {
    pub fn builder(transport: Arc<dyn Transport>) -> AgentBuilder {
        AgentBuilder {
            transport,
            identity: Arc::new(AnonymousIdentity),
            root_public_key_der: None,
            ingress_expiry: DEFAULT_INGRESS_EXPIRY,
            ingress_timeout: DEFAULT_INGRESS_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            first_poll_delay: DEFAULT_FIRST_POLL_DELAY,
            retry_times: DEFAULT_RETRY_TIMES,
            verify_query_signatures: true,
            should_sync_time: false,
            time_sync_samples: DEFAULT_TIME_SYNC_SAMPLES,
            permitted_drift: icx_certification::DEFAULT_PERMITTED_DRIFT,
            poll_strategy_factory: Arc::new(ExponentialPollStrategyFactory::default()),
            time_source: Arc::new(TimeProvider::SystemTime),
            log: Logger::root(slog::Discard, o!()),
        }
    }

    /// The engine's current estimate of `network clock - local clock`.
    pub fn drift_estimate_ms(&self) -> i64 {
        self.drift_estimate_ns.load(Ordering::SeqCst) / 1_000_000
    }

    pub fn has_synced_time(&self) -> bool {
        self.synced_time.load(Ordering::SeqCst)
    }

    /// Swaps the signing identity. Waits for in-flight signs to complete so
    /// no request is signed by a half-replaced identity.
    pub async fn replace_identity(&self, identity: Arc<dyn Identity>) {
        let mut guard = self.identity.write().await;
        *guard = identity;
    }

    /// Submits an update call and drives it to a settled status.
    pub async fn call(
        &self,
        canister_id: &CanisterId,
        method_name: &str,
        arg: Vec<u8>,
        options: CallOptions,
    ) -> Result<CallResult, AgentError> {
        self.initial_time_sync_if_needed(canister_id).await?;
        let mut attempts_left = self.retry_times;
        let mut synced_for_expiry = false;
        loop {
            match self.execute_call(canister_id, method_name, &arg, &options).await {
                Ok(result) => return Ok(result),
                Err(e) if e.kind() == ErrorKind::IngressExpiryInvalid && !synced_for_expiry => {
                    info!(self.log, "replica rejected the ingress expiry, synchronising time");
                    synced_for_expiry = true;
                    self.sync_time_with_canister(canister_id).await?;
                }
                Err(e) if (e.is_transient() || e.is_outdated_trust()) && attempts_left > 0 => {
                    attempts_left -= 1;
                    debug!(self.log, "retrying call"; "error" => %e, "attempts_left" => attempts_left);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Submits a query and, by default, verifies its node signatures.
    pub async fn query(
        &self,
        canister_id: &CanisterId,
        method_name: &str,
        arg: Vec<u8>,
        options: QueryOptions,
    ) -> Result<QueryResult, AgentError> {
        self.initial_time_sync_if_needed(canister_id).await?;
        let verify_signatures = options
            .verify_signatures
            .unwrap_or(self.verify_query_signatures);
        let mut attempts_left = self.retry_times;
        let mut synced_for_expiry = false;
        loop {
            match self
                .execute_query(canister_id, method_name, &arg, verify_signatures, &options)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if e.kind() == ErrorKind::IngressExpiryInvalid && !synced_for_expiry => {
                    info!(self.log, "replica rejected the ingress expiry, synchronising time");
                    synced_for_expiry = true;
                    self.sync_time_with_canister(canister_id).await?;
                }
                Err(e) if (e.is_transient() || e.is_outdated_trust()) && attempts_left > 0 => {
                    attempts_left -= 1;
                    debug!(self.log, "retrying query"; "error" => %e, "attempts_left" => attempts_left);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads canister state paths and returns the verified certificate.
    pub async fn read_state(
        &self,
        canister_id: &CanisterId,
        paths: Vec<Path>,
    ) -> Result<VerifiedCertificate, AgentError> {
        let mut attempts_left = self.retry_times;
        loop {
            match self
                .read_state_inner(canister_id, paths.clone(), false, self.drift_estimate_ms())
                .await
            {
                Ok(verified) => return Ok(verified),
                Err(e) if e.is_transient() && attempts_left > 0 => attempts_left -= 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads subnet state paths and returns the verified certificate.
    pub async fn read_subnet_state(
        &self,
        subnet_id: &SubnetId,
        paths: Vec<Path>,
    ) -> Result<VerifiedCertificate, AgentError> {
        let mut attempts_left = self.retry_times;
        loop {
            match self
                .read_subnet_state_inner(subnet_id, paths.clone(), false, self.drift_estimate_ms())
                .await
            {
                Ok(verified) => return Ok(verified),
                Err(e) if e.is_transient() && attempts_left > 0 => attempts_left -= 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolves and caches the topology of the subnet hosting `canister_id`.
    ///
    /// The read-state certificate's delegation proves the canister is within
    /// the subnet's ranges; asking for a canister the subnet does not host
    /// fails verification.
    pub async fn fetch_subnet_keys(
        &self,
        canister_id: &CanisterId,
    ) -> Result<Arc<SubnetTopology>, AgentError> {
        if let Some(topology) = self.cached_topology(canister_id) {
            return Ok(topology);
        }
        let paths = vec![Path::from(Label::from("subnet"))];
        let verified = self
            .read_state_inner(canister_id, paths, false, self.drift_estimate_ms())
            .await?;
        let subnet_id = verified.signing_subnet().clone();
        let node_keys = verified.subnet_node_keys(&subnet_id)?;
        let topology = Arc::new(SubnetTopology {
            subnet_id: subnet_id.clone(),
            node_keys,
        });
        info!(
            self.log, "cached subnet topology";
            "subnet_id" => %subnet_id, "nodes" => topology.node_keys.len()
        );
        self.topologies
            .write()
            .expect("subnet topology cache poisoned")
            .insert(subnet_id.clone(), Arc::clone(&topology));
        self.canister_subnets
            .write()
            .expect("canister subnet cache poisoned")
            .insert(canister_id.clone(), subnet_id);
        Ok(topology)
    }

    /// The subnet hosting `canister_id`, from the cache or a key fetch.
    pub async fn get_subnet_id_from_canister(
        &self,
        canister_id: &CanisterId,
    ) -> Result<SubnetId, AgentError> {
        if let Some(subnet_id) = self
            .canister_subnets
            .read()
            .expect("canister subnet cache poisoned")
            .get(canister_id)
        {
            return Ok(subnet_id.clone());
        }
        Ok(self.fetch_subnet_keys(canister_id).await?.subnet_id.clone())
    }

    /// Estimates clock drift against the network via the management
    /// pseudo-canister.
    pub async fn sync_time(&self) -> Result<(), AgentError> {
        self.sync_time_with_canister(&CanisterId::management()).await
    }

    /// Estimates clock drift from certified `/time` reads against the
    /// subnet hosting `canister_id`. The median of the samples absorbs a
    /// single lagging replica.
    pub async fn sync_time_with_canister(
        &self,
        canister_id: &CanisterId,
    ) -> Result<(), AgentError> {
        let samples = self.time_sync_samples.max(1);
        let mut times = Vec::with_capacity(samples);
        for _ in 0..samples {
            let verified = self
                .read_state_inner(canister_id, vec![Path::from(Label::from("time"))], true, 0)
                .await?;
            times.push(verified.time());
        }
        self.finish_time_sync(times);
        Ok(())
    }

    /// Same as [`Agent::sync_time_with_canister`] against an explicit subnet.
    pub async fn sync_time_with_subnet(&self, subnet_id: &SubnetId) -> Result<(), AgentError> {
        let samples = self.time_sync_samples.max(1);
        let mut times = Vec::with_capacity(samples);
        for _ in 0..samples {
            let verified = self
                .read_subnet_state_inner(subnet_id, vec![Path::from(Label::from("time"))], true, 0)
                .await?;
            times.push(verified.time());
        }
        self.finish_time_sync(times);
        Ok(())
    }

    /// The unauthenticated replica status.
    pub async fn status(&self) -> Result<StatusResponse, AgentError> {
        let response = self
            .transport
            .get(STATUS_PATH, Instant::now() + self.request_timeout)
            .await?;
        if response.status != 200 {
            return Err(classify_http(response.status, response.body));
        }
        cbor::decode_body(&response.body)
    }

    /// Fetches the root key from the status endpoint and trusts it from
    /// then on. Development networks only; production roots ship with the
    /// client.
    pub async fn fetch_root_key(&self) -> Result<Vec<u8>, AgentError> {
        let status = self.status().await?;
        let root_key = status.root_key.ok_or_else(|| {
            AgentError::ProtocolViolation("status response carries no root key".to_string())
        })?;
        let der = root_key.into_vec();
        *self
            .root_public_key_der
            .write()
            .expect("root key lock poisoned") = der.clone();
        Ok(der)
    }

    async fn initial_time_sync_if_needed(
        &self,
        canister_id: &CanisterId,
    ) -> Result<(), AgentError> {
        if self.should_sync_time && !self.has_synced_time() {
            self.sync_time_with_canister(canister_id).await?;
        }
        Ok(())
    }

    fn finish_time_sync(&self, mut times: Vec<Time>) {
        times.sort_unstable();
        let median = times[times.len() / 2];
        let now = self.time_source.current_time();
        let drift_ns = median.as_nanos_since_unix_epoch() as i64
            - now.as_nanos_since_unix_epoch() as i64;
        self.drift_estimate_ns.store(drift_ns, Ordering::SeqCst);
        self.synced_time.store(true, Ordering::SeqCst);
        info!(self.log, "synchronised time with the network"; "drift_ms" => drift_ns / 1_000_000);
    }

    fn cached_topology(&self, canister_id: &CanisterId) -> Option<Arc<SubnetTopology>> {
        let subnet_id = self
            .canister_subnets
            .read()
            .expect("canister subnet cache poisoned")
            .get(canister_id)
            .cloned()?;
        self.topologies
            .read()
            .expect("subnet topology cache poisoned")
            .get(&subnet_id)
            .cloned()
    }

    fn ingress_expiry_now(&self, drift_ms: i64) -> u64 {
        Expiry::from_delta(self.ingress_expiry, drift_ms, self.time_source.current_time())
            .as_nanos()
    }

    fn certificate_verifier(&self, disable_time_verification: bool) -> CertificateVerifier {
        CertificateVerifier::new(
            self.root_public_key_der
                .read()
                .expect("root key lock poisoned")
                .clone(),
        )
        .with_permitted_drift(self.permitted_drift)
        .with_time_verification_disabled(disable_time_verification)
        .with_time_source(Arc::clone(&self.time_source))
    }

    async fn execute_call(
        &self,
        canister_id: &CanisterId,
        method_name: &str,
        arg: &[u8],
        options: &CallOptions,
    ) -> Result<CallResult, AgentError> {
        let token = options.cancellation_token.as_ref();
        let drift_ms = self.drift_estimate_ms();
        let (request_id, body) = {
            let identity = self.identity.read().await;
            let update = HttpCanisterUpdate {
                canister_id: Blob(canister_id.as_slice().to_vec()),
                method_name: method_name.to_string(),
                arg: Blob(arg.to_vec()),
                sender: Blob(identity.sender().into_vec()),
                ingress_expiry: self.ingress_expiry_now(drift_ms),
                nonce: options.nonce.clone(),
            };
            let request_id = update.id();
            let auth = with_cancellation(token, identity.sign(&request_id)).await?;
            let body = cbor::encode_envelope(HttpCallContent::Call { update }, auth)?;
            (request_id, body)
        };
        debug!(self.log, "submitting call"; "request_id" => %request_id, "method" => method_name);
        let response = with_cancellation(
            token,
            self.transport.post(
                &call_path(canister_id),
                body,
                Instant::now() + self.request_timeout,
            ),
        )
        .await?;
        match response.status {
            200 => {
                let call_response: CallResponse = cbor::decode_body(&response.body)?;
                if let Some(certificate) = call_response.certificate {
                    let verified = self.verify_for_canister(
                        certificate.as_slice(),
                        canister_id,
                        drift_ms,
                        false,
                    )?;
                    match settled_request_status(&verified, &request_id)? {
                        SettledStatus::Replied(reply) => Ok(CallResult {
                            reply,
                            request_id,
                            certificate: verified,
                        }),
                        SettledStatus::Rejected {
                            reject_code,
                            reject_message,
                            error_code,
                        } => Err(AgentError::CallRejected {
                            reject_code,
                            reject_message,
                            error_code,
                        }),
                        SettledStatus::Done => Err(AgentError::ProtocolViolation(
                            "the call settled but its reply has been pruned".to_string(),
                        )),
                        // A 200 with a certificate that does not settle the
                        // request falls back to polling.
                        SettledStatus::Pending => {
                            self.poll_for_settlement(canister_id, request_id, drift_ms, token)
                                .await
                        }
                    }
                } else if call_response.status.as_deref() == Some("non_replicated_rejection") {
                    Err(AgentError::CallRejected {
                        reject_code: call_response.reject_code.unwrap_or_default(),
                        reject_message: call_response.reject_message.unwrap_or_default(),
                        error_code: call_response.error_code,
                    })
                } else {
                    Err(AgentError::ProtocolViolation(
                        "call response carries neither certificate nor rejection".to_string(),
                    ))
                }
            }
            202 => {
                self.poll_for_settlement(canister_id, request_id, drift_ms, token)
                    .await
            }
            status => Err(classify_http(status, response.body)),
        }
    }

    async fn poll_for_settlement(
        &self,
        canister_id: &CanisterId,
        request_id: MessageId,
        drift_ms: i64,
        token: Option<&CancellationToken>,
    ) -> Result<CallResult, AgentError> {
        let mut strategy = self.poll_strategy_factory.instantiate();
        let deadline = Instant::now() + self.ingress_timeout;
        let mut next_poll = Instant::now() + self.first_poll_delay;
        let status_paths = vec![Path::new(vec![
            Label::from("request_status"),
            Label::from(request_id.as_bytes().as_slice()),
        ])];
        loop {
            if next_poll >= deadline {
                return Err(AgentError::IngressTimeout {
                    request_id: request_id.to_string(),
                });
            }
            with_cancellation(token, async {
                tokio::time::sleep_until(next_poll).await;
                Ok(())
            })
            .await?;
            next_poll =
                Instant::now() + strategy.next_poll_delay().unwrap_or(POLL_DELAY_FALLBACK);
            let verified = match with_cancellation(
                token,
                self.read_state_inner(canister_id, status_paths.clone(), false, drift_ms),
            )
            .await
            {
                Ok(verified) => verified,
                Err(e) if e.is_transient() => {
                    debug!(self.log, "transient failure while polling"; "error" => %e);
                    continue;
                }
                // Trust failures terminate polling immediately.
                Err(e) => return Err(e),
            };
            match settled_request_status(&verified, &request_id)? {
                SettledStatus::Replied(reply) => {
                    return Ok(CallResult {
                        reply,
                        request_id,
                        certificate: verified,
                    })
                }
                SettledStatus::Rejected {
                    reject_code,
                    reject_message,
                    error_code,
                } => {
                    return Err(AgentError::CallRejected {
                        reject_code,
                        reject_message,
                        error_code,
                    })
                }
                SettledStatus::Done => {
                    return Err(AgentError::ProtocolViolation(
                        "the call settled but its reply has been pruned".to_string(),
                    ))
                }
                SettledStatus::Pending => {
                    debug!(self.log, "request still pending"; "request_id" => %request_id);
                }
            }
        }
    }

    async fn execute_query(
        &self,
        canister_id: &CanisterId,
        method_name: &str,
        arg: &[u8],
        verify_signatures: bool,
        options: &QueryOptions,
    ) -> Result<QueryResult, AgentError> {
        let token = options.cancellation_token.as_ref();
        let drift_ms = self.drift_estimate_ms();
        let (request_id, body) = {
            let identity = self.identity.read().await;
            let query_content = HttpUserQuery {
                canister_id: Blob(canister_id.as_slice().to_vec()),
                method_name: method_name.to_string(),
                arg: Blob(arg.to_vec()),
                sender: Blob(identity.sender().into_vec()),
                ingress_expiry: self.ingress_expiry_now(drift_ms),
                nonce: options.nonce.clone(),
            };
            let request_id = query_content.id();
            let auth = with_cancellation(token, identity.sign(&request_id)).await?;
            let body = cbor::encode_envelope(HttpQueryContent::Query { query: query_content }, auth)?;
            (request_id, body)
        };
        debug!(self.log, "submitting query"; "request_id" => %request_id, "method" => method_name);
        let response = with_cancellation(
            token,
            self.transport.post(
                &query_path(canister_id),
                body,
                Instant::now() + self.request_timeout,
            ),
        )
        .await?;
        if response.status != 200 {
            return Err(classify_http(response.status, response.body));
        }
        let parsed: QueryResponse = cbor::decode_body(&response.body)?;
        if verify_signatures {
            // Freshness first: a skewed clock fails before any key fetch.
            let corrected_now_ms = self.time_source.current_time().as_millis_since_unix_epoch()
                as i64
                + drift_ms;
            query::check_signature_freshness(
                &parsed,
                corrected_now_ms,
                self.permitted_drift.as_millis() as i64,
            )?;
            let topology = self.fetch_subnet_keys(canister_id).await?;
            query::verify_node_signatures(&parsed, &request_id, &topology.node_keys)?;
        }
        match parsed.status.as_str() {
            "replied" => {
                let reply = parsed.reply.ok_or_else(|| {
                    AgentError::ProtocolViolation(
                        "replied query response without a reply".to_string(),
                    )
                })?;
                Ok(QueryResult {
                    reply: reply.arg.into_vec(),
                    request_id,
                })
            }
            "rejected" => Err(AgentError::CallRejected {
                reject_code: parsed.reject_code.unwrap_or_default(),
                reject_message: parsed.reject_message.unwrap_or_default(),
                error_code: parsed.error_code,
            }),
            other => Err(AgentError::ProtocolViolation(format!(
                "unexpected query response status {other:?}"
            ))),
        }
    }

    async fn read_state_inner(
        &self,
        canister_id: &CanisterId,
        paths: Vec<Path>,
        disable_time_verification: bool,
        drift_ms: i64,
    ) -> Result<VerifiedCertificate, AgentError> {
        let body = self.signed_read_state_body(paths, drift_ms).await?;
        let response = self
            .transport
            .post(
                &read_state_path(canister_id),
                body,
                Instant::now() + self.request_timeout,
            )
            .await?;
        if response.status != 200 {
            return Err(classify_http(response.status, response.body));
        }
        let parsed: ReadStateResponse = cbor::decode_body(&response.body)?;
        self.verify_for_canister(
            parsed.certificate.as_slice(),
            canister_id,
            drift_ms,
            disable_time_verification,
        )
    }

    async fn read_subnet_state_inner(
        &self,
        subnet_id: &SubnetId,
        paths: Vec<Path>,
        disable_time_verification: bool,
        drift_ms: i64,
    ) -> Result<VerifiedCertificate, AgentError> {
        let body = self.signed_read_state_body(paths, drift_ms).await?;
        let response = self
            .transport
            .post(
                &subnet_read_state_path(subnet_id),
                body,
                Instant::now() + self.request_timeout,
            )
            .await?;
        if response.status != 200 {
            return Err(classify_http(response.status, response.body));
        }
        let parsed: ReadStateResponse = cbor::decode_body(&response.body)?;
        self.certificate_verifier(disable_time_verification)
            .verify(
                parsed.certificate.as_slice(),
                &CertificateScope::Subnet(subnet_id.clone()),
                drift_ms,
            )
            .map_err(AgentError::from)
    }

    async fn signed_read_state_body(
        &self,
        paths: Vec<Path>,
        drift_ms: i64,
    ) -> Result<Vec<u8>, AgentError> {
        let identity = self.identity.read().await;
        let read_state = HttpReadState {
            sender: Blob(identity.sender().into_vec()),
            paths,
            ingress_expiry: self.ingress_expiry_now(drift_ms),
            nonce: None,
        };
        let request_id = read_state.id();
        let auth: SignedRequestAuth = identity.sign(&request_id).await?;
        cbor::encode_envelope(HttpReadStateContent::ReadState { read_state }, auth)
    }

    fn verify_for_canister(
        &self,
        certificate_bytes: &[u8],
        canister_id: &CanisterId,
        drift_ms: i64,
        disable_time_verification: bool,
    ) -> Result<VerifiedCertificate, AgentError> {
        self.certificate_verifier(disable_time_verification)
            .verify(
                certificate_bytes,
                &CertificateScope::Canister(canister_id.clone()),
                drift_ms,
            )
            .map_err(AgentError::from)
    }
}

fn classify_http(status: u16, body: Vec<u8>) -> AgentError {
    let text = String::from_utf8_lossy(&body).into_owned();
    if status == 400 && text.contains("ingress_expiry") {
        AgentError::IngressExpiryRejected(text)
    } else {
        AgentError::Http { status, body: text }
    }
}

fn settled_request_status(
    verified: &VerifiedCertificate,
    request_id: &MessageId,
) -> Result<SettledStatus, AgentError> {
    let status_path = request_status_path(request_id, "status");
    let status = match verified.lookup(&status_path) {
        LookupStatus::Found(status) => status,
        LookupStatus::Absent | LookupStatus::Unknown => return Ok(SettledStatus::Pending),
        LookupStatus::Error(e) => {
            return Err(AgentError::ProtocolViolation(format!(
                "malformed request_status subtree: {e}"
            )))
        }
    };
    match status {
        s if s == b"replied" => {
            let reply = verified
                .lookup_value(&request_status_path(request_id, "reply"))
                .map_err(AgentError::from)?;
            Ok(SettledStatus::Replied(reply.to_vec()))
        }
        s if s == b"rejected" => {
            let mut code_bytes = verified
                .lookup_value(&request_status_path(request_id, "reject_code"))
                .map_err(AgentError::from)?;
            let reject_code = leb128::read::unsigned(&mut code_bytes).map_err(|e| {
                AgentError::ProtocolViolation(format!("unreadable reject_code: {e}"))
            })?;
            let reject_message = verified
                .lookup_value(&request_status_path(request_id, "reject_message"))
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .map_err(AgentError::from)?;
            let error_code = match verified.lookup(&request_status_path(request_id, "error_code")) {
                LookupStatus::Found(code) => Some(String::from_utf8_lossy(code).into_owned()),
                _ => None,
            };
            Ok(SettledStatus::Rejected {
                reject_code,
                reject_message,
                error_code,
            })
        }
        s if s == b"done" => Ok(SettledStatus::Done),
        s if s == b"processing" || s == b"received" || s == b"unknown" => {
            Ok(SettledStatus::Pending)
        }
        other => Err(AgentError::ProtocolViolation(format!(
            "unexpected request status {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn request_status_path(request_id: &MessageId, leaf: &str) -> Path {
    Path::new(vec![
        Label::from("request_status"),
        Label::from(request_id.as_bytes().as_slice()),
        Label::from(leaf),
    ])
}

async fn with_cancellation<T>(
    token: Option<&CancellationToken>,
    fut: impl Future<Output = Result<T, AgentError>>,
) -> Result<T, AgentError> {
    match token {
        None => fut.await,
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(AgentError::Cancelled),
            result = fut => result,
        },
    }
}

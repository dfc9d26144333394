//! The matchmaking orchestrator.
//!
//! [`MatchClient`] drives two workflows over one connection: the identity
//! fetch ([`MatchClient::get_identity_info`]) and the match cycle
//! ([`MatchClient::start_match`]). The match cycle resolves the pool's
//! routing once per pool, submits the request, keeps it alive with
//! heartbeats, waits for the outcome, and tells the server when the caller
//! gives up.
//!
//! Only one match cycle is in flight at a time. A new call cancels the
//! previous one, waits until it has finished (including its cancel
//! notification), then waits a short grace period before sending anything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use matchlink_net::messages::{CancelMatchReq, IdentityReq, InitRoutingReq, StartMatchReq};
use matchlink_net::{
    ConnectOptions, ConnectionManager, ConnectionState, MatchPoolDescriptor, Message,
    MessageManager, MsgType, RetryPolicy, RoutingConfig, Transport,
};
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;

use crate::correlation::{Correlator, ReplyKind};
use crate::error::{ClientError, ResultCode};
use crate::heartbeat::Heartbeat;
use crate::outcome::{IdentityInfo, MatchOutcome};

/// Tuning for the match workflow.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Tag substituted for an empty pool tag. Default: `"default"`.
    pub default_tag: String,
    /// Pause between a preempted call finishing and the next call sending.
    /// Default: 100 ms.
    pub preempt_grace: Duration,
    /// Consecutive unsent heartbeats treated as a lost connection.
    /// `0` disables the check. Default: 3.
    pub max_missed_heartbeats: u32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            default_tag: "default".to_string(),
            preempt_grace: Duration::from_millis(100),
            max_missed_heartbeats: 3,
        }
    }
}

/// The match call currently running.
struct InFlight {
    generation: u64,
    token: CancellationToken,
    /// Closed when the call has finished its cleanup.
    done: watch::Receiver<()>,
}

/// Client side of the matchmaking protocol.
///
/// Must be created inside a Tokio runtime.
pub struct MatchClient<T: Transport> {
    connection: ConnectionManager<T>,
    messages: Arc<MessageManager<T>>,
    correlator: Arc<Correlator>,
    routing_cache: DashMap<u64, Arc<OnceCell<RoutingConfig>>>,
    current_routing: Mutex<Option<RoutingConfig>>,
    identity: OnceCell<IdentityInfo>,
    in_flight: Mutex<Option<InFlight>>,
    generation: AtomicU64,
    leases: Mutex<usize>,
    config: MatchConfig,
    disposed: AtomicBool,
}

impl<T: Transport> MatchClient<T> {
    /// Build a client owning `transport` and every collaborator on top of it.
    pub fn new(
        transport: Arc<T>,
        options: ConnectOptions,
        retry: RetryPolicy,
        config: MatchConfig,
    ) -> Self {
        let connection = ConnectionManager::new(Arc::clone(&transport), options, retry);
        let messages = Arc::new(MessageManager::new(transport));
        let correlator = Correlator::new();
        messages.subscribe(correlator.clone());
        messages.start_receiving();

        Self {
            connection,
            messages,
            correlator,
            routing_cache: DashMap::new(),
            current_routing: Mutex::new(None),
            identity: OnceCell::new(),
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
            leases: Mutex::new(0),
            config,
            disposed: AtomicBool::new(false),
        }
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Fetch the caller's identity and room. The first successful fetch is
    /// cached for the lifetime of the client.
    pub async fn get_identity_info(
        &self,
        token: &CancellationToken,
    ) -> Result<IdentityInfo, ClientError> {
        if let Some(info) = self.identity.get() {
            return Ok(info.clone());
        }
        // A concurrent caller waits on the first caller's fetch, so it has to
        // watch its own token as well.
        let info = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ClientError::Canceled),
            info = self.identity.get_or_try_init(|| self.fetch_identity(token)) => info,
        }
        .inspect_err(|e| tracing::warn!("Identity fetch failed: {e}"))?;
        Ok(info.clone())
    }

    async fn fetch_identity(&self, token: &CancellationToken) -> Result<IdentityInfo, ClientError> {
        let _lease = self.connect(token).await?;
        let reply = self
            .round_trip(&Message::IdentityReq(IdentityReq {}), None, token)
            .await?;
        match reply {
            Some(Message::IdentityResp(resp)) => {
                if resp.status_code != 0 {
                    return Err(ClientError::status(resp.status_code, &resp.status_message));
                }
                tracing::info!("Identity resolved: {} in room {}", resp.open_id, resp.room_id);
                Ok(resp.into())
            }
            other => Err(unexpected(MsgType::IdentityResp, other.as_ref())),
        }
    }

    // -----------------------------------------------------------------------
    // Match workflow
    // -----------------------------------------------------------------------

    /// Run one match cycle for `pool`.
    ///
    /// Cancels and waits out any call still in flight. Never fails: every
    /// problem is reported through the returned [`MatchOutcome`].
    pub async fn start_match(
        &self,
        pool: MatchPoolDescriptor,
        params_json: &str,
        extra_info: &str,
        token: &CancellationToken,
    ) -> MatchOutcome {
        let call = self.begin_call(token).await;
        match self.run_match(&call.token, pool, params_json, extra_info).await {
            Ok(outcome) => outcome,
            Err(error) => {
                match error.code() {
                    ResultCode::UserCanceled => tracing::info!("Match request canceled"),
                    ResultCode::NetworkError => tracing::warn!("Match request failed: {error}"),
                    ResultCode::RequestDone | ResultCode::Undefined => {
                        tracing::error!("Match request failed unexpectedly: {error:?}")
                    }
                }
                MatchOutcome::from(error)
            }
        }
    }

    /// Cancel the match call in flight, if any.
    pub fn cancel_match(&self) {
        if let Some(in_flight) = self.lock_in_flight().as_ref() {
            in_flight.token.cancel();
        }
    }

    /// Routing of the match call in flight.
    pub fn current_routing(&self) -> Option<RoutingConfig> {
        *lock(&self.current_routing)
    }

    /// Cached routing for `pool`, if its handshake already completed.
    pub fn cached_routing(&self, pool: &MatchPoolDescriptor) -> Option<RoutingConfig> {
        let key = self.normalize(pool.clone()).cache_key();
        self.routing_cache
            .get(&key)
            .and_then(|cell| cell.get().copied())
    }

    /// Current transport state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Whether a connect or retry is in progress.
    pub fn is_connecting_or_retrying(&self) -> bool {
        self.connection.is_connecting_or_retrying()
    }

    /// Cancel in-flight work and shut the connection down. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_match();
        self.correlator.clear();
        self.connection.dispose();
        tracing::info!("Match client disposed");
    }

    /// Register this call as the one in flight, preempting its predecessor.
    async fn begin_call(&self, external: &CancellationToken) -> CallGuard<'_, T> {
        let token = external.child_token();
        let (done_tx, done_rx) = watch::channel(());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.lock_in_flight().replace(InFlight {
            generation,
            token: token.clone(),
            done: done_rx,
        });
        let call = CallGuard {
            client: self,
            generation,
            token,
            _done: done_tx,
        };

        if let Some(mut previous) = previous {
            tracing::info!("Preempting match request in flight");
            previous.token.cancel();
            // Resolves once the previous call drops its guard.
            let _ = previous.done.changed().await;
            tokio::time::sleep(self.config.preempt_grace).await;
        }
        call
    }

    async fn run_match(
        &self,
        token: &CancellationToken,
        pool: MatchPoolDescriptor,
        params_json: &str,
        extra_info: &str,
    ) -> Result<MatchOutcome, ClientError> {
        let _lease = self.connect(token).await?;
        let pool = self.normalize(pool);

        let routing = self
            .resolve_routing(&pool, token)
            .await
            .map_err(|e| match e {
                ClientError::Canceled => ClientError::RoutingCanceled,
                other => other,
            })?;
        *lock(&self.current_routing) = Some(routing);

        // Both slots exist before the request leaves, so neither reply can
        // arrive unclaimed.
        let id = self.messages.next_request_id();
        let ack = self.correlator.expect(id, ReplyKind::Ack);
        let outcome = self.correlator.expect(id, ReplyKind::Outcome);
        let request = Message::StartMatchReq(StartMatchReq {
            pool: pool.clone(),
            params_json: params_json.to_owned(),
            extra_info: extra_info.to_owned(),
            routing,
        });
        if !self.messages.send_with_id(id, &request, Some(routing)).is_sent() {
            return Err(ClientError::NotSent);
        }
        tracing::info!(
            "Match request {id} submitted to pool {}/{}",
            pool.pool_name,
            pool.tag
        );

        let reply = match ack.wait(token).await {
            Err(ClientError::Canceled) => {
                self.notify_cancel(&pool, routing);
                return Err(ClientError::Canceled);
            }
            other => other?,
        };
        let resp = match reply {
            Some(Message::StartMatchResp(resp)) => resp,
            other => return Err(unexpected(MsgType::StartMatchResp, other.as_ref())),
        };
        if resp.status_code != 0 {
            return Err(ClientError::status(resp.status_code, &resp.status_message));
        }

        let heartbeat = (resp.heartbeat_interval_secs > 0).then(|| {
            Heartbeat::start(
                Arc::clone(&self.messages),
                routing,
                Duration::from_secs(resp.heartbeat_interval_secs.unsigned_abs().into()),
                self.config.max_missed_heartbeats,
            )
        });
        tracing::debug!("Match request {id} acknowledged, awaiting outcome");

        let notification = tokio::select! {
            biased;
            reply = outcome.wait(token) => reply,
            _ = heartbeat_lost(heartbeat.as_ref()) => Err(ClientError::ConnectionLost),
        };
        let notification = match notification {
            Err(ClientError::Canceled) => {
                self.notify_cancel(&pool, routing);
                return Err(ClientError::Canceled);
            }
            other => other?,
        };

        match notification {
            Some(Message::MatchSucceededNotify(result)) => {
                tracing::info!(
                    "Match {} formed with {} players",
                    result.match_id,
                    result.players.len()
                );
                Ok(MatchOutcome::Matched(result))
            }
            Some(Message::MatchFailedNotify(failure)) => {
                tracing::info!(
                    "Matching gave up ({}): {}",
                    failure.status_code,
                    failure.message
                );
                Ok(MatchOutcome::Rejected(failure))
            }
            other => Err(unexpected(MsgType::MatchSucceededNotify, other.as_ref())),
        }
    }

    /// Routing for `pool`, performing the handshake at most once per pool.
    /// A failed or canceled handshake leaves the entry empty.
    async fn resolve_routing(
        &self,
        pool: &MatchPoolDescriptor,
        token: &CancellationToken,
    ) -> Result<RoutingConfig, ClientError> {
        let cell = Arc::clone(self.routing_cache.entry(pool.cache_key()).or_default().value());
        let routing = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ClientError::Canceled),
            routing = cell.get_or_try_init(|| self.routing_handshake(pool, token)) => routing,
        }?;
        Ok(*routing)
    }

    async fn routing_handshake(
        &self,
        pool: &MatchPoolDescriptor,
        token: &CancellationToken,
    ) -> Result<RoutingConfig, ClientError> {
        tracing::debug!("Resolving routing for pool {}/{}", pool.pool_name, pool.tag);
        let request = Message::InitRoutingReq(InitRoutingReq { pool: pool.clone() });
        match self.round_trip(&request, None, token).await? {
            Some(Message::InitRoutingResp(resp)) => {
                if resp.status_code != 0 {
                    return Err(ClientError::status(resp.status_code, &resp.status_message));
                }
                let routing = RoutingConfig {
                    module_type: resp.module_type,
                    instance_id: resp.instance_id,
                };
                tracing::info!(
                    "Pool {}/{} routed to module {} instance {}",
                    pool.pool_name,
                    pool.tag,
                    routing.module_type,
                    routing.instance_id
                );
                Ok(routing)
            }
            other => Err(unexpected(MsgType::InitRoutingResp, other.as_ref())),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Require the connection and wait for the connect loop to settle.
    async fn connect(&self, token: &CancellationToken) -> Result<ConnectionLease<'_, T>, ClientError> {
        let lease = ConnectionLease::acquire(self);
        if !self.connection.wait_until_settled(token).await {
            return Err(ClientError::Canceled);
        }
        if self.connection.state() != ConnectionState::Running {
            return Err(ClientError::NotConnected);
        }
        Ok(lease)
    }

    /// Send `request` and wait for its acknowledgement.
    async fn round_trip(
        &self,
        request: &Message,
        routing: Option<RoutingConfig>,
        token: &CancellationToken,
    ) -> Result<Option<Message>, ClientError> {
        let id = self.messages.next_request_id();
        let reply = self.correlator.expect(id, ReplyKind::Ack);
        if !self.messages.send_with_id(id, request, routing).is_sent() {
            return Err(ClientError::NotSent);
        }
        reply.wait(token).await
    }

    /// Tell the server to drop the pending request. Fire-and-forget.
    fn notify_cancel(&self, pool: &MatchPoolDescriptor, routing: RoutingConfig) {
        let request = Message::CancelMatchReq(CancelMatchReq {
            pool: pool.clone(),
            routing,
        });
        let id = self.messages.send(&request, Some(routing));
        if id.is_sent() {
            tracing::info!("Cancel notification {id} sent");
        } else {
            tracing::warn!("Cancel notification could not be sent");
        }
    }

    fn normalize(&self, mut pool: MatchPoolDescriptor) -> MatchPoolDescriptor {
        if pool.tag.is_empty() {
            pool.tag.clone_from(&self.config.default_tag);
        }
        pool
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        lock(&self.in_flight)
    }
}

impl<T: Transport> Drop for MatchClient<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unexpected(expected: MsgType, got: Option<&Message>) -> ClientError {
    ClientError::UnexpectedReply {
        expected,
        got: got.map(Message::msg_type),
    }
}

async fn heartbeat_lost(heartbeat: Option<&Heartbeat>) {
    match heartbeat {
        Some(heartbeat) => heartbeat.lost().await,
        None => std::future::pending().await,
    }
}

/// Keeps the connection required while alive.
struct ConnectionLease<'a, T: Transport> {
    client: &'a MatchClient<T>,
}

impl<'a, T: Transport> ConnectionLease<'a, T> {
    fn acquire(client: &'a MatchClient<T>) -> Self {
        let mut leases = lock(&client.leases);
        *leases += 1;
        client.connection.ensure_connection(true);
        Self { client }
    }
}

impl<T: Transport> Drop for ConnectionLease<'_, T> {
    fn drop(&mut self) {
        let mut leases = lock(&self.client.leases);
        *leases = leases.saturating_sub(1);
        if *leases == 0 {
            self.client.connection.ensure_connection(false);
        }
    }
}

/// Cleanup for one match call. Dropping it clears the call's routing,
/// unregisters it, and releases a preempting successor.
struct CallGuard<'a, T: Transport> {
    client: &'a MatchClient<T>,
    generation: u64,
    token: CancellationToken,
    _done: watch::Sender<()>,
}

impl<T: Transport> Drop for CallGuard<'_, T> {
    fn drop(&mut self) {
        // A successor only sets its routing after this guard is gone.
        *lock(&self.client.current_routing) = None;
        let mut in_flight = self.client.lock_in_flight();
        if in_flight
            .as_ref()
            .is_some_and(|current| current.generation == self.generation)
        {
            *in_flight = None;
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

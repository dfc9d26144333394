//! Connection lifecycle on top of a [`Transport`]: connect on demand, bounded
//! retry at a fixed interval, and no retry after an intentional close.
//!
//! [`ConnectionManager::ensure_connection`] records whether the owner needs
//! the connection and starts a connect loop when the transport is stopped.
//! [`RetryState`] hands out the delays for that loop. Failures never surface
//! as errors: callers observe [`ConnectionManager::is_connecting_or_retrying`]
//! and the transport state instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::transport::{ConnectOptions, ConnectionState, Transport, TransportEvent};

/// Retry policy for connect failures and involuntary closes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. Default: 3.
    pub max_retries: u32,
    /// Wait before each retry. Default: 3 s.
    pub retry_interval: Duration,
    /// Jitter factor (0.0–1.0) applied as ±jitter to the interval. Default: 0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(3),
            jitter: 0.0,
        }
    }
}

/// Counts retries and computes the wait before the next one.
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    /// Create a fresh state from the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Advance the retry counter and return the wait before that retry.
    /// Returns `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_retries {
            return None;
        }
        self.attempts += 1;

        let base = self.policy.retry_interval;
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
            Some(base.mul_f64(factor))
        } else {
            Some(base)
        }
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Retries made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

struct Shared<T> {
    transport: Arc<T>,
    options: ConnectOptions,
    policy: RetryPolicy,
    /// The owner needs the connection.
    required: AtomicBool,
    disposed: AtomicBool,
    /// True while a connect loop runs.
    connecting: watch::Sender<bool>,
    attempts: AtomicU32,
    shutdown: CancellationToken,
}

impl<T: Transport> Shared<T> {
    /// Atomically claim the connect loop. Returns `false` if one already runs.
    fn try_claim(&self) -> bool {
        self.connecting.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        })
    }

    fn should_stop(&self) -> bool {
        self.shutdown.is_cancelled() || !self.required.load(Ordering::SeqCst)
    }
}

/// Owns the connect/retry policy for one transport.
///
/// Must be created inside a Tokio runtime: it spawns a task that watches the
/// transport for involuntary closes.
pub struct ConnectionManager<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager for `transport`. Nothing connects until
    /// [`ensure_connection`](Self::ensure_connection) is called.
    pub fn new(transport: Arc<T>, options: ConnectOptions, policy: RetryPolicy) -> Self {
        let (connecting, _) = watch::channel(false);
        let events = transport.subscribe();
        let shared = Arc::new(Shared {
            transport,
            options,
            policy,
            required: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            connecting,
            attempts: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(watch_closes(Arc::clone(&shared), events));
        Self { shared }
    }

    /// Declare whether the connection is needed.
    ///
    /// With `required == true` and a stopped transport, starts a connect loop
    /// unless one already runs. With `false`, only clears the intent; an open
    /// connection stays open.
    pub fn ensure_connection(&self, required: bool) {
        let shared = &self.shared;
        if shared.disposed.load(Ordering::SeqCst) {
            return;
        }
        shared.required.store(required, Ordering::SeqCst);
        if !required || shared.transport.state() != ConnectionState::Stopped {
            return;
        }
        if shared.try_claim() {
            tokio::spawn(connect_loop(Arc::clone(shared), false));
        }
    }

    /// True from the start of a connect attempt until it succeeds or the
    /// retry budget is exhausted.
    pub fn is_connecting_or_retrying(&self) -> bool {
        *self.shared.connecting.borrow()
    }

    /// Wait until no connect loop runs. Returns `false` if `token` fired first.
    pub async fn wait_until_settled(&self, token: &CancellationToken) -> bool {
        let mut rx = self.shared.connecting.subscribe();
        let settled = async move { rx.wait_for(|busy| !*busy).await.is_ok() };
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            settled = settled => settled,
        }
    }

    /// Whether the owner currently needs the connection.
    pub fn is_required(&self) -> bool {
        self.shared.required.load(Ordering::SeqCst)
    }

    /// Current transport state.
    pub fn state(&self) -> ConnectionState {
        self.shared.transport.state()
    }

    /// Retries made by the current or last connect loop.
    pub fn retry_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// The managed transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    /// Clear the intent, stop any retry loop, and close the transport.
    /// Idempotent.
    pub fn dispose(&self) {
        let shared = &self.shared;
        if shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.required.store(false, Ordering::SeqCst);
        shared.shutdown.cancel();
        shared.transport.close();
        shared.connecting.send_replace(false);
        tracing::debug!("Connection manager disposed");
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Restart the connect loop when the transport drops without being asked to.
async fn watch_closes<T: Transport>(
    shared: Arc<Shared<T>>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Closed { intentional: false }) => {
                if shared.should_stop() {
                    tracing::info!("Connection dropped while not required, not reconnecting");
                    continue;
                }
                tracing::warn!("Connection dropped, scheduling reconnect");
                if shared.try_claim() {
                    tokio::spawn(connect_loop(Arc::clone(&shared), true));
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Close watcher skipped {skipped} transport events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Connect, retrying at the policy interval until success or exhaustion.
///
/// After an involuntary drop the first attempt is itself a retry and waits
/// one interval. Releases the `connecting` flag on exit.
async fn connect_loop<T: Transport>(shared: Arc<Shared<T>>, after_drop: bool) {
    let mut retry = RetryState::new(shared.policy.clone());
    let mut delay = if after_drop {
        retry.next_delay()
    } else {
        Some(Duration::ZERO)
    };

    loop {
        let Some(wait) = delay else {
            tracing::error!(
                "Giving up on {} after {} retries",
                shared.options.address,
                retry.attempts()
            );
            break;
        };
        shared.attempts.store(retry.attempts(), Ordering::SeqCst);

        if !wait.is_zero() {
            tracing::info!("Reconnection attempt {} in {:?}", retry.attempts(), wait);
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        if shared.should_stop() {
            tracing::debug!("Connection no longer required, stopping connect loop");
            break;
        }

        match shared.transport.connect(&shared.options).await {
            Ok(()) => {
                if shared.disposed.load(Ordering::SeqCst) {
                    shared.transport.close();
                } else if retry.attempts() > 0 {
                    tracing::info!("Reconnected after {} retries", retry.attempts());
                }
                retry.reset();
                shared.attempts.store(0, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                tracing::warn!(
                    "Connect to {} failed (retry {}): {}",
                    shared.options.address,
                    retry.attempts(),
                    e
                );
                delay = retry.next_delay();
            }
        }
    }

    shared.connecting.send_replace(false);
}

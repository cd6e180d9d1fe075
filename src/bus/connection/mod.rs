//! Shared broker connection with automatic recovery.
//!
//! One `ConnectionManager` owns at most one live connection and one channel.
//! Callers borrow the channel per operation through
//! [`ConnectionManager::acquire_channel`]; they never keep it, because it goes
//! stale on reconnect.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> ... -> Connected
//!                                                  \-> Failed (budget spent)
//! any state -> Closed (shutdown)
//! ```
//!
//! Reconnection uses a fixed delay rather than exponential backoff. The retry
//! budget is reset on every successful connect. Once it is spent the manager
//! stays `Failed` until the process is restarted.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBackoff, ConstantBuilder};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::{Broker, BrokerChannel, BrokerConnection, BusError, Result};

/// Delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Reconnection attempts before the manager gives up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Lifecycle state of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnection budget exhausted. Terminal.
    Failed,
    /// Shut down. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Fixed-delay reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait before every reconnection attempt.
    pub delay: Duration,
    /// Attempts allowed after a failure before entering `Failed`.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    /// Fresh budget: yields `delay` exactly `max_attempts` times.
    fn budget(&self) -> ConstantBackoff {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.max_attempts as usize)
            .build()
    }
}

/// The connection and the channel opened on it.
struct Session {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// The single in-flight connection attempt, awaited by every caller.
type Attempt = Shared<BoxFuture<'static, Result<Arc<dyn BrokerChannel>>>>;

enum Completion {
    Ready(Arc<dyn BrokerChannel>),
    Failed(BusError),
    /// Connected after shutdown began; the session must be closed again.
    Discard(Session),
}

struct Inner {
    state: ConnectionState,
    retry_count: u32,
    budget: ConstantBackoff,
    last_error: Option<String>,
    /// Bumped on every successful connect so late close signals from an
    /// older connection are ignored.
    generation: u64,
    session: Option<Session>,
    attempt: Option<Attempt>,
    /// Task behind `attempt`, including its reconnect delay.
    attempt_task: Option<AbortHandle>,
    watcher: Option<AbortHandle>,
}

/// Owner of the process-wide broker connection and channel.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    policy: ReconnectPolicy,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Create a manager. Nothing connects until the first `acquire_channel`.
    pub fn new(broker: Arc<dyn Broker>, policy: ReconnectPolicy) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            broker,
            policy,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                retry_count: 0,
                budget: policy.budget(),
                last_error: None,
                generation: 0,
                session: None,
                attempt: None,
                attempt_task: None,
                watcher: None,
            }),
            state_tx,
        })
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Reconnection attempts made since the last successful connect.
    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Get the shared channel, connecting first if needed.
    ///
    /// While a connection attempt is in flight every caller awaits that same
    /// attempt and receives the same outcome. `Failed` and `Closed` return
    /// immediately.
    pub async fn acquire_channel(self: &Arc<Self>) -> Result<Arc<dyn BrokerChannel>> {
        let attempt = {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Connected => {
                    if let Some(session) = &inner.session {
                        return Ok(Arc::clone(&session.channel));
                    }
                }
                ConnectionState::Failed => return Err(fatal_error(&inner)),
                ConnectionState::Closed => return Err(BusError::ShutDown),
                ConnectionState::Disconnected
                | ConnectionState::Connecting
                | ConnectionState::Reconnecting => {}
            }

            match inner.attempt.clone() {
                Some(attempt) => attempt,
                None => self.begin_connect(&mut inner),
            }
        };

        attempt.await
    }

    /// Report that `channel` failed at the protocol level.
    ///
    /// Starts reconnection if `channel` is still the current one; reports
    /// about an already replaced channel are ignored.
    pub fn report_fault(self: &Arc<Self>, channel: &Arc<dyn BrokerChannel>, reason: &str) {
        let generation = {
            let inner = self.lock();
            match &inner.session {
                Some(session) if same_channel(&session.channel, channel) => inner.generation,
                _ => {
                    debug!(reason = %reason, "Ignoring fault reported for a stale channel");
                    return;
                }
            }
        };

        self.handle_disconnect(generation, reason);
    }

    /// Stop accepting connection attempts, then close the channel and the
    /// connection, in that order.
    ///
    /// Close failures are logged and otherwise ignored: the broker reclaims
    /// unacknowledged deliveries from a dropped connection on its own.
    pub async fn shutdown(&self) {
        let session = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            self.set_state(&mut inner, ConnectionState::Closed);

            if let Some(task) = inner.attempt_task.take() {
                task.abort();
            }
            if let Some(watcher) = inner.watcher.take() {
                watcher.abort();
            }
            inner.attempt = None;
            inner.session.take()
        };

        if let Some(session) = session {
            close_session(session).await;
        }
        info!("Broker connection shut down");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn begin_connect(self: &Arc<Self>, inner: &mut Inner) -> Attempt {
        info!("Connecting to broker...");
        self.set_state(inner, ConnectionState::Connecting);
        self.spawn_attempt(inner, None, Duration::ZERO)
    }

    /// Spawn the next attempt: close `stale`, wait `delay`, connect.
    fn spawn_attempt(
        self: &Arc<Self>,
        inner: &mut Inner,
        stale: Option<Session>,
        delay: Duration,
    ) -> Attempt {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Some(stale) = stale {
                close_session(stale).await;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            manager.run_attempt().await
        });

        inner.attempt_task = Some(task.abort_handle());

        let attempt = async move {
            match task.await {
                Ok(result) => result,
                // Aborted by shutdown.
                Err(_) => Err(BusError::ShutDown),
            }
        }
        .boxed()
        .shared();

        inner.attempt = Some(attempt.clone());
        attempt
    }

    async fn run_attempt(self: &Arc<Self>) -> Result<Arc<dyn BrokerChannel>> {
        let outcome = self.open_session().await;

        match self.complete_attempt(outcome) {
            Completion::Ready(channel) => Ok(channel),
            Completion::Failed(e) => Err(e),
            Completion::Discard(session) => {
                // Detached: shutdown may abort this task at any await.
                tokio::spawn(close_session(session));
                Err(BusError::ShutDown)
            }
        }
    }

    async fn open_session(&self) -> Result<Session> {
        let connection = self.broker.connect().await?;

        match connection.create_channel().await {
            Ok(channel) => Ok(Session {
                connection,
                channel,
            }),
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Failed to close connection after channel error");
                }
                Err(e)
            }
        }
    }

    fn complete_attempt(self: &Arc<Self>, outcome: Result<Session>) -> Completion {
        let mut inner = self.lock();
        inner.attempt = None;
        inner.attempt_task = None;

        if inner.state == ConnectionState::Closed {
            return match outcome {
                Ok(session) => Completion::Discard(session),
                Err(_) => Completion::Failed(BusError::ShutDown),
            };
        }

        match outcome {
            Ok(session) => {
                let channel = Arc::clone(&session.channel);

                inner.retry_count = 0;
                inner.budget = self.policy.budget();
                inner.last_error = None;
                inner.generation += 1;
                inner.watcher = Some(self.watch_connection(&session, inner.generation));
                inner.session = Some(session);
                self.set_state(&mut inner, ConnectionState::Connected);

                info!(generation = inner.generation, "Successfully connected to broker");
                Completion::Ready(channel)
            }
            Err(e) => {
                error!(
                    error = %e,
                    attempt = inner.retry_count,
                    max_attempts = self.policy.max_attempts,
                    "Failed to connect to broker"
                );
                inner.last_error = Some(e.to_string());
                self.schedule_reconnect(&mut inner, None);

                if inner.state == ConnectionState::Failed {
                    Completion::Failed(fatal_error(&inner))
                } else {
                    Completion::Failed(e)
                }
            }
        }
    }

    /// Enter `Reconnecting` with one pending attempt, or `Failed` when the
    /// budget is spent.
    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner, stale: Option<Session>) {
        match inner.budget.next() {
            Some(delay) => {
                inner.retry_count += 1;
                self.set_state(inner, ConnectionState::Reconnecting);
                info!(
                    attempt = inner.retry_count,
                    max_attempts = self.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling broker reconnection"
                );
                let _pending = self.spawn_attempt(inner, stale, delay);
            }
            None => {
                self.set_state(inner, ConnectionState::Failed);
                error!(
                    attempts = inner.retry_count,
                    last_error = inner.last_error.as_deref().unwrap_or("unknown"),
                    "Max reconnection attempts reached, giving up"
                );
                if let Some(stale) = stale {
                    tokio::spawn(close_session(stale));
                }
            }
        }
    }

    fn watch_connection(self: &Arc<Self>, session: &Session, generation: u64) -> AbortHandle {
        let closed = session.connection.closed();
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            let reason = closed.await;
            if let Some(manager) = manager.upgrade() {
                manager.handle_disconnect(generation, &reason);
            }
        })
        .abort_handle()
    }

    fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != ConnectionState::Connected {
            debug!(reason = %reason, "Ignoring close signal from a replaced connection");
            return;
        }

        warn!(reason = %reason, "Broker connection lost, attempting to reconnect...");

        if let Some(watcher) = inner.watcher.take() {
            watcher.abort();
        }
        inner.last_error = Some(reason.to_string());
        let stale = inner.session.take();
        self.schedule_reconnect(&mut inner, stale);
    }
}

fn fatal_error(inner: &Inner) -> BusError {
    BusError::Fatal {
        attempts: inner.retry_count,
        last_error: inner
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

fn same_channel(a: &Arc<dyn BrokerChannel>, b: &Arc<dyn BrokerChannel>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

async fn close_session(session: Session) {
    if let Err(e) = session.channel.close().await {
        warn!(error = %e, "Error closing broker channel");
    }
    if let Err(e) = session.connection.close().await {
        warn!(error = %e, "Error closing broker connection");
    }
}

#[cfg(test)]
mod tests;

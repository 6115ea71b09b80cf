//! Cancellable, time-bounded polling of the gateway status endpoint.
//!
//! One poller runs per order as its own tokio task. The loop sleeps through
//! the injected [`Clock`], so a ten-minute window runs instantly under a
//! `ManualClock`. The outcome callback fires at most once and never after
//! [`PollerHandle::stop`] has returned.

use crate::config::PollerConfig;
use crate::payments::{GatewayError, GatewayStatus, PaymentGateway, StatusCheck, StatusReport};
use crate::services::clock::Clock;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Outcomes and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PollOutcome {
    Completed { report: StatusReport },
    Failed { report: StatusReport },
    /// The gateway refused the status query itself (bad date, bad key).
    Rejected { error: GatewayError },
    /// No terminal status within the budget. The payment may still clear.
    TimedOut { elapsed: Duration, ticks: u32 },
}

impl PollOutcome {
    pub fn provider_txn_id(&self) -> Option<&str> {
        match self {
            PollOutcome::Completed { report } | PollOutcome::Failed { report } => {
                report.provider_txn_id.as_deref()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
    Completed,
    Failed,
    TimedOut,
    Stopped,
}

impl PollerState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, PollerState::Idle | PollerState::Polling)
    }

    fn after(outcome: &PollOutcome) -> Self {
        match outcome {
            PollOutcome::Completed { .. } => PollerState::Completed,
            PollOutcome::Failed { .. } | PollOutcome::Rejected { .. } => PollerState::Failed,
            PollOutcome::TimedOut { .. } => PollerState::TimedOut,
        }
    }
}

/// A non-terminal status observation.
#[derive(Debug, Clone)]
pub struct PollTick {
    pub client_txn_id: String,
    pub tick: u32,
    pub report: StatusReport,
    pub at: DateTime<Utc>,
}

type TickFn = Box<dyn Fn(PollTick) + Send + Sync>;
type OutcomeFn = Box<dyn FnOnce(PollOutcome) + Send>;

struct Inner {
    state: PollerState,
    on_tick: Option<TickFn>,
    on_outcome: Option<OutcomeFn>,
}

struct Shared {
    client_txn_id: String,
    inner: Mutex<Inner>,
    ticks: AtomicU32,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self) -> bool {
        let mut inner = self.inner();
        if inner.state != PollerState::Idle {
            return false;
        }
        inner.state = PollerState::Polling;
        true
    }

    fn emit_tick(&self, tick: PollTick) {
        let inner = self.inner();
        if inner.state != PollerState::Polling {
            return;
        }
        if let Some(on_tick) = &inner.on_tick {
            on_tick(tick);
        }
    }

    /// Callbacks run under the lock so `stop` cannot slip in between the
    /// state check and the call.
    fn finish(&self, outcome: PollOutcome) {
        let mut inner = self.inner();
        if inner.state != PollerState::Polling {
            return;
        }
        inner.state = PollerState::after(&outcome);
        inner.on_tick = None;
        if let Some(on_outcome) = inner.on_outcome.take() {
            on_outcome(outcome);
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Control handle for one running poller. Cloning shares the same poller.
#[derive(Clone)]
pub struct PollerHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PollerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerHandle")
            .field("client_txn_id", &self.shared.client_txn_id)
            .field("state", &self.state())
            .field("ticks", &self.ticks())
            .finish()
    }
}

impl PollerHandle {
    pub fn client_txn_id(&self) -> &str {
        &self.shared.client_txn_id
    }

    pub fn state(&self) -> PollerState {
        self.shared.inner().state
    }

    /// Status checks issued so far.
    pub fn ticks(&self) -> u32 {
        self.shared.ticks.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Stops the loop and drops both callbacks. Idempotent; a no-op once the
    /// poller has finished. Must not be called from inside a callback.
    pub fn stop(&self) {
        {
            let mut inner = self.shared.inner();
            if inner.state.is_finished() {
                return;
            }
            inner.state = PollerState::Stopped;
            inner.on_tick = None;
            inner.on_outcome = None;
        }

        let _ = self.shared.stop_tx.send(true);
        if let Some(task) = self
            .shared
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        info!(client_txn_id = %self.shared.client_txn_id, "status poller stopped");
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StatusPoller {
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    config: PollerConfig,
}

impl StatusPoller {
    pub fn new(gateway: Arc<dyn PaymentGateway>, clock: Arc<dyn Clock>, config: PollerConfig) -> Self {
        Self {
            gateway,
            clock,
            config,
        }
    }

    pub fn config(&self) -> PollerConfig {
        self.config
    }

    pub fn start<T, F>(&self, check: StatusCheck, on_tick: T, on_outcome: F) -> PollerHandle
    where
        T: Fn(PollTick) + Send + Sync + 'static,
        F: FnOnce(PollOutcome) + Send + 'static,
    {
        self.start_with_budget(check, self.config.max_duration, on_tick, on_outcome)
    }

    /// Like [`start`](Self::start) with a custom overall deadline, used when
    /// resuming an order that has already spent part of its window.
    pub fn start_with_budget<T, F>(
        &self,
        check: StatusCheck,
        budget: Duration,
        on_tick: T,
        on_outcome: F,
    ) -> PollerHandle
    where
        T: Fn(PollTick) + Send + Sync + 'static,
        F: FnOnce(PollOutcome) + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            client_txn_id: check.client_txn_id().to_string(),
            inner: Mutex::new(Inner {
                state: PollerState::Idle,
                on_tick: Some(Box::new(on_tick)),
                on_outcome: Some(Box::new(on_outcome)),
            }),
            ticks: AtomicU32::new(0),
            stop_tx,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(poll_loop(
            self.gateway.clone(),
            self.clock.clone(),
            check,
            self.config.interval,
            budget,
            shared.clone(),
            stop_rx,
        ));
        *shared.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        PollerHandle { shared }
    }
}

async fn poll_loop(
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    check: StatusCheck,
    interval: Duration,
    budget: Duration,
    shared: Arc<Shared>,
    mut stop_rx: watch::Receiver<bool>,
) {
    if !shared.begin() {
        return;
    }

    let client_txn_id = check.client_txn_id().to_string();
    let started = clock.now();
    info!(
        client_txn_id = %client_txn_id,
        interval_secs = interval.as_secs(),
        budget_secs = budget.as_secs(),
        "status poller started"
    );

    let outcome = loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            _ = clock.sleep(interval) => {}
        }

        let elapsed = (clock.now() - started).to_std().unwrap_or_default();
        if elapsed >= budget {
            break PollOutcome::TimedOut {
                elapsed,
                ticks: shared.ticks.load(Ordering::SeqCst),
            };
        }

        let tick = shared.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let result = tokio::select! {
            biased;
            _ = stop_rx.changed() => return,
            result = gateway.check_status(check.clone()) => result,
        };

        match result {
            Ok(report) => match report.status {
                GatewayStatus::Completed => break PollOutcome::Completed { report },
                GatewayStatus::Failed => break PollOutcome::Failed { report },
                GatewayStatus::Pending => {
                    debug!(
                        client_txn_id = %client_txn_id,
                        tick,
                        provider_status = %report.provider_status,
                        "payment still pending"
                    );
                    shared.emit_tick(PollTick {
                        client_txn_id: client_txn_id.clone(),
                        tick,
                        report,
                        at: clock.now(),
                    });
                }
            },
            Err(error) if error.is_retryable() => {
                warn!(
                    client_txn_id = %client_txn_id,
                    tick,
                    error = %error,
                    "status check failed, retrying on next tick"
                );
            }
            Err(error) => break PollOutcome::Rejected { error },
        }
    };

    info!(
        client_txn_id = %client_txn_id,
        ticks = shared.ticks.load(Ordering::SeqCst),
        outcome = ?PollerState::after(&outcome),
        "status poller finished"
    );
    shared.finish(outcome);
}

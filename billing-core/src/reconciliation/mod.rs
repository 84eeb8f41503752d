//! Periodically reconciles this process's local view of a tenant's spend
//! against the external billing authority's view, with an explicit
//! fail-open/fail-closed state machine so a transient outage degrades to a
//! bounded, non-refilling spend allowance rather than an outright stop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use common::shutdown::ShutdownChannel;
use common::task::LxTask;

use crate::amount::MicroDollars;
use crate::ids::TenantId;

/// The three states a reconciliation client can be in. See the module docs
/// for the transition rules.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReconciliationStatus {
    Synced,
    FailOpen,
    FailClosed,
}

/// Fixed, human-readable reasons passed to the state-change observer.
pub mod reason {
    pub const AUTHORITY_UNREACHABLE: &str = "arrakis unreachable";
    pub const DRIFT_EXCEEDED: &str = "drift exceeded";
    pub const HEADROOM_EXHAUSTED: &str = "headroom exhausted";
    pub const FAIL_OPEN_DURATION_EXCEEDED: &str = "fail-open duration exceeded";
    pub const RECONCILIATION_SUCCESSFUL: &str = "reconciliation successful";
}

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("reconciliation authority unreachable: {0}")]
    Unreachable(String),
}

/// The external billing authority's reconciliation endpoint, abstracted
/// behind a trait the same way the chain RPC pool and finalize transport
/// are: this crate polls it, but does not implement its wire format.
#[async_trait]
pub trait AuthorityClient: Send + Sync {
    /// Returns the authority's committed spend for `tenant` and the spend
    /// limit used to compute fail-open headroom.
    async fn fetch_committed_spend(
        &self,
        tenant: &TenantId,
    ) -> Result<(MicroDollars, MicroDollars), AuthorityError>;
}

/// Invoked once, synchronously, for every state transition, in the order the
/// transitions occur.
pub type StateChangeCallback =
    Arc<dyn Fn(ReconciliationStatus, ReconciliationStatus, &'static str) + Send + Sync>;

struct State {
    status: ReconciliationStatus,
    local_spend: MicroDollars,
    authority_spend: MicroDollars,
    fail_open_headroom: MicroDollars,
    fail_open_started_at: Option<common::time::TimestampMillis>,
    consecutive_failures: u32,
    last_poll_at: Option<common::time::TimestampMillis>,
}

/// Tracks exactly one tenant's reconciliation state. A deployment running
/// many tenants holds one instance per tenant.
pub struct ReconciliationClient {
    tenant: TenantId,
    authority: Arc<dyn AuthorityClient>,
    state: Mutex<State>,
    on_state_change: Option<StateChangeCallback>,
    drift_threshold: MicroDollars,
    fail_open_headroom_percent: u8,
    fail_open_absolute_cap: MicroDollars,
    fail_open_max_duration: Duration,
    poll_interval: Duration,
    shutdown: ShutdownChannel,
}

impl ReconciliationClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant: TenantId,
        authority: Arc<dyn AuthorityClient>,
        on_state_change: Option<StateChangeCallback>,
        drift_threshold: MicroDollars,
        fail_open_headroom_percent: u8,
        fail_open_absolute_cap: MicroDollars,
        fail_open_max_duration: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tenant,
            authority,
            state: Mutex::new(State {
                status: ReconciliationStatus::Synced,
                local_spend: MicroDollars::ZERO,
                authority_spend: MicroDollars::ZERO,
                fail_open_headroom: MicroDollars::ZERO,
                fail_open_started_at: None,
                consecutive_failures: 0,
                last_poll_at: None,
            }),
            on_state_change,
            drift_threshold,
            fail_open_headroom_percent,
            fail_open_absolute_cap,
            fail_open_max_duration,
            poll_interval,
            shutdown: ShutdownChannel::new(),
        }
    }

    fn notify(&self, from: ReconciliationStatus, to: ReconciliationStatus, why: &'static str) {
        if from == to {
            return;
        }
        if let Some(cb) = &self.on_state_change {
            cb(from, to, why);
        }
    }

    /// Record locally observed spend. During FAIL_OPEN this monotonically
    /// consumes the headroom established at entry; it never refills.
    pub async fn record_local_spend(&self, delta: MicroDollars) {
        let mut state = self.state.lock().await;
        state.local_spend = state.local_spend.checked_add(delta).unwrap_or(state.local_spend);
        if state.status == ReconciliationStatus::FailOpen {
            state.fail_open_headroom = state.fail_open_headroom.saturating_sub(delta);
            if state.fail_open_headroom == MicroDollars::ZERO {
                let from = state.status;
                state.status = ReconciliationStatus::FailClosed;
                drop(state);
                self.notify(from, ReconciliationStatus::FailClosed, reason::HEADROOM_EXHAUSTED);
                return;
            }
        }
    }

    /// Whether a new request should be admitted under the current
    /// reconciliation state.
    pub async fn should_allow_request(&self) -> bool {
        self.state.lock().await.status != ReconciliationStatus::FailClosed
    }

    pub async fn status(&self) -> ReconciliationStatus {
        self.state.lock().await.status
    }

    fn enter_fail_open(&self, state: &mut State, authority_limit: MicroDollars, now: common::time::TimestampMillis) {
        let percent_headroom = authority_limit
            .as_micros()
            .saturating_mul(self.fail_open_headroom_percent as u128)
            / 100;
        let headroom = percent_headroom.min(self.fail_open_absolute_cap.as_micros());
        state.fail_open_headroom = MicroDollars::from_micros(headroom);
        state.fail_open_started_at = Some(now);
        state.status = ReconciliationStatus::FailOpen;
    }

    /// Poll the authority for this client's tenant, updating state and
    /// firing the observer for any transition. Also invoked periodically by
    /// [`ReconciliationClient::start`].
    #[instrument(skip_all, fields(tenant = %self.tenant))]
    pub async fn poll(&self, now: common::time::TimestampMillis) {
        let mut state = self.state.lock().await;

        // The fail-open duration ceiling is checked unconditionally, even if
        // the poll itself succeeds, since entering FAIL_CLOSED here must
        // still precede applying a fresh authority value.
        if state.status == ReconciliationStatus::FailOpen {
            if let Some(started) = state.fail_open_started_at {
                let elapsed = now.as_i64().saturating_sub(started.as_i64()) as u64;
                if elapsed >= self.fail_open_max_duration.as_millis() as u64 {
                    let from = state.status;
                    state.status = ReconciliationStatus::FailClosed;
                    drop(state);
                    self.notify(from, ReconciliationStatus::FailClosed, reason::FAIL_OPEN_DURATION_EXCEEDED);
                    state = self.state.lock().await;
                }
            }
        }

        match self.authority.fetch_committed_spend(&self.tenant).await {
            Ok((authority_spend, authority_limit)) => {
                state.authority_spend = authority_spend;
                state.last_poll_at = Some(now);
                state.consecutive_failures = 0;

                let drift = state.local_spend.as_micros().abs_diff(authority_spend.as_micros());
                let from = state.status;
                if drift > self.drift_threshold.as_micros() {
                    if from != ReconciliationStatus::FailOpen {
                        self.enter_fail_open(&mut state, authority_limit, now);
                    }
                    let to = state.status;
                    drop(state);
                    self.notify(from, to, reason::DRIFT_EXCEEDED);
                } else {
                    state.status = ReconciliationStatus::Synced;
                    state.fail_open_started_at = None;
                    debug!("reconciliation synced");
                    drop(state);
                    self.notify(from, ReconciliationStatus::Synced, reason::RECONCILIATION_SUCCESSFUL);
                }
            }
            Err(e) => {
                warn!(error = %e, "authority poll failed");
                state.consecutive_failures += 1;
                state.last_poll_at = Some(now);
                let from = state.status;
                if from != ReconciliationStatus::FailOpen {
                    // Use the last-known authority value as the limit
                    // estimate; a real deployment would carry a configured
                    // ceiling independent of any single poll.
                    let limit = state.authority_spend;
                    self.enter_fail_open(&mut state, limit, now);
                }
                let to = state.status;
                drop(state);
                self.notify(from, to, reason::AUTHORITY_UNREACHABLE);
            }
        }
    }

    /// Spawn the periodic polling loop. Returns a handle the caller should
    /// hold to keep the task alive, and a sender that triggers an immediate
    /// out-of-band poll (used by callers who want to reconcile synchronously
    /// without waiting for the next tick).
    pub fn start(self: Arc<Self>) -> (LxTask<()>, mpsc::Sender<()>) {
        let (tx, mut rx) = mpsc::channel(1);
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        let task = LxTask::spawn(async move {
            let mut timer = interval(this.poll_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        this.poll(common::time::TimestampMillis::now()).await;
                    }
                    _ = rx.recv() => {
                        this.poll(common::time::TimestampMillis::now()).await;
                    }
                    () = shutdown.recv() => {
                        info!("reconciliation client shutting down");
                        break;
                    }
                }
            }
        });
        (task, tx)
    }

    pub fn stop(&self) {
        self.shutdown.send();
    }
}

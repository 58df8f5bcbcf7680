//! Background sync loop.
//!
//! One tokio task owns the [`SyncEngine`] and the push channel and is the only
//! place state changes. It multiplexes the channel, a reconnect timer, the
//! drain ticker, operator actions from [`SyncHandle`] and the outcomes of
//! in-flight requests, and publishes a [`SyncSnapshot`] after each step.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::OrderApi;
use crate::channel::{PushChannel, PushEnvelope};
use crate::config::SyncConfig;
use crate::credentials::CredentialSource;
use crate::engine::{execute_batch, DrainOutcome, SyncEngine};
use crate::error::{ApiError, ChannelError, SyncError};
use crate::model::{
    CommandId, CommandPayload, CompletionData, Order, OrderId, OrderStatus, Partition,
};
use crate::monitor::{ChannelLifecycle, ConnectionBanner};
use crate::store::{OrderState, OrderView};

const ACTION_INBOX_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Published state
// ---------------------------------------------------------------------------

/// Everything the operator screen renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub unclaimed: Vec<OrderView>,
    pub mine_queued: Vec<OrderView>,
    pub in_progress: Vec<OrderView>,
    pub completed: Vec<OrderView>,
    pub banner: ConnectionBanner,
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncSnapshot {
    pub fn capture(state: &OrderState, banner: ConnectionBanner) -> Self {
        Self {
            unclaimed: state.partition(Partition::Unclaimed),
            mine_queued: state.partition(Partition::MineQueued),
            in_progress: state.partition(Partition::InProgress),
            completed: state.partition(Partition::Completed),
            banner,
            last_sync: state.last_sync(),
        }
    }

    pub fn partition(&self, partition: Partition) -> &[OrderView] {
        match partition {
            Partition::Unclaimed => &self.unclaimed,
            Partition::MineQueued => &self.mine_queued,
            Partition::InProgress => &self.in_progress,
            Partition::Completed => &self.completed,
        }
    }

    /// Find an order in whichever partition holds it.
    pub fn view(&self, order_id: OrderId) -> Option<(Partition, &OrderView)> {
        Partition::ALL.into_iter().find_map(|p| {
            self.partition(p)
                .iter()
                .find(|v| v.order.id == order_id)
                .map(|v| (p, v))
        })
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Deterministic jitter in [50, 750) ms so every client does not retry in
/// lockstep.
fn deterministic_jitter_ms(seed: i64) -> u64 {
    (seed.unsigned_abs() % 700) + 50
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`
/// plus jitter, kept within `[base, max]`.
pub fn reconnect_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let raw = base.saturating_mul(1u32 << exponent);
    let jitter = Duration::from_millis(deterministic_jitter_ms(i64::from(attempt)));
    raw.saturating_add(jitter).max(base).min(max.max(base))
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Action {
    Submit {
        payload: CommandPayload,
        reply: Reply<CommandId>,
    },
    RetryFailed {
        order_id: OrderId,
        reply: Reply<CommandId>,
    },
    ClearError {
        order_id: OrderId,
    },
    Drain,
    Reconnect,
}

enum LoopMessage {
    Resolved(DrainOutcome),
    /// Carries the commands the batch held back.
    BatchDone(Vec<CommandId>),
    Refreshed {
        mark: u64,
        result: Result<Vec<Order>, ApiError>,
    },
}

struct SyncLoop<A: OrderApi, C: PushChannel> {
    engine: SyncEngine<A>,
    channel: C,
    credentials: Arc<dyn CredentialSource>,
    snapshots: watch::Sender<SyncSnapshot>,
    actions: mpsc::Receiver<Action>,
    outcome_tx: mpsc::UnboundedSender<LoopMessage>,
    outcome_rx: mpsc::UnboundedReceiver<LoopMessage>,
    cancel: CancellationToken,
    connected: bool,
    ever_connected: bool,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    reconnect_limit: Option<u32>,
    draining: bool,
    drain_requested: bool,
    base_delay: Duration,
    max_delay: Duration,
    drain_interval: Duration,
}

impl<A: OrderApi, C: PushChannel> SyncLoop<A, C> {
    async fn run(mut self) {
        info!(
            operator_id = self.engine.operator_id(),
            drain_interval_secs = self.drain_interval.as_secs(),
            "sync loop started"
        );
        self.reconnect_at = Some(Instant::now());
        let mut ticker = tokio::time::interval(self.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.try_connect().await;
                }
                received = self.channel.recv(), if self.connected => self.on_received(received),
                action = self.actions.recv() => match action {
                    Some(action) => self.on_action(action),
                    None => {
                        debug!("all sync handles dropped");
                        break;
                    }
                },
                Some(message) = self.outcome_rx.recv() => self.on_message(message),
                _ = ticker.tick() => self.start_drain(),
            }
            self.publish();
        }

        self.channel.close().await;
        info!(queued = self.engine.state().queue().len(), "sync loop stopped");
    }

    fn publish(&self) {
        let next = SyncSnapshot::capture(self.engine.state(), self.engine.banner());
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    // -- channel ------------------------------------------------------------

    async fn try_connect(&mut self) {
        let token = match self.credentials.bearer_token() {
            Ok(token) => token,
            Err(e) => {
                self.connect_failed(ChannelError::from(e).to_string());
                return;
            }
        };
        match self.channel.connect(token.as_str()).await {
            Ok(()) => {
                let lifecycle = if self.ever_connected {
                    ChannelLifecycle::Reconnect
                } else {
                    ChannelLifecycle::Connect
                };
                self.connected = true;
                self.ever_connected = true;
                self.reconnect_attempt = 0;
                self.engine.observe_channel(lifecycle.clone());
                if lifecycle == ChannelLifecycle::Reconnect {
                    self.spawn_refresh();
                }
                self.start_drain();
            }
            Err(e) => self.connect_failed(e.to_string()),
        }
    }

    fn connect_failed(&mut self, message: String) {
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        warn!(
            attempt = self.reconnect_attempt,
            error = %message,
            "push channel connect failed"
        );
        self.engine
            .observe_channel(ChannelLifecycle::ConnectError(message));
        match self.reconnect_limit {
            Some(limit) if self.reconnect_attempt >= limit => {
                warn!(attempts = self.reconnect_attempt, "giving up on push channel");
                self.reconnect_at = None;
                self.engine.observe_channel(ChannelLifecycle::ReconnectFailed);
            }
            _ => self.schedule_reconnect(),
        }
    }

    fn schedule_reconnect(&mut self) {
        let attempt = self.reconnect_attempt.max(1);
        let delay = reconnect_delay(self.base_delay, self.max_delay, attempt);
        self.engine
            .observe_channel(ChannelLifecycle::ReconnectAttempt(attempt));
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn on_received(&mut self, received: Result<PushEnvelope, ChannelError>) {
        match received {
            Ok(envelope) => self.engine.handle_push(&envelope),
            Err(e) => {
                warn!(error = %e, "push channel lost");
                self.connected = false;
                self.reconnect_attempt = 0;
                self.engine.observe_channel(ChannelLifecycle::Disconnect);
                self.schedule_reconnect();
            }
        }
    }

    fn spawn_refresh(&self) {
        let api = self.engine.api();
        let mark = self.engine.refresh_mark();
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_orders().await;
            let _ = tx.send(LoopMessage::Refreshed { mark, result });
        });
    }

    // -- operator actions ---------------------------------------------------

    fn on_action(&mut self, action: Action) {
        match action {
            Action::Submit { payload, reply } => {
                let result = self.engine.submit(payload);
                let queued = result.is_ok();
                let _ = reply.send(result);
                if queued {
                    self.start_drain();
                }
            }
            Action::RetryFailed { order_id, reply } => {
                let result = self.engine.retry_failed(order_id);
                let queued = result.is_ok();
                let _ = reply.send(result);
                if queued {
                    self.start_drain();
                }
            }
            Action::ClearError { order_id } => self.engine.clear_error(order_id),
            Action::Drain => self.start_drain(),
            Action::Reconnect => {
                if !self.connected {
                    info!("manual reconnect requested");
                    self.reconnect_attempt = 0;
                    self.reconnect_at = Some(Instant::now());
                }
            }
        }
    }

    // -- drain --------------------------------------------------------------

    /// Hand the current batch to a request task. At most one batch is out
    /// at a time; a request made meanwhile runs once it lands.
    fn start_drain(&mut self) {
        if self.draining {
            self.drain_requested = true;
            return;
        }
        let batch = self.engine.begin_drain();
        if batch.is_empty() {
            return;
        }
        debug!(commands = batch.len(), "draining queue");
        self.draining = true;
        let api = self.engine.api();
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let deferred = execute_batch(api, batch, |outcome| {
                tx.send(LoopMessage::Resolved(outcome)).is_ok()
            })
            .await;
            let _ = tx.send(LoopMessage::BatchDone(deferred));
        });
    }

    fn on_message(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Resolved(outcome) => self.engine.resolve(outcome),
            LoopMessage::BatchDone(deferred) => {
                if !deferred.is_empty() {
                    debug!(deferred = deferred.len(), "commands held behind a retry");
                }
                self.engine.release_deferred(deferred);
                self.draining = false;
                if std::mem::take(&mut self.drain_requested) {
                    self.start_drain();
                }
            }
            LoopMessage::Refreshed {
                mark,
                result: Ok(orders),
            } => {
                let count = self.engine.apply_refresh(orders, mark);
                info!(orders = count, "orders refreshed after reconnect");
            }
            LoopMessage::Refreshed { result: Err(e), .. } => {
                warn!(error = %e, "order refresh after reconnect failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Start the loop on the current tokio runtime. The engine should already be
/// bootstrapped.
pub fn spawn_sync_loop<A, C>(
    engine: SyncEngine<A>,
    channel: C,
    credentials: Arc<dyn CredentialSource>,
    config: &SyncConfig,
) -> SyncHandle
where
    A: OrderApi,
    C: PushChannel,
{
    let (snapshots, snapshot_rx) = watch::channel(SyncSnapshot::capture(
        engine.state(),
        engine.banner(),
    ));
    let (action_tx, actions) = mpsc::channel(ACTION_INBOX_CAPACITY);
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let sync_loop = SyncLoop {
        engine,
        channel,
        credentials,
        snapshots,
        actions,
        outcome_tx,
        outcome_rx,
        cancel: cancel.clone(),
        connected: false,
        ever_connected: false,
        reconnect_at: None,
        reconnect_attempt: 0,
        reconnect_limit: config.reconnect_limit(),
        draining: false,
        drain_requested: false,
        base_delay: config.reconnect_base_delay(),
        max_delay: config.reconnect_max_delay(),
        drain_interval: config.drain_interval(),
    };
    let task = tokio::spawn(sync_loop.run());

    SyncHandle {
        actions: action_tx,
        snapshots: snapshot_rx,
        cancel,
        task,
    }
}

pub struct SyncHandle {
    actions: mpsc::Sender<Action>,
    snapshots: watch::Receiver<SyncSnapshot>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub async fn claim(&self, order_id: OrderId) -> Result<CommandId, SyncError> {
        self.submit(CommandPayload::ClaimOrder { order_id }).await
    }

    pub async fn update_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<CommandId, SyncError> {
        self.submit(CommandPayload::UpdateStatus { order_id, status })
            .await
    }

    pub async fn acknowledge_change(
        &self,
        order_id: OrderId,
        change_version: u64,
    ) -> Result<CommandId, SyncError> {
        self.submit(CommandPayload::AcknowledgeChange {
            order_id,
            change_version,
        })
        .await
    }

    pub async fn complete(
        &self,
        order_id: OrderId,
        completion: CompletionData,
    ) -> Result<CommandId, SyncError> {
        self.submit(CommandPayload::CompleteOrder {
            order_id,
            completion,
        })
        .await
    }

    pub async fn submit(&self, payload: CommandPayload) -> Result<CommandId, SyncError> {
        let (reply, response) = oneshot::channel();
        self.send(Action::Submit { payload, reply }).await?;
        response.await.map_err(|_| SyncError::Stopped)?
    }

    pub async fn retry_failed(&self, order_id: OrderId) -> Result<CommandId, SyncError> {
        let (reply, response) = oneshot::channel();
        self.send(Action::RetryFailed { order_id, reply }).await?;
        response.await.map_err(|_| SyncError::Stopped)?
    }

    pub async fn clear_error(&self, order_id: OrderId) -> Result<(), SyncError> {
        self.send(Action::ClearError { order_id }).await
    }

    /// Drain now instead of waiting for the next tick.
    pub async fn force_drain(&self) -> Result<(), SyncError> {
        self.send(Action::Drain).await
    }

    /// Try the push channel again after the loop gave up on it.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.send(Action::Reconnect).await
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Stop the loop, close the channel and wait for the task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "sync loop task ended abnormally");
        }
    }

    async fn send(&self, action: Action) -> Result<(), SyncError> {
        self.actions
            .send(action)
            .await
            .map_err(|_| SyncError::Stopped)
    }
}

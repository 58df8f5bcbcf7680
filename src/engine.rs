//! Order sync engine.
//!
//! Owns the order state and funnels every change through [`store::apply`]:
//! push messages, operator actions, request outcomes and channel lifecycle
//! all end up as a [`StoreEvent`] dispatched here. Operator actions are
//! applied optimistically and queued; [`SyncEngine::drain`] sends the queue
//! to the server and feeds each outcome back as `SyncSucceeded` /
//! `SyncFailed`.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::OrderApi;
use crate::channel::{decode_push, PushEnvelope};
use crate::error::{ApiError, FailureKind, SyncError};
use crate::model::{
    Command, CommandId, CommandPayload, CompletionData, ConnectionStatus, Order, OrderId,
    OrderStatus, UserId,
};
use crate::monitor::{ChannelLifecycle, ConnectionBanner, ConnectionMonitor};
use crate::replay::ReplayBuffer;
use crate::store::{self, OrderState, StoreEvent, SyncFailure};

/// Result of one request issued during a drain.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainOutcome {
    pub command_id: CommandId,
    pub result: Result<Option<Order>, ApiError>,
}

/// Tally of one drain call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Transient failures left queued for the next cycle.
    pub retrying: usize,
    /// Not sent because an earlier command for the same order failed
    /// transiently in this pass.
    pub deferred: usize,
}

pub struct SyncEngine<A: OrderApi> {
    api: Arc<A>,
    operator_id: UserId,
    state: OrderState,
    monitor: ConnectionMonitor,
    in_flight: HashSet<CommandId>,
    replay: Option<ReplayBuffer>,
    /// Bumped on every resolved command; `last_resolved` keeps the value per
    /// order so a refresh fetched earlier cannot roll it back.
    resolution_seq: u64,
    last_resolved: HashMap<OrderId, u64>,
}

impl<A: OrderApi> SyncEngine<A> {
    pub fn new(api: Arc<A>, operator_id: UserId, retry_limit: Option<u32>) -> Self {
        Self {
            api,
            operator_id,
            state: OrderState::new(retry_limit),
            monitor: ConnectionMonitor::new(),
            in_flight: HashSet::new(),
            replay: None,
            resolution_seq: 0,
            last_resolved: HashMap::new(),
        }
    }

    pub fn with_replay(mut self, replay: ReplayBuffer) -> Self {
        self.replay = Some(replay);
        self
    }

    pub fn api(&self) -> Arc<A> {
        Arc::clone(&self.api)
    }

    pub fn operator_id(&self) -> UserId {
        self.operator_id
    }

    pub fn state(&self) -> &OrderState {
        &self.state
    }

    pub fn banner(&self) -> ConnectionBanner {
        self.monitor.banner(self.state.queue().len())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// The serial dispatch point. Every state change goes through here.
    pub fn dispatch(&mut self, event: StoreEvent) {
        let touches_queue = event.touches_queue();
        debug!(event = event.name(), "dispatch");
        let state = std::mem::take(&mut self.state);
        self.state = store::apply(state, event);
        if touches_queue {
            self.persist_queue();
        }
    }

    fn persist_queue(&mut self) {
        if let Some(replay) = self.replay.as_mut() {
            if let Err(e) = replay.save(self.state.queue()) {
                warn!(error = %e, "failed to write replay buffer");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Bulk load plus replay of commands left over from a previous session.
    /// Returns the number of orders loaded.
    pub async fn bootstrap(&mut self) -> Result<usize, SyncError> {
        let orders = self.api.fetch_orders().await?;
        let count = orders.len();
        self.dispatch(StoreEvent::InitialLoad {
            orders,
            self_id: self.operator_id,
        });
        info!(orders = count, operator_id = self.operator_id, "initial load complete");
        self.restore_replay()?;
        Ok(count)
    }

    fn restore_replay(&mut self) -> Result<(), SyncError> {
        let Some(replay) = self.replay.as_ref() else {
            return Ok(());
        };
        let commands = replay.load()?;
        if commands.is_empty() {
            return Ok(());
        }
        let total = commands.len();
        let mut restored = 0;
        for command in commands {
            if self.state.order(command.order_id()).is_none() {
                warn!(
                    command_id = %command.id,
                    order_id = command.order_id(),
                    "discarding replayed command for unknown order"
                );
                continue;
            }
            self.dispatch(StoreEvent::optimistic(command));
            restored += 1;
        }
        // Drops discarded rows from the buffer.
        self.persist_queue();
        info!(restored, total, "replayed pending commands");
        Ok(())
    }

    /// Re-fetch the full collection and merge it (used after a reconnect).
    pub async fn refresh(&mut self) -> Result<usize, SyncError> {
        let mark = self.refresh_mark();
        let orders = self.api.fetch_orders().await?;
        Ok(self.apply_refresh(orders, mark))
    }

    /// Take before starting a bulk fetch and hand to [`Self::apply_refresh`].
    pub fn refresh_mark(&self) -> u64 {
        self.resolution_seq
    }

    /// Merge a bulk fetch started at `mark`. Orders with a command resolved
    /// after that point keep their local state. Returns how many orders were
    /// merged.
    pub fn apply_refresh(&mut self, orders: Vec<Order>, mark: u64) -> usize {
        let (fresh, outdated): (Vec<Order>, Vec<Order>) = orders.into_iter().partition(|o| {
            self.last_resolved
                .get(&o.id)
                .map_or(true, |&resolved| resolved <= mark)
        });
        if !outdated.is_empty() {
            debug!(skipped = outdated.len(), "refresh predates local resolutions");
        }
        let count = fresh.len();
        self.dispatch(StoreEvent::SnapshotRefreshed(fresh));
        debug!(orders = count, "snapshot refreshed");
        count
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    pub fn claim(&mut self, order_id: OrderId) -> Result<CommandId, SyncError> {
        self.submit(CommandPayload::ClaimOrder { order_id })
    }

    pub fn update_status(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<CommandId, SyncError> {
        self.submit(CommandPayload::UpdateStatus { order_id, status })
    }

    pub fn acknowledge_change(
        &mut self,
        order_id: OrderId,
        change_version: u64,
    ) -> Result<CommandId, SyncError> {
        self.submit(CommandPayload::AcknowledgeChange {
            order_id,
            change_version,
        })
    }

    pub fn complete(
        &mut self,
        order_id: OrderId,
        completion: CompletionData,
    ) -> Result<CommandId, SyncError> {
        self.submit(CommandPayload::CompleteOrder {
            order_id,
            completion,
        })
    }

    /// Record a new command and apply it optimistically in one step.
    pub fn submit(&mut self, payload: CommandPayload) -> Result<CommandId, SyncError> {
        if !self.state.is_loaded() {
            return Err(SyncError::NotLoaded);
        }
        let order_id = payload.order_id();
        if self.state.order(order_id).is_none() {
            return Err(SyncError::UnknownOrder(order_id));
        }
        let command = Command::new(payload);
        let id = command.id.clone();
        info!(
            command_id = %id,
            kind = %command.kind(),
            order_id,
            queued = self.state.queue().len() + 1,
            "command queued"
        );
        self.dispatch(StoreEvent::optimistic(command));
        Ok(id)
    }

    /// Re-issue the command behind an order's failure badge under a new id.
    pub fn retry_failed(&mut self, order_id: OrderId) -> Result<CommandId, SyncError> {
        let payload = self
            .state
            .failure(order_id)
            .map(|f| f.command.payload.clone())
            .ok_or(SyncError::NoFailure(order_id))?;
        self.submit(payload)
    }

    pub fn clear_error(&mut self, order_id: OrderId) {
        self.dispatch(StoreEvent::ClearOrderError(order_id));
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    pub fn handle_push(&mut self, envelope: &PushEnvelope) {
        match decode_push(envelope) {
            Ok(Some(event)) => self.dispatch(event),
            Ok(None) => debug!(event = %envelope.event, "ignoring unknown push event"),
            Err(e) => warn!(event = %envelope.event, error = %e, "dropping undecodable push"),
        }
    }

    /// Mirror a channel lifecycle event. Returns `true` when the channel just
    /// became connected.
    pub fn observe_channel(&mut self, event: ChannelLifecycle) -> bool {
        let Some(status) = self.monitor.observe(&event) else {
            return false;
        };
        info!(?status, queued = self.state.queue().len(), "connection status changed");
        self.dispatch(StoreEvent::ConnectionChanged(status));
        status == ConnectionStatus::Connected
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Commands to send this cycle, marked in flight. Empty unless the
    /// channel is connected.
    pub fn begin_drain(&mut self) -> Vec<Command> {
        if !self.state.connection().is_connected() {
            return Vec::new();
        }
        let batch = self.state.queue().drain_plan(&self.in_flight);
        for command in &batch {
            self.in_flight.insert(command.id.clone());
        }
        batch
    }

    /// Return commands a batch skipped to the queue's sendable set.
    pub fn release_deferred(&mut self, deferred: Vec<CommandId>) {
        for command_id in deferred {
            self.in_flight.remove(&command_id);
        }
    }

    /// Feed one request outcome back into the store.
    pub fn resolve(&mut self, outcome: DrainOutcome) {
        let DrainOutcome { command_id, result } = outcome;
        self.in_flight.remove(&command_id);
        if let Some(order_id) = self.state.queue().get(&command_id).map(|q| q.command.order_id()) {
            self.resolution_seq += 1;
            self.last_resolved.insert(order_id, self.resolution_seq);
        }
        match result {
            Ok(confirmed) => {
                info!(command_id = %command_id, "command confirmed");
                self.dispatch(StoreEvent::SyncSucceeded {
                    command_id,
                    confirmed,
                    at: Utc::now(),
                });
            }
            Err(e) => {
                let kind = e.classify();
                let retry_count = self
                    .state
                    .queue()
                    .get(&command_id)
                    .map(|q| q.command.retry_count)
                    .unwrap_or_default();
                match kind {
                    FailureKind::Transient => {
                        debug!(command_id = %command_id, retry_count, error = %e, "transient failure, will retry")
                    }
                    _ => {
                        warn!(command_id = %command_id, ?kind, error = %e, "command rejected")
                    }
                }
                self.dispatch(StoreEvent::SyncFailed {
                    command_id,
                    failure: SyncFailure {
                        kind,
                        message: e.to_string(),
                    },
                });
            }
        }
    }

    /// Attempt every queued command once, in submission order, continuing
    /// past failures. An order whose command fails transiently holds its
    /// later commands until the next pass. Does nothing while the channel is
    /// not connected.
    pub async fn drain(&mut self) -> DrainReport {
        let batch = self.begin_drain();
        let mut report = DrainReport::default();
        let mut held: HashSet<OrderId> = HashSet::new();
        for command in batch {
            let order_id = command.order_id();
            if held.contains(&order_id) {
                self.in_flight.remove(&command.id);
                report.deferred += 1;
                continue;
            }
            report.attempted += 1;
            let result = self.api.execute(&command).await;
            if holds_order(&result) {
                held.insert(order_id);
            }
            let ok = result.is_ok();
            let command_id = command.id.clone();
            self.resolve(DrainOutcome {
                command_id: command_id.clone(),
                result,
            });
            if ok {
                report.succeeded += 1;
            } else if self.state.queue().contains(&command_id) {
                report.retrying += 1;
            } else {
                report.failed += 1;
            }
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                retrying = report.retrying,
                deferred = report.deferred,
                "drain complete"
            );
        }
        report
    }
}

/// A transient failure keeps the order's later commands back for this pass.
fn holds_order(result: &Result<Option<Order>, ApiError>) -> bool {
    matches!(result, Err(e) if e.classify() == FailureKind::Transient)
}

/// Send a drain batch in order, reporting each outcome as it lands. Used by
/// the runtime loop so push messages keep flowing while requests are out.
/// Returns the commands held back behind a transient failure of an earlier
/// command for the same order; hand them to [`SyncEngine::release_deferred`].
pub async fn execute_batch<A, F>(
    api: Arc<A>,
    batch: Vec<Command>,
    mut on_outcome: F,
) -> Vec<CommandId>
where
    A: OrderApi,
    F: FnMut(DrainOutcome) -> bool + Send,
{
    let mut held: HashSet<OrderId> = HashSet::new();
    let mut deferred = Vec::new();
    for command in batch {
        let order_id = command.order_id();
        if held.contains(&order_id) {
            deferred.push(command.id);
            continue;
        }
        let result = api.execute(&command).await;
        if holds_order(&result) {
            held.insert(order_id);
        }
        if !on_outcome(DrainOutcome {
            command_id: command.id,
            result,
        }) {
            break;
        }
    }
    deferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Partition;
    use crate::test_support::{assigned_order, order, MockOrderApi};

    const OPERATOR: UserId = 42;

    async fn connected_engine(api: Arc<MockOrderApi>) -> SyncEngine<MockOrderApi> {
        let mut engine = SyncEngine::new(api, OPERATOR, Some(100));
        engine.bootstrap().await.expect("bootstrap");
        engine.observe_channel(ChannelLifecycle::Connect);
        engine
    }

    fn scenario_orders() -> Vec<Order> {
        vec![
            order(7, OrderStatus::Dispatched),
            assigned_order(8, OrderStatus::EnRoute, OPERATOR),
            assigned_order(9, OrderStatus::Completed, OPERATOR),
        ]
    }

    #[tokio::test]
    async fn bulk_load_claim_and_confirm() {
        let api = Arc::new(MockOrderApi::with_orders(scenario_orders()));
        let mut engine = connected_engine(api.clone()).await;

        let state = engine.state();
        assert_eq!(state.partition_ids(Partition::Unclaimed), vec![7]);
        assert_eq!(state.partition_ids(Partition::InProgress), vec![8]);
        assert_eq!(state.partition_ids(Partition::Completed), vec![9]);

        let id = engine.claim(7).expect("claim");
        let view = engine.state().view(7).unwrap();
        assert_eq!(engine.state().partition_of(7), Some(Partition::MineQueued));
        assert!(view.is_queued);
        assert_eq!(view.order.status, OrderStatus::Acknowledged);
        assert_eq!(engine.state().queue().len(), 1);

        let report = engine.drain().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert!(!engine.state().is_queued(7));
        assert!(engine.state().queue().is_empty());
        assert!(engine.state().last_sync().is_some());
        assert_eq!(api.executed_ids(), vec![id]);
    }

    #[tokio::test]
    async fn offline_update_drains_once_after_reconnect() {
        let api = Arc::new(MockOrderApi::with_orders(vec![assigned_order(
            7,
            OrderStatus::Acknowledged,
            OPERATOR,
        )]));
        let mut engine = SyncEngine::new(api.clone(), OPERATOR, Some(100));
        engine.bootstrap().await.unwrap();

        engine.update_status(7, OrderStatus::EnRoute).unwrap();
        let view = engine.state().view(7).unwrap();
        assert_eq!(view.order.status, OrderStatus::EnRoute);
        assert!(view.is_queued);
        assert_eq!(engine.banner().queued_count, 1);
        assert_eq!(engine.banner().status, ConnectionStatus::Disconnected);

        let report = engine.drain().await;
        assert_eq!(report, DrainReport::default(), "no drain while offline");
        assert!(api.executed_ids().is_empty());

        assert!(engine.observe_channel(ChannelLifecycle::Reconnect));
        let report = engine.drain().await;
        assert_eq!(report.succeeded, 1);
        assert!(!engine.state().is_queued(7));

        let report = engine.drain().await;
        assert_eq!(report.attempted, 0);
        assert_eq!(api.executed_ids().len(), 1, "no duplicate request");
    }

    #[tokio::test]
    async fn stale_acknowledge_is_rejected_and_retryable() {
        let mut current = assigned_order(7, OrderStatus::Fueling, OPERATOR);
        current.change_version = 4;
        let api = Arc::new(MockOrderApi::with_orders(vec![current]));
        let mut engine = connected_engine(api.clone()).await;

        engine.acknowledge_change(7, 4).unwrap();

        let mut bumped = assigned_order(7, OrderStatus::Fueling, OPERATOR);
        bumped.change_version = 5;
        engine.handle_push(&PushEnvelope::new(
            crate::channel::EVENT_ORDER_UPDATE,
            serde_json::to_value(&bumped).unwrap(),
        ));
        assert!(engine.state().is_queued(7));

        api.push_response(Err(ApiError::Status {
            status: 409,
            message: "Stale changeVersion: expected 5, got 4".into(),
        }));
        let report = engine.drain().await;
        assert_eq!(report.failed, 1);

        let view = engine.state().view(7).unwrap();
        assert!(view.is_sync_failed);
        assert!(!view.is_queued);
        assert_eq!(view.failure_kind, Some(FailureKind::Conflict));
        assert_eq!(view.order.change_version, 5);

        let retry_id = engine.retry_failed(7).expect("retry is available");
        assert!(engine.state().is_queued(7));
        assert!(!engine.state().is_sync_failed(7));
        assert_ne!(Some(&retry_id), api.executed_ids().first());
    }

    #[tokio::test]
    async fn drain_continues_past_failures() {
        let api = Arc::new(MockOrderApi::with_orders(vec![
            order(1, OrderStatus::Dispatched),
            order(2, OrderStatus::Dispatched),
            order(3, OrderStatus::Dispatched),
        ]));
        let mut engine = connected_engine(api.clone()).await;
        engine.claim(1).unwrap();
        engine.claim(2).unwrap();
        engine.claim(3).unwrap();

        api.push_response(Err(ApiError::Connect {
            url: "http://orders".into(),
        }));
        api.push_response(Err(ApiError::Status {
            status: 400,
            message: "already claimed".into(),
        }));
        api.push_response(Ok(None));

        let report = engine.drain().await;
        assert_eq!(
            report,
            DrainReport {
                attempted: 3,
                succeeded: 1,
                failed: 1,
                retrying: 1,
                deferred: 0,
            }
        );
        assert!(engine.state().is_queued(1));
        assert_eq!(
            engine.state().queue().iter().next().map(|q| q.command.retry_count),
            Some(1)
        );
        assert!(engine.state().is_sync_failed(2));
        assert_eq!(engine.state().partition_of(2), Some(Partition::Unclaimed));
        assert!(!engine.state().is_queued(3));

        let report = engine.drain().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        assert!(engine.state().queue().is_empty());
    }

    #[tokio::test]
    async fn same_order_commands_go_out_in_submission_order() {
        let api = Arc::new(MockOrderApi::with_orders(vec![order(7, OrderStatus::Dispatched)]));
        let mut engine = connected_engine(api.clone()).await;
        let first = engine.claim(7).unwrap();
        let second = engine.update_status(7, OrderStatus::EnRoute).unwrap();
        let third = engine.update_status(7, OrderStatus::Fueling).unwrap();
        assert_eq!(engine.state().queue().count_for_order(7), 3);

        engine.drain().await;
        assert_eq!(api.executed_ids(), vec![first, second, third]);
        assert_eq!(
            engine.state().order(7).map(|o| o.status),
            Some(OrderStatus::Fueling)
        );
    }

    #[tokio::test]
    async fn transient_failure_holds_later_commands_for_the_order() {
        let api = Arc::new(MockOrderApi::with_orders(vec![
            order(7, OrderStatus::Dispatched),
            order(8, OrderStatus::Dispatched),
        ]));
        let mut engine = connected_engine(api.clone()).await;
        let claim = engine.claim(7).unwrap();
        let update = engine.update_status(7, OrderStatus::EnRoute).unwrap();
        let other = engine.claim(8).unwrap();

        api.push_response(Err(ApiError::Status {
            status: 503,
            message: "unavailable".into(),
        }));
        let report = engine.drain().await;
        assert_eq!(
            report,
            DrainReport {
                attempted: 2,
                succeeded: 1,
                failed: 0,
                retrying: 1,
                deferred: 1,
            }
        );
        assert_eq!(api.executed_ids(), vec![claim.clone(), other.clone()]);
        assert_eq!(engine.state().queue().count_for_order(7), 2);
        assert_eq!(engine.in_flight_count(), 0);

        engine.drain().await;
        assert_eq!(api.executed_ids(), vec![claim.clone(), other, claim, update]);
        assert!(engine.state().queue().is_empty());
        assert_eq!(
            engine.state().order(7).map(|o| o.status),
            Some(OrderStatus::EnRoute)
        );
    }

    #[tokio::test]
    async fn rejected_claim_after_retry_never_sent_the_update() {
        let api = Arc::new(MockOrderApi::with_orders(vec![order(7, OrderStatus::Dispatched)]));
        let mut engine = connected_engine(api.clone()).await;
        let claim = engine.claim(7).unwrap();
        let update = engine.update_status(7, OrderStatus::EnRoute).unwrap();

        api.push_response(Err(ApiError::Timeout {
            url: "http://orders".into(),
        }));
        engine.drain().await;
        assert_eq!(api.executed_ids(), vec![claim.clone()]);

        api.push_response(Err(ApiError::Status {
            status: 400,
            message: "already claimed".into(),
        }));
        api.push_response(Err(ApiError::Status {
            status: 403,
            message: "not assigned to you".into(),
        }));
        let report = engine.drain().await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.deferred, 0);
        // The update only goes out once the claim has resolved.
        assert_eq!(api.executed_ids(), vec![claim.clone(), claim, update]);
        assert!(engine.state().queue().is_empty());
        assert!(engine.state().is_sync_failed(7));
        assert_eq!(engine.state().partition_of(7), Some(Partition::Unclaimed));
        assert_eq!(
            engine.state().order(7).map(|o| o.status),
            Some(OrderStatus::Dispatched)
        );
    }

    #[tokio::test]
    async fn batch_defers_commands_behind_a_transient_failure() {
        let api = Arc::new(MockOrderApi::with_orders(vec![]));
        let first = Command::new(CommandPayload::ClaimOrder { order_id: 1 });
        let second = Command::new(CommandPayload::UpdateStatus {
            order_id: 1,
            status: OrderStatus::EnRoute,
        });
        let third = Command::new(CommandPayload::ClaimOrder { order_id: 2 });
        api.push_response(Err(ApiError::Connect {
            url: "http://orders".into(),
        }));

        let mut seen = Vec::new();
        let deferred = execute_batch(
            api.clone(),
            vec![first.clone(), second.clone(), third.clone()],
            |outcome| {
                seen.push(outcome.command_id);
                true
            },
        )
        .await;
        assert_eq!(deferred, vec![second.id]);
        assert_eq!(seen, vec![first.id, third.id]);
    }

    #[tokio::test]
    async fn refresh_fetched_before_a_resolution_keeps_local_state() {
        let api = Arc::new(MockOrderApi::with_orders(vec![order(7, OrderStatus::Dispatched)]));
        let mut engine = connected_engine(api.clone()).await;

        let mark = engine.refresh_mark();
        engine.claim(7).unwrap();
        assert_eq!(engine.drain().await.succeeded, 1);

        assert_eq!(engine.apply_refresh(vec![order(7, OrderStatus::Dispatched)], mark), 0);
        assert_eq!(engine.state().partition_of(7), Some(Partition::MineQueued));
        assert_eq!(
            engine.state().order(7).map(|o| o.status),
            Some(OrderStatus::Acknowledged)
        );

        let mut reassigned = assigned_order(7, OrderStatus::Acknowledged, 99);
        reassigned.change_version = 1;
        let later = engine.refresh_mark();
        assert_eq!(engine.apply_refresh(vec![reassigned], later), 1);
        assert_eq!(engine.state().partition_of(7), None);
    }

    #[tokio::test]
    async fn in_flight_commands_are_not_handed_out_twice() {
        let api = Arc::new(MockOrderApi::with_orders(vec![order(7, OrderStatus::Dispatched)]));
        let mut engine = connected_engine(api).await;
        engine.claim(7).unwrap();

        let batch = engine.begin_drain();
        assert_eq!(batch.len(), 1);
        assert!(engine.begin_drain().is_empty());
        assert_eq!(engine.in_flight_count(), 1);

        engine.resolve(DrainOutcome {
            command_id: batch[0].id.clone(),
            result: Err(ApiError::Timeout {
                url: "http://orders".into(),
            }),
        });
        assert_eq!(engine.in_flight_count(), 0);
        assert_eq!(engine.begin_drain().len(), 1);
    }

    #[tokio::test]
    async fn actions_require_loaded_and_known_orders() {
        let api = Arc::new(MockOrderApi::with_orders(vec![order(7, OrderStatus::Dispatched)]));
        let mut engine = SyncEngine::new(api, OPERATOR, None);
        assert!(matches!(engine.claim(7), Err(SyncError::NotLoaded)));

        engine.bootstrap().await.unwrap();
        assert!(matches!(engine.claim(404), Err(SyncError::UnknownOrder(404))));
        assert!(matches!(engine.retry_failed(7), Err(SyncError::NoFailure(7))));
    }

    #[tokio::test]
    async fn reconnect_refresh_merges_missed_pushes() {
        let api = Arc::new(MockOrderApi::with_orders(vec![order(7, OrderStatus::Dispatched)]));
        let mut engine = connected_engine(api.clone()).await;

        let mut taken = assigned_order(7, OrderStatus::Acknowledged, 99);
        taken.change_version = 1;
        api.set_orders(vec![taken, order(10, OrderStatus::Dispatched)]);

        assert_eq!(engine.refresh().await.unwrap(), 2);
        assert_eq!(engine.state().partition_of(7), None);
        assert_eq!(
            engine.state().partition_ids(Partition::Unclaimed),
            vec![10]
        );
    }

    #[tokio::test]
    async fn replay_buffer_restores_pending_commands() {
        let api = Arc::new(MockOrderApi::with_orders(vec![
            order(7, OrderStatus::Dispatched),
            order(8, OrderStatus::Dispatched),
        ]));

        let mut buffer = ReplayBuffer::open_in_memory().unwrap();
        let kept = Command::new(CommandPayload::ClaimOrder { order_id: 7 });
        let orphan = Command::new(CommandPayload::ClaimOrder { order_id: 404 });
        let mut seed = crate::queue::CommandQueue::new();
        seed.enqueue(kept.clone(), order(7, OrderStatus::Dispatched));
        seed.enqueue(orphan, order(404, OrderStatus::Dispatched));
        buffer.save(&seed).unwrap();

        let mut engine = SyncEngine::new(api, OPERATOR, None).with_replay(buffer);
        engine.bootstrap().await.unwrap();

        assert_eq!(engine.state().queue().len(), 1);
        assert!(engine.state().queue().contains(&kept.id));
        assert_eq!(engine.state().partition_of(7), Some(Partition::MineQueued));

        engine.claim(8).unwrap();
        let stored = engine.replay.as_ref().unwrap().load().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, kept.id);
    }

    #[tokio::test]
    async fn execute_batch_stops_when_receiver_is_gone() {
        let api = Arc::new(MockOrderApi::with_orders(vec![]));
        let batch = vec![
            Command::new(CommandPayload::ClaimOrder { order_id: 1 }),
            Command::new(CommandPayload::ClaimOrder { order_id: 2 }),
        ];
        let mut seen = Vec::new();
        execute_batch(api.clone(), batch, |outcome| {
            seen.push(outcome.command_id);
            false
        })
        .await;
        assert_eq!(seen.len(), 1);
        assert_eq!(api.executed_ids().len(), 1);
    }
}

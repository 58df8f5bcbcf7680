//! Order state machine.
//!
//! All local state lives in [`OrderState`] and changes only through
//! [`apply`], a pure and total transition function over [`StoreEvent`].
//! Orders are kept in a single map keyed by id; the four operator partitions
//! and the per-order `is_queued` / `is_sync_failed` flags are derived on read
//! from the map, the pending command queue and the failure table, so they can
//! never disagree with each other.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::FailureKind;
use crate::model::{
    Command, CommandId, CommandKind, ConnectionStatus, Order, OrderId, OrderStatus, Partition,
    UserId,
};
use crate::queue::CommandQueue;

/// Why a command did not go through.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// A permanently rejected command, kept so the operator can retry it.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Bulk bootstrap. Applies once per session.
    InitialLoad { orders: Vec<Order>, self_id: UserId },
    /// Bulk re-fetch after a reconnect, merged like `OrderUpdated`.
    SnapshotRefreshed(Vec<Order>),
    NewOrderPushed(Order),
    OrderClaimed { order_id: OrderId, by_user_id: UserId },
    OrderUpdated(Order),
    OrderDetailsUpdated(Order),
    OrderCompleted(Order),
    OptimisticClaim(Command),
    OptimisticStatusUpdate(Command),
    OptimisticAcknowledge(Command),
    OptimisticComplete(Command),
    SyncSucceeded {
        command_id: CommandId,
        confirmed: Option<Order>,
        at: DateTime<Utc>,
    },
    SyncFailed {
        command_id: CommandId,
        failure: SyncFailure,
    },
    ClearOrderError(OrderId),
    ConnectionChanged(ConnectionStatus),
}

impl StoreEvent {
    /// The optimistic event matching a command's kind.
    pub fn optimistic(command: Command) -> Self {
        match command.kind() {
            CommandKind::ClaimOrder => StoreEvent::OptimisticClaim(command),
            CommandKind::UpdateStatus => StoreEvent::OptimisticStatusUpdate(command),
            CommandKind::AcknowledgeChange => StoreEvent::OptimisticAcknowledge(command),
            CommandKind::CompleteOrder => StoreEvent::OptimisticComplete(command),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreEvent::InitialLoad { .. } => "InitialLoad",
            StoreEvent::SnapshotRefreshed(_) => "SnapshotRefreshed",
            StoreEvent::NewOrderPushed(_) => "NewOrderPushed",
            StoreEvent::OrderClaimed { .. } => "OrderClaimed",
            StoreEvent::OrderUpdated(_) => "OrderUpdated",
            StoreEvent::OrderDetailsUpdated(_) => "OrderDetailsUpdated",
            StoreEvent::OrderCompleted(_) => "OrderCompleted",
            StoreEvent::OptimisticClaim(_) => "OptimisticClaim",
            StoreEvent::OptimisticStatusUpdate(_) => "OptimisticStatusUpdate",
            StoreEvent::OptimisticAcknowledge(_) => "OptimisticAcknowledge",
            StoreEvent::OptimisticComplete(_) => "OptimisticComplete",
            StoreEvent::SyncSucceeded { .. } => "SyncSucceeded",
            StoreEvent::SyncFailed { .. } => "SyncFailed",
            StoreEvent::ClearOrderError(_) => "ClearOrderError",
            StoreEvent::ConnectionChanged(_) => "ConnectionChanged",
        }
    }

    /// Whether applying this event can change the pending command queue.
    pub fn touches_queue(&self) -> bool {
        matches!(
            self,
            StoreEvent::OptimisticClaim(_)
                | StoreEvent::OptimisticStatusUpdate(_)
                | StoreEvent::OptimisticAcknowledge(_)
                | StoreEvent::OptimisticComplete(_)
                | StoreEvent::SyncSucceeded { .. }
                | StoreEvent::SyncFailed { .. }
        )
    }
}

/// Order as presented to the operator, with the derived sync flags.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    #[serde(flatten)]
    pub order: Order,
    pub is_queued: bool,
    pub is_sync_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderState {
    self_id: Option<UserId>,
    loaded: bool,
    orders: BTreeMap<OrderId, Order>,
    queue: CommandQueue,
    failures: BTreeMap<OrderId, FailureRecord>,
    connection: ConnectionStatus,
    last_sync: Option<DateTime<Utc>>,
    /// Transient failures tolerated per command before it is surfaced.
    retry_limit: Option<u32>,
}

impl OrderState {
    pub fn new(retry_limit: Option<u32>) -> Self {
        Self {
            retry_limit,
            ..Self::default()
        }
    }

    pub fn self_id(&self) -> Option<UserId> {
        self.self_id
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn retry_limit(&self) -> Option<u32> {
        self.retry_limit
    }

    pub fn failure(&self, id: OrderId) -> Option<&FailureRecord> {
        self.failures.get(&id)
    }

    pub fn is_queued(&self, id: OrderId) -> bool {
        self.queue.has_order(id)
    }

    pub fn is_sync_failed(&self, id: OrderId) -> bool {
        self.failures.contains_key(&id)
    }

    pub fn partition_of(&self, id: OrderId) -> Option<Partition> {
        let self_id = self.self_id?;
        self.orders.get(&id).and_then(|o| Partition::of(o, self_id))
    }

    /// Order ids in one partition, ascending.
    pub fn partition_ids(&self, partition: Partition) -> Vec<OrderId> {
        let Some(self_id) = self.self_id else {
            return Vec::new();
        };
        self.orders
            .values()
            .filter(|o| Partition::of(o, self_id) == Some(partition))
            .map(|o| o.id)
            .collect()
    }

    pub fn partition(&self, partition: Partition) -> Vec<OrderView> {
        self.partition_ids(partition)
            .into_iter()
            .filter_map(|id| self.view(id))
            .collect()
    }

    pub fn view(&self, id: OrderId) -> Option<OrderView> {
        let order = self.orders.get(&id)?;
        let failure = self.failures.get(&id);
        Some(OrderView {
            order: order.clone(),
            is_queued: self.queue.has_order(id),
            is_sync_failed: failure.is_some(),
            sync_error: failure.map(|f| f.message.clone()),
            failure_kind: failure.map(|f| f.kind),
        })
    }

    /// Authoritative last-write-wins merge. Versions older than what is held
    /// are ignored; pending commands for the order re-base onto the server's
    /// copy.
    fn merge_authoritative(&mut self, order: Order) {
        if let Some(existing) = self.orders.get(&order.id) {
            if order.change_version < existing.change_version {
                return;
            }
        }
        for entry in self.queue.for_order_mut(order.id) {
            entry.snapshot = order.clone();
        }
        self.orders.insert(order.id, order);
    }

    fn apply_optimistic(&mut self, command: Command, expected: CommandKind) {
        if command.kind() != expected || self.queue.contains(&command.id) {
            return;
        }
        let Some(self_id) = self.self_id else {
            return;
        };
        let order_id = command.order_id();
        let Some(current) = self.orders.get(&order_id).cloned() else {
            return;
        };
        let patched = command.payload.optimistic_patch(&current, self_id);
        self.failures.remove(&order_id);
        self.queue.enqueue(command, current);
        self.orders.insert(order_id, patched);
    }

    fn resolve_success(
        &mut self,
        command_id: &CommandId,
        confirmed: Option<Order>,
        at: DateTime<Utc>,
    ) {
        let was_first = self.is_first_for_order(command_id);
        let Some(resolved) = self.queue.remove(command_id) else {
            return;
        };
        let order_id = resolved.command.order_id();
        if was_first {
            if let Some(self_id) = self.self_id {
                let base = resolved
                    .command
                    .payload
                    .optimistic_patch(&resolved.snapshot, self_id);
                if let Some(next) = self.queue.for_order_mut(order_id).next() {
                    next.snapshot = base;
                }
            }
        }
        self.failures.remove(&order_id);
        if let Some(order) = confirmed {
            self.merge_authoritative(order);
        }
        self.last_sync = Some(at);
    }

    fn resolve_failure(&mut self, command_id: &CommandId, failure: SyncFailure) {
        let Some((order_id, retry_count)) = self
            .queue
            .get(command_id)
            .map(|e| (e.command.order_id(), e.command.retry_count))
        else {
            return;
        };
        let mut failure = failure;
        if !failure.kind.is_terminal() {
            let attempts = retry_count.saturating_add(1);
            match self.retry_limit {
                Some(limit) if limit > 0 && attempts >= limit => {
                    failure = SyncFailure {
                        kind: FailureKind::Permanent,
                        message: format!("gave up after {attempts} attempts: {}", failure.message),
                    };
                }
                _ => {
                    self.queue.bump_retry(command_id);
                    return;
                }
            }
        }

        let Some(base) = self
            .queue
            .first_for_order(order_id)
            .map(|first| first.snapshot.clone())
        else {
            return;
        };
        let Some(rejected) = self.queue.remove(command_id) else {
            return;
        };
        self.rebuild_from(order_id, base);
        self.failures.insert(
            order_id,
            FailureRecord {
                kind: failure.kind,
                message: failure.message,
                command: rejected.command,
            },
        );
    }

    /// Reset an order to `base` and replay the optimistic patches of its
    /// still-pending commands on top, in submission order.
    fn rebuild_from(&mut self, order_id: OrderId, base: Order) {
        let Some(self_id) = self.self_id else {
            self.orders.insert(order_id, base);
            return;
        };
        let mut current = base;
        for entry in self.queue.for_order_mut(order_id) {
            entry.snapshot = current.clone();
            current = entry.command.payload.optimistic_patch(&current, self_id);
        }
        self.orders.insert(order_id, current);
    }

    fn is_first_for_order(&self, command_id: &CommandId) -> bool {
        let Some(entry) = self.queue.get(command_id) else {
            return false;
        };
        self.queue
            .first_for_order(entry.command.order_id())
            .is_some_and(|first| &first.command.id == command_id)
    }
}

/// The single transition function. Pure and total: unknown or inapplicable
/// events leave the state untouched.
pub fn apply(mut state: OrderState, event: StoreEvent) -> OrderState {
    match event {
        StoreEvent::InitialLoad { orders, self_id } => {
            if state.loaded {
                return state;
            }
            state.self_id = Some(self_id);
            state.orders = orders.into_iter().map(|o| (o.id, o)).collect();
            state.loaded = true;
        }
        StoreEvent::SnapshotRefreshed(orders) => {
            for order in orders {
                state.merge_authoritative(order);
            }
        }
        StoreEvent::NewOrderPushed(order) => {
            if order.status == OrderStatus::Dispatched && order.is_unassigned() {
                state.merge_authoritative(order);
            }
        }
        StoreEvent::OrderClaimed {
            order_id,
            by_user_id,
        } => {
            let is_self = state.self_id == Some(by_user_id);
            let claim = |order: &mut Order| {
                order.assignee_id = Some(by_user_id);
                if is_self {
                    order.status = OrderStatus::Acknowledged;
                }
            };
            if let Some(order) = state.orders.get_mut(&order_id) {
                claim(order);
                // Pending snapshots follow so a later revert keeps the claim.
                for entry in state.queue.for_order_mut(order_id) {
                    claim(&mut entry.snapshot);
                }
            }
        }
        StoreEvent::OrderUpdated(order) | StoreEvent::OrderDetailsUpdated(order) => {
            state.merge_authoritative(order);
        }
        StoreEvent::OrderCompleted(mut order) => {
            order.status = OrderStatus::Completed;
            state.merge_authoritative(order);
        }
        StoreEvent::OptimisticClaim(command) => {
            state.apply_optimistic(command, CommandKind::ClaimOrder);
        }
        StoreEvent::OptimisticStatusUpdate(command) => {
            state.apply_optimistic(command, CommandKind::UpdateStatus);
        }
        StoreEvent::OptimisticAcknowledge(command) => {
            state.apply_optimistic(command, CommandKind::AcknowledgeChange);
        }
        StoreEvent::OptimisticComplete(command) => {
            state.apply_optimistic(command, CommandKind::CompleteOrder);
        }
        StoreEvent::SyncSucceeded {
            command_id,
            confirmed,
            at,
        } => {
            state.resolve_success(&command_id, confirmed, at);
        }
        StoreEvent::SyncFailed {
            command_id,
            failure,
        } => {
            state.resolve_failure(&command_id, failure);
        }
        StoreEvent::ClearOrderError(order_id) => {
            state.failures.remove(&order_id);
        }
        StoreEvent::ConnectionChanged(status) => {
            state.connection = status;
        }
    }
    state
}

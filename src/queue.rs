//! Pending command queue.
//!
//! Holds every operator command the server has not resolved yet, in
//! submission order, together with the order as it looked before the
//! command's optimistic patch so a rejection can be rolled back.

use std::collections::{HashSet, VecDeque};

use crate::model::{Command, CommandId, Order, OrderId};

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub command: Command,
    /// Order state before this command's optimistic patch.
    pub snapshot: Order,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandQueue {
    entries: VecDeque<QueuedCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command. There is no capacity limit; growth is surfaced to
    /// the operator through `len()`.
    pub fn enqueue(&mut self, command: Command, snapshot: Order) {
        self.entries.push_back(QueuedCommand { command, snapshot });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &CommandId) -> bool {
        self.entries.iter().any(|e| &e.command.id == id)
    }

    pub fn get(&self, id: &CommandId) -> Option<&QueuedCommand> {
        self.entries.iter().find(|e| &e.command.id == id)
    }

    pub fn remove(&mut self, id: &CommandId) -> Option<QueuedCommand> {
        let index = self.entries.iter().position(|e| &e.command.id == id)?;
        self.entries.remove(index)
    }

    /// Increment the retry counter and return the new value.
    pub fn bump_retry(&mut self, id: &CommandId) -> Option<u32> {
        let entry = self.entries.iter_mut().find(|e| &e.command.id == id)?;
        entry.command.retry_count = entry.command.retry_count.saturating_add(1);
        Some(entry.command.retry_count)
    }

    pub fn has_order(&self, order_id: OrderId) -> bool {
        self.entries.iter().any(|e| e.command.order_id() == order_id)
    }

    pub fn count_for_order(&self, order_id: OrderId) -> usize {
        self.for_order(order_id).count()
    }

    pub fn for_order(&self, order_id: OrderId) -> impl Iterator<Item = &QueuedCommand> {
        self.entries
            .iter()
            .filter(move |e| e.command.order_id() == order_id)
    }

    pub fn for_order_mut(&mut self, order_id: OrderId) -> impl Iterator<Item = &mut QueuedCommand> {
        self.entries
            .iter_mut()
            .filter(move |e| e.command.order_id() == order_id)
    }

    /// First unresolved command targeting `order_id`.
    pub fn first_for_order(&self, order_id: OrderId) -> Option<&QueuedCommand> {
        self.for_order(order_id).next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedCommand> {
        self.entries.iter()
    }

    /// Commands to hand to the network layer for one drain cycle, FIFO,
    /// skipping anything already in flight along with later commands for
    /// the same order.
    pub fn drain_plan(&self, in_flight: &HashSet<CommandId>) -> Vec<Command> {
        let mut blocked: HashSet<OrderId> = HashSet::new();
        let mut plan = Vec::new();
        for entry in &self.entries {
            let order_id = entry.command.order_id();
            if in_flight.contains(&entry.command.id) {
                blocked.insert(order_id);
                continue;
            }
            if !blocked.contains(&order_id) {
                plan.push(entry.command.clone());
            }
        }
        plan
    }
}

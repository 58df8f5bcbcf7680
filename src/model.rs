//! Fuel order domain types.
//!
//! Orders arrive from the server of record (bulk load or push channel) and are
//! patched locally by operator commands before the server confirms them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type OrderId = i64;
pub type UserId = i64;

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OrderStatus {
    Dispatched,
    Acknowledged,
    EnRoute,
    Fueling,
    Completed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Dispatched => "Dispatched",
            OrderStatus::Acknowledged => "Acknowledged",
            OrderStatus::EnRoute => "EnRoute",
            OrderStatus::Fueling => "Fueling",
            OrderStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    /// Accepts the server's spellings: `EnRoute`, `EN_ROUTE`, `en route`, `en-route`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "dispatched" => Ok(OrderStatus::Dispatched),
            "acknowledged" => Ok(OrderStatus::Acknowledged),
            "enroute" => Ok(OrderStatus::EnRoute),
            "fueling" => Ok(OrderStatus::Fueling),
            "completed" => Ok(OrderStatus::Completed),
            _ => Err(format!("unknown order status: {raw}")),
        }
    }
}

impl Serialize for OrderStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OrderStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// One fuel delivery task as the server of record describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub status: OrderStatus,
    #[serde(default, alias = "assignee_id", alias = "assignedUserId")]
    pub assignee_id: Option<UserId>,
    #[serde(default, alias = "change_version")]
    pub change_version: u64,
    #[serde(default, alias = "acknowledged_change_version")]
    pub acknowledged_change_version: Option<u64>,
    #[serde(default, alias = "tail_number")]
    pub tail_number: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "gallons_requested")]
    pub gallons_requested: Option<f64>,
    #[serde(default, alias = "gallons_delivered")]
    pub gallons_delivered: Option<f64>,
    #[serde(default, alias = "start_meter_reading")]
    pub start_meter_reading: Option<f64>,
    #[serde(default, alias = "end_meter_reading")]
    pub end_meter_reading: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "completed_at")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    /// A bare order as the bulk load would deliver it before any assignment.
    pub fn new(id: OrderId, status: OrderStatus) -> Self {
        Self {
            id,
            status,
            assignee_id: None,
            change_version: 0,
            acknowledged_change_version: None,
            tail_number: None,
            location: None,
            gallons_requested: None,
            gallons_delivered: None,
            start_meter_reading: None,
            end_meter_reading: None,
            notes: None,
            completed_at: None,
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.assignee_id.is_none()
    }
}

/// Meter readings and notes submitted when an operator completes an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionData {
    pub start_meter_reading: f64,
    pub end_meter_reading: f64,
    pub gallons_delivered: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

/// The four operator-facing buckets. Membership is derived from `status` and
/// `assignee_id` relative to the current operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Partition {
    Unclaimed,
    MineQueued,
    InProgress,
    Completed,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::Unclaimed,
        Partition::MineQueued,
        Partition::InProgress,
        Partition::Completed,
    ];

    /// `None` means the order is not shown: it belongs to another operator,
    /// or it left `Dispatched` without an assignee.
    pub fn of(order: &Order, self_id: UserId) -> Option<Partition> {
        if order.status == OrderStatus::Completed {
            return Some(Partition::Completed);
        }
        match order.assignee_id {
            None if order.status == OrderStatus::Dispatched => Some(Partition::Unclaimed),
            None => None,
            Some(assignee) if assignee == self_id => match order.status {
                OrderStatus::Dispatched | OrderStatus::Acknowledged => Some(Partition::MineQueued),
                OrderStatus::EnRoute | OrderStatus::Fueling => Some(Partition::InProgress),
                OrderStatus::Completed => Some(Partition::Completed),
            },
            Some(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Locally generated command id. UUIDv7 gives the time-then-random layout, so
/// ids sort by creation time and are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CommandId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    ClaimOrder,
    UpdateStatus,
    AcknowledgeChange,
    CompleteOrder,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::ClaimOrder => "ClaimOrder",
            CommandKind::UpdateStatus => "UpdateStatus",
            CommandKind::AcknowledgeChange => "AcknowledgeChange",
            CommandKind::CompleteOrder => "CompleteOrder",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum CommandPayload {
    ClaimOrder {
        order_id: OrderId,
    },
    UpdateStatus {
        order_id: OrderId,
        status: OrderStatus,
    },
    AcknowledgeChange {
        order_id: OrderId,
        change_version: u64,
    },
    CompleteOrder {
        order_id: OrderId,
        completion: CompletionData,
    },
}

impl CommandPayload {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::ClaimOrder { .. } => CommandKind::ClaimOrder,
            CommandPayload::UpdateStatus { .. } => CommandKind::UpdateStatus,
            CommandPayload::AcknowledgeChange { .. } => CommandKind::AcknowledgeChange,
            CommandPayload::CompleteOrder { .. } => CommandKind::CompleteOrder,
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            CommandPayload::ClaimOrder { order_id }
            | CommandPayload::UpdateStatus { order_id, .. }
            | CommandPayload::AcknowledgeChange { order_id, .. }
            | CommandPayload::CompleteOrder { order_id, .. } => *order_id,
        }
    }

    /// The order as the operator should see it once this intent lands.
    pub fn optimistic_patch(&self, order: &Order, self_id: UserId) -> Order {
        let mut patched = order.clone();
        match self {
            CommandPayload::ClaimOrder { .. } => {
                patched.status = OrderStatus::Acknowledged;
                patched.assignee_id = Some(self_id);
            }
            CommandPayload::UpdateStatus { status, .. } => {
                patched.status = *status;
            }
            CommandPayload::AcknowledgeChange { change_version, .. } => {
                patched.acknowledged_change_version = Some(*change_version);
            }
            CommandPayload::CompleteOrder { completion, .. } => {
                patched.status = OrderStatus::Completed;
                patched.start_meter_reading = Some(completion.start_meter_reading);
                patched.end_meter_reading = Some(completion.end_meter_reading);
                patched.gallons_delivered = Some(completion.gallons_delivered);
                if completion.notes.is_some() {
                    patched.notes = completion.notes.clone();
                }
            }
        }
        patched
    }
}

/// A pending mutation intent. Only `retry_count` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub payload: CommandPayload,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl Command {
    pub fn new(payload: CommandPayload) -> Self {
        Self {
            id: CommandId::generate(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    pub fn order_id(&self) -> OrderId {
        self.payload.order_id()
    }
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

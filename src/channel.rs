//! Server push channel.
//!
//! The engine only needs three things from the transport: connect with a
//! bearer credential, receive the next message, close. [`decode_push`] turns
//! an inbound message into the matching store event.
//!
//! [`TcpPushChannel`] speaks newline-delimited JSON: the client writes
//! `{"type":"auth","token":"..."}` after connecting and then reads one
//! `{"event": "...", "data": ...}` object per line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::model::{Order, OrderId, UserId};
use crate::store::StoreEvent;

pub const EVENT_NEW_UNCLAIMED_ORDER: &str = "new_unclaimed_order";
pub const EVENT_ORDER_CLAIMED: &str = "order_claimed";
pub const EVENT_ORDER_UPDATE: &str = "order_update";
pub const EVENT_ORDER_COMPLETED: &str = "order_completed";
pub const EVENT_ORDER_DETAILS_UPDATED: &str = "order_details_updated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl PushEnvelope {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

#[async_trait]
pub trait PushChannel: Send + 'static {
    async fn connect(&mut self, token: &str) -> Result<(), ChannelError>;

    /// Next inbound message. An error means the connection is gone.
    async fn recv(&mut self) -> Result<PushEnvelope, ChannelError>;

    async fn close(&mut self);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderClaimedPayload {
    #[serde(alias = "order_id")]
    order_id: OrderId,
    #[serde(alias = "user_id", alias = "byUserId")]
    user_id: UserId,
}

fn decode_order(envelope: &PushEnvelope) -> Result<Order, ChannelError> {
    serde_json::from_value(envelope.data.clone())
        .map_err(|e| ChannelError::Protocol(format!("{}: {e}", envelope.event)))
}

/// Translate a push message into a store event. Unknown event names decode
/// to `None`.
pub fn decode_push(envelope: &PushEnvelope) -> Result<Option<StoreEvent>, ChannelError> {
    let event = match envelope.event.as_str() {
        EVENT_NEW_UNCLAIMED_ORDER => StoreEvent::NewOrderPushed(decode_order(envelope)?),
        EVENT_ORDER_CLAIMED => {
            let payload: OrderClaimedPayload = serde_json::from_value(envelope.data.clone())
                .map_err(|e| ChannelError::Protocol(format!("{}: {e}", envelope.event)))?;
            StoreEvent::OrderClaimed {
                order_id: payload.order_id,
                by_user_id: payload.user_id,
            }
        }
        EVENT_ORDER_UPDATE => StoreEvent::OrderUpdated(decode_order(envelope)?),
        EVENT_ORDER_COMPLETED => StoreEvent::OrderCompleted(decode_order(envelope)?),
        EVENT_ORDER_DETAILS_UPDATED => StoreEvent::OrderDetailsUpdated(decode_order(envelope)?),
        _ => return Ok(None),
    };
    Ok(Some(event))
}

// ---------------------------------------------------------------------------
// NDJSON over TCP
// ---------------------------------------------------------------------------

pub struct TcpPushChannel {
    addr: String,
    connect_timeout: Duration,
    lines: Option<Lines<BufReader<TcpStream>>>,
}

impl TcpPushChannel {
    pub fn new(addr: &str, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.to_string(),
            connect_timeout,
            lines: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lines.is_some()
    }
}

#[async_trait]
impl PushChannel for TcpPushChannel {
    async fn connect(&mut self, token: &str) -> Result<(), ChannelError> {
        self.lines = None;
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ChannelError::Timeout {
                addr: self.addr.clone(),
            })?
            .map_err(|e| ChannelError::Connect {
                addr: self.addr.clone(),
                message: e.to_string(),
            })?;

        let mut hello = serde_json::to_string(&serde_json::json!({ "type": "auth", "token": token }))
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        hello.push('\n');
        stream.write_all(hello.as_bytes()).await?;
        stream.flush().await?;

        info!(addr = %self.addr, "push channel connected");
        self.lines = Some(BufReader::new(stream).lines());
        Ok(())
    }

    async fn recv(&mut self) -> Result<PushEnvelope, ChannelError> {
        loop {
            let lines = self.lines.as_mut().ok_or(ChannelError::Closed)?;
            let next = lines.next_line().await;
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.lines = None;
                    return Err(ChannelError::Closed);
                }
                Err(e) => {
                    self.lines = None;
                    return Err(ChannelError::Io(e));
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<PushEnvelope>(trimmed) {
                Ok(envelope) => return Ok(envelope),
                Err(e) => {
                    warn!(error = %e, "skipping malformed push line");
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut lines) = self.lines.take() {
            let stream = lines.get_mut().get_mut();
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "push channel shutdown failed");
            }
            info!(addr = %self.addr, "push channel closed");
        }
    }
}

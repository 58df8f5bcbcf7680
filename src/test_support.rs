//! Fixtures and scripted collaborators shared by the unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::api::OrderApi;
use crate::channel::{PushChannel, PushEnvelope};
use crate::error::{ApiError, ChannelError};
use crate::model::{Command, CommandId, Order, OrderId, OrderStatus, UserId};

pub fn order(id: OrderId, status: OrderStatus) -> Order {
    let mut order = Order::new(id, status);
    order.tail_number = Some(format!("N{id}FS"));
    order.location = Some("Ramp 2".to_string());
    order.gallons_requested = Some(250.0);
    order
}

pub fn assigned_order(id: OrderId, status: OrderStatus, assignee: UserId) -> Order {
    let mut order = order(id, status);
    order.assignee_id = Some(assignee);
    order
}

// ---------------------------------------------------------------------------
// Request layer
// ---------------------------------------------------------------------------

/// Serves a fixed order collection and pops scripted execute responses
/// (`Ok(None)` once the script runs out).
#[derive(Default)]
pub struct MockOrderApi {
    orders: Mutex<Vec<Order>>,
    responses: Mutex<VecDeque<Result<Option<Order>, ApiError>>>,
    executed: Mutex<Vec<Command>>,
    fetches: Mutex<usize>,
}

impl MockOrderApi {
    pub fn with_orders(orders: Vec<Order>) -> Self {
        Self {
            orders: Mutex::new(orders),
            ..Self::default()
        }
    }

    pub fn set_orders(&self, orders: Vec<Order>) {
        *self.orders.lock().unwrap() = orders;
    }

    pub fn push_response(&self, response: Result<Option<Order>, ApiError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn executed(&self) -> Vec<Command> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_ids(&self) -> Vec<CommandId> {
        self.executed().into_iter().map(|c| c.id).collect()
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl OrderApi for MockOrderApi {
    async fn fetch_orders(&self) -> Result<Vec<Order>, ApiError> {
        *self.fetches.lock().unwrap() += 1;
        Ok(self.orders.lock().unwrap().clone())
    }

    async fn execute(&self, command: &Command) -> Result<Option<Order>, ApiError> {
        self.executed.lock().unwrap().push(command.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None))
    }
}

// ---------------------------------------------------------------------------
// Push channel
// ---------------------------------------------------------------------------

/// In-memory push channel driven from the test through a [`ChannelScript`].
pub struct ScriptedChannel {
    inbox: mpsc::UnboundedReceiver<Result<PushEnvelope, ChannelError>>,
    connect_failures: Arc<Mutex<VecDeque<String>>>,
    tokens: Arc<Mutex<Vec<String>>>,
    connected: bool,
}

#[derive(Clone)]
pub struct ChannelScript {
    outbox: mpsc::UnboundedSender<Result<PushEnvelope, ChannelError>>,
    connect_failures: Arc<Mutex<VecDeque<String>>>,
    tokens: Arc<Mutex<Vec<String>>>,
}

impl ScriptedChannel {
    pub fn new() -> (Self, ChannelScript) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let connect_failures = Arc::new(Mutex::new(VecDeque::new()));
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let channel = Self {
            inbox,
            connect_failures: Arc::clone(&connect_failures),
            tokens: Arc::clone(&tokens),
            connected: false,
        };
        let script = ChannelScript {
            outbox,
            connect_failures,
            tokens,
        };
        (channel, script)
    }
}

impl ChannelScript {
    pub fn push(&self, envelope: PushEnvelope) {
        let _ = self.outbox.send(Ok(envelope));
    }

    /// The next `recv` reports the connection as lost.
    pub fn drop_connection(&self) {
        let _ = self.outbox.send(Err(ChannelError::Closed));
    }

    /// The next connect attempt fails with `message`.
    pub fn fail_next_connect(&self, message: &str) {
        self.connect_failures
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    /// Tokens presented on every successful connect, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushChannel for ScriptedChannel {
    async fn connect(&mut self, token: &str) -> Result<(), ChannelError> {
        let failure = self.connect_failures.lock().unwrap().pop_front();
        if let Some(message) = failure {
            self.connected = false;
            return Err(ChannelError::Connect {
                addr: "scripted".into(),
                message,
            });
        }
        self.tokens.lock().unwrap().push(token.to_string());
        self.connected = true;
        Ok(())
    }

    async fn recv(&mut self) -> Result<PushEnvelope, ChannelError> {
        if !self.connected {
            return Err(ChannelError::Closed);
        }
        match self.inbox.recv().await {
            Some(Ok(envelope)) => Ok(envelope),
            Some(Err(e)) => {
                self.connected = false;
                Err(e)
            }
            // Script dropped: stay connected and silent.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.connected = false;
    }
}

//! Push-channel health as the operator sees it.
//!
//! Mirrors the channel lifecycle (`connect`, `disconnect`, `connect_error`,
//! `reconnect`, `reconnect_failed`) into a [`ConnectionStatus`] and projects
//! it together with the pending queue depth into a banner.

use serde::Serialize;

use crate::model::ConnectionStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLifecycle {
    Connect,
    Disconnect,
    ConnectError(String),
    ReconnectAttempt(u32),
    Reconnect,
    ReconnectFailed,
}

/// What the connection banner shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionBanner {
    pub status: ConnectionStatus,
    pub queued_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectionBanner {
    pub fn label(&self) -> String {
        match (self.status, self.queued_count) {
            (ConnectionStatus::Connected, 0) => "Connected".to_string(),
            (ConnectionStatus::Connected, n) => format!("Connected - syncing {n} queued"),
            (ConnectionStatus::Reconnecting, n) => match self.reconnect_attempt {
                Some(attempt) => format!("Reconnecting (attempt {attempt}) - {n} queued"),
                None => format!("Reconnecting - {n} queued"),
            },
            (ConnectionStatus::Disconnected, n) => format!("Offline - {n} queued"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMonitor {
    status: ConnectionStatus,
    reconnect_attempt: u32,
    last_error: Option<String>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Record a lifecycle event. Returns the new status when it changed.
    pub fn observe(&mut self, event: &ChannelLifecycle) -> Option<ConnectionStatus> {
        let previous = self.status;
        match event {
            ChannelLifecycle::Connect | ChannelLifecycle::Reconnect => {
                self.status = ConnectionStatus::Connected;
                self.reconnect_attempt = 0;
                self.last_error = None;
            }
            ChannelLifecycle::Disconnect => {
                self.status = ConnectionStatus::Disconnected;
            }
            ChannelLifecycle::ConnectError(message) => {
                self.status = ConnectionStatus::Reconnecting;
                if !message.is_empty() {
                    self.last_error = Some(message.clone());
                }
            }
            ChannelLifecycle::ReconnectAttempt(attempt) => {
                self.status = ConnectionStatus::Reconnecting;
                self.reconnect_attempt = *attempt;
            }
            ChannelLifecycle::ReconnectFailed => {
                self.status = ConnectionStatus::Disconnected;
            }
        }
        (self.status != previous).then_some(self.status)
    }

    pub fn banner(&self, queued_count: usize) -> ConnectionBanner {
        ConnectionBanner {
            status: self.status,
            queued_count,
            reconnect_attempt: (self.status == ConnectionStatus::Reconnecting
                && self.reconnect_attempt > 0)
                .then_some(self.reconnect_attempt),
            last_error: (!self.status.is_connected())
                .then(|| self.last_error.clone())
                .flatten(),
        }
    }
}

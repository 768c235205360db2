//! Connection state tracking for broker clients.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::model::{ResultEntry, ResultLevel};

/// Lifecycle of a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Initialising,
    Initialized,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Stopping,
    Stopped,
}

impl ConnectorState {
    /// Whether a client in this state should keep polling.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Whether the connector has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        !matches!(self, Self::Idle | Self::Failed | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Initialising => "INITIALISING",
            Self::Initialized => "INITIALIZED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a connector's state and last result.
#[derive(Debug, Clone)]
pub struct ConnectorProgress {
    pub name: String,
    pub state: ConnectorState,
    pub result: ResultEntry,
    pub since: DateTime<Utc>,
}

impl fmt::Display for ConnectorProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} since {} ({})",
            self.name,
            self.state,
            self.since.format("%H:%M:%S"),
            self.result
        )
    }
}

/// Shared progress of one connector, readable from status reports.
#[derive(Debug, Clone)]
pub struct SharedProgress(Arc<Mutex<ConnectorProgress>>);

impl SharedProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(ConnectorProgress {
            name: name.into(),
            state: ConnectorState::Idle,
            result: ResultEntry::ok(),
            since: Utc::now(),
        })))
    }

    fn with<R>(&self, f: impl FnOnce(&mut ConnectorProgress) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn state(&self) -> ConnectorState {
        self.with(|p| p.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn snapshot(&self) -> ConnectorProgress {
        self.with(|p| p.clone())
    }

    /// Moves to `state` with an OK result.
    pub fn set_progress(&self, state: ConnectorState) {
        self.set_progress_with(state, ResultEntry::ok());
    }

    /// Moves to `state` with `result`, logging real transitions.
    pub fn set_progress_with(&self, state: ConnectorState, result: ResultEntry) {
        let (name, previous) = self.with(|p| {
            let previous = p.state;
            if previous != state {
                p.since = Utc::now();
            }
            p.state = state;
            p.result = result.clone();
            (p.name.clone(), previous)
        });
        if previous == state {
            return;
        }
        match result.level {
            ResultLevel::Ok => info!(
                connector = %name,
                from = %previous,
                to = %state,
                "Connector state changed"
            ),
            _ => warn!(
                connector = %name,
                from = %previous,
                to = %state,
                result = %result,
                "Connector state changed"
            ),
        }
    }
}

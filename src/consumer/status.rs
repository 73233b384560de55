//! Consumer status tracking, for observability only.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::broker::BrokerMessageIdentifier;

/// Status changes kept in the history.
const MAX_HISTORY: usize = 10;

/// Coarse consumer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Disconnected,
    Connected,
    Consuming,
}

impl fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connected => f.write_str("connected"),
            Self::Consuming => f.write_str("consuming"),
        }
    }
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ConsumerStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct StatusState {
    status: ConsumerStatus,
    history: VecDeque<StatusChange>,
    last_consumed_identifier: Option<BrokerMessageIdentifier>,
    last_consumed_at: Option<DateTime<Utc>>,
    consumed_messages_count: u64,
}

/// Status, recent transitions and last consumed message of a consumer.
#[derive(Debug)]
pub struct ConsumerStatusInfo {
    state: Mutex<StatusState>,
}

impl Default for ConsumerStatusInfo {
    fn default() -> Self {
        Self {
            state: Mutex::new(StatusState {
                status: ConsumerStatus::Disconnected,
                history: VecDeque::new(),
                last_consumed_identifier: None,
                last_consumed_at: None,
                consumed_messages_count: 0,
            }),
        }
    }
}

impl ConsumerStatusInfo {
    fn state(&self) -> MutexGuard<'_, StatusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ConsumerStatus {
        self.state().status
    }

    /// Most recent changes, oldest first.
    pub fn history(&self) -> Vec<StatusChange> {
        self.state().history.iter().cloned().collect()
    }

    pub fn last_consumed_identifier(&self) -> Option<BrokerMessageIdentifier> {
        self.state().last_consumed_identifier.clone()
    }

    pub fn last_consumed_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_consumed_at
    }

    pub fn consumed_messages_count(&self) -> u64 {
        self.state().consumed_messages_count
    }

    pub(crate) fn set_connected(&self) {
        self.change(ConsumerStatus::Connected);
    }

    pub(crate) fn set_consuming(&self) {
        self.change(ConsumerStatus::Consuming);
    }

    pub(crate) fn set_disconnected(&self) {
        self.change(ConsumerStatus::Disconnected);
    }

    pub(crate) fn record_consumed(&self, identifier: &BrokerMessageIdentifier) {
        let mut state = self.state();
        state.last_consumed_identifier = Some(identifier.clone());
        state.last_consumed_at = Some(Utc::now());
        state.consumed_messages_count += 1;
    }

    fn change(&self, status: ConsumerStatus) {
        let mut state = self.state();
        if state.status == status {
            return;
        }
        state.status = status;
        if state.history.len() == MAX_HISTORY {
            state.history.pop_front();
        }
        state.history.push_back(StatusChange {
            status,
            timestamp: Utc::now(),
        });
    }
}

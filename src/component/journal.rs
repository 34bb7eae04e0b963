//! Per-component journal of state mutations awaiting cloud upload.

use std::collections::VecDeque;
use std::time::SystemTime;

use serde_json::{Map, Value};

/// Bound on buffered changes per component; oldest entries drop first.
pub const MAX_STATE_CHANGES: usize = 100;

#[derive(Debug, Clone)]
pub struct StateChange {
    pub timestamp: SystemTime,
    pub changed_properties: Map<String, Value>,
}

/// A recorded change tagged with its component path.
#[derive(Debug, Clone)]
pub struct ComponentStateChange {
    pub timestamp: SystemTime,
    pub component: String,
    pub changed_properties: Map<String, Value>,
}

/// Everything recorded since the last drain, plus the id to acknowledge
/// once the server has the batch.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub update_id: u64,
    pub state_changes: Vec<ComponentStateChange>,
}

#[derive(Default)]
pub(crate) struct StateChangeQueue {
    entries: VecDeque<StateChange>,
}

impl StateChangeQueue {
    pub(crate) fn record(&mut self, timestamp: SystemTime, changed_properties: Map<String, Value>) {
        self.entries.push_back(StateChange {
            timestamp,
            changed_properties,
        });
        while self.entries.len() > MAX_STATE_CHANGES {
            self.entries.pop_front();
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<StateChange> {
        self.entries.drain(..).collect()
    }
}

//! Data model collaborator: where attribute values, events and command handlers live.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::codec::Value;
use crate::report::{ConcreteAttributePath, ConcreteCommandPath, ConcreteEventPath, EventPriority, EventValue};
use crate::status::StatusCode;

const MAX_STORED_EVENTS: usize = 1024;

/// Change notice consumed by the subscription manager.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Attribute { path: ConcreteAttributePath, version: u32 },
    Event { path: ConcreteEventPath, number: u64 },
}

/// Access to the node's application data.
///
/// Existence and writability against the schema are checked by the engine before any
/// call reaches the data model.
pub trait DataModel: Send {
    /// Current value and data version.
    fn read(&self, path: &ConcreteAttributePath) -> Result<(Value, u32), StatusCode>;

    /// Checks a write could be applied, without applying it.
    fn check_write(&self, path: &ConcreteAttributePath, expected_version: Option<u32>) -> Result<(), StatusCode>;

    /// Applies a write and returns the new data version.
    fn write(
        &mut self,
        path: &ConcreteAttributePath,
        value: Value,
        expected_version: Option<u32>,
    ) -> Result<u32, StatusCode>;

    /// Runs a command; `Ok(None)` means success without response payload.
    fn invoke(&mut self, path: &ConcreteCommandPath, payload: &Value) -> Result<Option<Value>, StatusCode>;

    /// Stored events of one path with a number >= `min_number`, ascending.
    fn read_events(&self, path: &ConcreteEventPath, min_number: u64) -> Vec<EventValue>;

    /// Changes since the last call.
    fn take_changes(&mut self) -> Vec<Change>;
}

/// Attribute values with their data versions, plus the pending change feed.
#[derive(Default)]
pub struct AttributeStore {
    values: BTreeMap<ConcreteAttributePath, (Value, u32)>,
    changes: Vec<Change>,
}

impl AttributeStore {
    pub fn get(&self, path: &ConcreteAttributePath) -> Option<&(Value, u32)> {
        self.values.get(path)
    }

    /// Local update: bumps the version and records a change.
    pub fn set(&mut self, path: ConcreteAttributePath, value: Value) -> u32 {
        let version = match self.values.get_mut(&path) {
            Some(entry) => {
                entry.0 = value;
                // data versions wrap at u32::MAX; comparisons are equality only
                entry.1 = entry.1.wrapping_add(1);
                entry.1
            }
            None => {
                self.values.insert(path, (value, 1));
                1
            }
        };
        self.changes.push(Change::Attribute { path, version });
        version
    }
}

pub type CommandHandler =
    Box<dyn FnMut(&Value, &mut AttributeStore) -> Result<Option<Value>, StatusCode> + Send>;

/// Data model kept in memory.
#[derive(Default)]
pub struct InMemoryDataModel {
    store: AttributeStore,
    events: VecDeque<EventValue>,
    next_event_number: u64,
    handlers: HashMap<ConcreteCommandPath, CommandHandler>,
}

impl InMemoryDataModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an attribute without recording a change.
    pub fn insert(&mut self, path: ConcreteAttributePath, value: Value, version: u32) {
        self.store.values.insert(path, (value, version));
    }

    pub fn set_attribute(&mut self, path: ConcreteAttributePath, value: Value) -> u32 {
        self.store.set(path, value)
    }

    pub fn attribute(&self, path: &ConcreteAttributePath) -> Option<&(Value, u32)> {
        self.store.get(path)
    }

    pub fn on_command<F>(&mut self, path: ConcreteCommandPath, handler: F)
    where
        F: FnMut(&Value, &mut AttributeStore) -> Result<Option<Value>, StatusCode> + Send + 'static,
    {
        self.handlers.insert(path, Box::new(handler));
    }

    /// Records an event and returns its number.
    pub fn emit_event(&mut self, path: ConcreteEventPath, priority: EventPriority, value: Value) -> u64 {
        let number = self.next_event_number;
        self.next_event_number += 1;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.events.push_back(EventValue {
            path,
            number,
            priority,
            timestamp,
            value,
        });
        if self.events.len() > MAX_STORED_EVENTS {
            self.events.pop_front();
        }
        self.store.changes.push(Change::Event { path, number });
        number
    }
}

impl DataModel for InMemoryDataModel {
    fn read(&self, path: &ConcreteAttributePath) -> Result<(Value, u32), StatusCode> {
        self.store.get(path).cloned().ok_or(StatusCode::UnsupportedRead)
    }

    fn check_write(&self, path: &ConcreteAttributePath, expected_version: Option<u32>) -> Result<(), StatusCode> {
        match (self.store.get(path), expected_version) {
            (Some((_, live)), Some(expected)) if *live != expected => Err(StatusCode::DataVersionMismatch),
            (None, Some(_)) => Err(StatusCode::DataVersionMismatch),
            _ => Ok(()),
        }
    }

    fn write(
        &mut self,
        path: &ConcreteAttributePath,
        value: Value,
        expected_version: Option<u32>,
    ) -> Result<u32, StatusCode> {
        self.check_write(path, expected_version)?;
        Ok(self.store.set(*path, value))
    }

    fn invoke(&mut self, path: &ConcreteCommandPath, payload: &Value) -> Result<Option<Value>, StatusCode> {
        let handler = self.handlers.get_mut(path).ok_or(StatusCode::UnsupportedCommand)?;
        handler(payload, &mut self.store)
    }

    fn read_events(&self, path: &ConcreteEventPath, min_number: u64) -> Vec<EventValue> {
        self.events
            .iter()
            .filter(|e| e.number >= min_number)
            .filter(|e| {
                e.path.endpoint_id == path.endpoint_id
                    && e.path.cluster_id == path.cluster_id
                    && e.path.event_id == path.event_id
            })
            .cloned()
            .collect()
    }

    fn take_changes(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.store.changes)
    }
}

//! Paths, path filters and the report variants delivered to readers and subscribers.

use crate::codec::Value;
use crate::status::StatusCode;

/// Fully specified attribute path. Ordering is endpoint, cluster, attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConcreteAttributePath {
    pub endpoint_id: u16,
    pub cluster_id: u32,
    pub attribute_id: u32,
    pub node_id: Option<u64>,
}

impl ConcreteAttributePath {
    pub fn new(endpoint_id: u16, cluster_id: u32, attribute_id: u32) -> Self {
        Self {
            endpoint_id,
            cluster_id,
            attribute_id,
            node_id: None,
        }
    }
}

impl std::fmt::Display for ConcreteAttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/0x{:x}/0x{:x}", self.endpoint_id, self.cluster_id, self.attribute_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConcreteEventPath {
    pub endpoint_id: u16,
    pub cluster_id: u32,
    pub event_id: u32,
    pub node_id: Option<u64>,
}

impl ConcreteEventPath {
    pub fn new(endpoint_id: u16, cluster_id: u32, event_id: u32) -> Self {
        Self {
            endpoint_id,
            cluster_id,
            event_id,
            node_id: None,
        }
    }
}

impl std::fmt::Display for ConcreteEventPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/0x{:x}/e0x{:x}", self.endpoint_id, self.cluster_id, self.event_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConcreteCommandPath {
    pub endpoint_id: u16,
    pub cluster_id: u32,
    pub command_id: u32,
}

impl ConcreteCommandPath {
    pub fn new(endpoint_id: u16, cluster_id: u32, command_id: u32) -> Self {
        Self {
            endpoint_id,
            cluster_id,
            command_id,
        }
    }
}

/// Attribute path where any component left as None is a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributePathFilter {
    pub node_id: Option<u64>,
    pub endpoint_id: Option<u16>,
    pub cluster_id: Option<u32>,
    pub attribute_id: Option<u32>,
}

impl AttributePathFilter {
    pub fn wildcard() -> Self {
        Self::default()
    }
    pub fn concrete(endpoint: u16, cluster: u32, attribute: u32) -> Self {
        Self {
            node_id: None,
            endpoint_id: Some(endpoint),
            cluster_id: Some(cluster),
            attribute_id: Some(attribute),
        }
    }
    pub fn endpoint(mut self, endpoint: u16) -> Self {
        self.endpoint_id = Some(endpoint);
        self
    }
    pub fn cluster(mut self, cluster: u32) -> Self {
        self.cluster_id = Some(cluster);
        self
    }
    pub fn attribute(mut self, attribute: u32) -> Self {
        self.attribute_id = Some(attribute);
        self
    }
    pub fn as_concrete(&self) -> Option<ConcreteAttributePath> {
        Some(ConcreteAttributePath::new(self.endpoint_id?, self.cluster_id?, self.attribute_id?))
    }
    pub fn matches(&self, path: &ConcreteAttributePath) -> bool {
        self.endpoint_id.map_or(true, |e| e == path.endpoint_id)
            && self.cluster_id.map_or(true, |c| c == path.cluster_id)
            && self.attribute_id.map_or(true, |a| a == path.attribute_id)
    }
}

impl From<ConcreteAttributePath> for AttributePathFilter {
    fn from(p: ConcreteAttributePath) -> Self {
        Self {
            node_id: p.node_id,
            ..Self::concrete(p.endpoint_id, p.cluster_id, p.attribute_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventPathFilter {
    pub node_id: Option<u64>,
    pub endpoint_id: Option<u16>,
    pub cluster_id: Option<u32>,
    pub event_id: Option<u32>,
    pub is_urgent: bool,
}

impl EventPathFilter {
    pub fn wildcard() -> Self {
        Self::default()
    }
    pub fn concrete(endpoint: u16, cluster: u32, event: u32) -> Self {
        Self {
            endpoint_id: Some(endpoint),
            cluster_id: Some(cluster),
            event_id: Some(event),
            ..Self::default()
        }
    }
    pub fn endpoint(mut self, endpoint: u16) -> Self {
        self.endpoint_id = Some(endpoint);
        self
    }
    pub fn cluster(mut self, cluster: u32) -> Self {
        self.cluster_id = Some(cluster);
        self
    }
    pub fn as_concrete(&self) -> Option<ConcreteEventPath> {
        Some(ConcreteEventPath::new(self.endpoint_id?, self.cluster_id?, self.event_id?))
    }
    pub fn matches(&self, path: &ConcreteEventPath) -> bool {
        self.endpoint_id.map_or(true, |e| e == path.endpoint_id)
            && self.cluster_id.map_or(true, |c| c == path.cluster_id)
            && self.event_id.map_or(true, |a| a == path.event_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Debug = 0,
    Info = 1,
    Critical = 2,
}

impl From<u8> for EventPriority {
    fn from(value: u8) -> Self {
        match value {
            0 => EventPriority::Debug,
            1 => EventPriority::Info,
            _ => EventPriority::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeValue {
    pub path: ConcreteAttributePath,
    pub version: u32,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeStatus {
    pub path: ConcreteAttributePath,
    pub status: StatusCode,
    pub cluster_status: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventValue {
    pub path: ConcreteEventPath,
    pub number: u64,
    pub priority: EventPriority,
    /// Milliseconds since unix epoch.
    pub timestamp: u64,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventStatus {
    pub path: ConcreteEventPath,
    pub status: StatusCode,
    pub cluster_status: Option<u8>,
}

/// One entry of a read or subscription report.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    AttributeValue(AttributeValue),
    AttributeStatus(AttributeStatus),
    EventValue(EventValue),
    EventStatus(EventStatus),
}

impl Report {
    pub fn attribute_path(&self) -> Option<&ConcreteAttributePath> {
        match self {
            Report::AttributeValue(v) => Some(&v.path),
            Report::AttributeStatus(s) => Some(&s.path),
            _ => None,
        }
    }
    pub fn event_path(&self) -> Option<&ConcreteEventPath> {
        match self {
            Report::EventValue(v) => Some(&v.path),
            Report::EventStatus(s) => Some(&s.path),
            _ => None,
        }
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Report::AttributeValue(v) => write!(f, "{} v{} = {:?}", v.path, v.version, v.value),
            Report::AttributeStatus(s) => write!(f, "{} status {}", s.path, s.status),
            Report::EventValue(e) => write!(f, "{} #{} {:?} = {:?}", e.path, e.number, e.priority, e.value),
            Report::EventStatus(s) => write!(f, "{} status {}", s.path, s.status),
        }
    }
}

/// Reports carried by one ReportData message.
pub type Chunk = Vec<Report>;

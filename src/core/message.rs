//! Work item types: messages, priority bands and queued entries.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use crate::broker::DeliveryHandle;
use crate::error::{Error, Result};

/// Event type assumed when a delivery does not name one.
pub const DEFAULT_EVENT_TYPE: &str = "speech.created";

/// Priority bands, served strictly in rank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Every band, in dequeue order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Dequeue rank. Lower ranks are served first.
    pub fn rank(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// A unit of work received from the broker.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Unique ID (taken from the delivery, or a fresh ULID)
    pub id: String,

    /// Event type tag, e.g. "speech.created"
    pub event_type: String,

    /// Opaque payload (the delivery's `data` object)
    pub payload: Value,

    /// Broker-side timestamp, when present and parseable
    pub timestamp: Option<DateTime<Utc>>,

    /// Times this message has been retried
    pub retry_count: u32,

    /// Band assigned at enqueue time
    pub priority: Priority,

    /// Free-form metadata carried alongside the payload
    pub metadata: Map<String, Value>,

    /// Broker acknowledgement handle, when acks are deferred to completion
    #[serde(skip)]
    pub delivery: Option<DeliveryHandle>,
}

impl Message {
    /// Create a message with a fresh ID.
    pub fn new(event_type: &str, payload: Value) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            event_type: event_type.to_string(),
            payload,
            timestamp: Some(Utc::now()),
            retry_count: 0,
            priority: Priority::default(),
            metadata: Map::new(),
            delivery: None,
        }
    }

    /// Set the ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the retry count.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Parse a raw broker body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    /// Build a message from a decoded broker body.
    ///
    /// Field mapping follows the producer's wire format: `id` (or `uuid`),
    /// `event_type` (or `type`), `data`, `timestamp`, `retryCount` (or
    /// `retry_count`) and `metadata`. Missing optional fields get defaults.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut root) = value else {
            return Err(Error::Other("Message body must be a JSON object".to_string()));
        };

        let id = take_string(&mut root, &["id", "uuid"])
            .unwrap_or_else(|| ulid::Ulid::new().to_string());
        let event_type = take_string(&mut root, &["event_type", "type"])
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());
        let payload = root
            .remove("data")
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| Value::Object(Map::new()));
        let timestamp = root
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        let retry_count = ["retryCount", "retry_count"]
            .iter()
            .find_map(|key| root.get(*key).and_then(Value::as_u64))
            .map_or(0, |count| u32::try_from(count).unwrap_or(u32::MAX));
        let metadata = match root.remove("metadata") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Ok(Self {
            id,
            event_type,
            payload,
            timestamp,
            retry_count,
            priority: Priority::default(),
            metadata,
            delivery: None,
        })
    }

    /// Look up a payload value by JSON pointer (e.g. "/speechDto/original_text").
    pub fn payload_at(&self, pointer: &str) -> Option<&Value> {
        self.payload.pointer(pointer)
    }

    /// Look up a payload string by JSON pointer.
    pub fn payload_str(&self, pointer: &str) -> Option<&str> {
        self.payload_at(pointer).and_then(Value::as_str)
    }
}

fn take_string(root: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match root.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Producers sometimes omit the offset; those stamps are UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// A message while it sits in the queue.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub message: Message,

    /// Monotonic enqueue sequence, the FIFO tiebreak within a band
    pub sequence: u64,

    /// When the entry was enqueued
    pub enqueued_at: Instant,
}

impl QueuedEntry {
    pub fn priority(&self) -> Priority {
        self.message.priority
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use switchyard_core::RoutingKey;

/// Inbound message handed to the dispatcher by a transport.
///
/// The payload is JSON-encoded; handlers call [`decode`](Self::decode) to
/// get their typed message back. `correlation_id` ties the message to the
/// transport's request/response tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub routing_key: RoutingKey,

    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,

    /// JSON-encoded payload bytes.
    pub payload: Vec<u8>,

    pub correlation_id: Uuid,

    /// Label used in logs and per-caller statistics.
    #[serde(default = "default_caller")]
    pub caller: String,

    /// Soft timeout for the handler, in milliseconds.
    #[serde(default)]
    pub max_processing_ms: Option<u64>,

    /// Run the handler on a dedicated thread.
    #[serde(default)]
    pub long_running: bool,

    pub created_at: DateTime<Utc>,
}

fn default_caller() -> String {
    "anonymous".to_string()
}

impl Envelope {
    /// Create an envelope, serializing the payload as JSON.
    pub fn new<T: Serialize>(
        routing_key: RoutingKey,
        priority: i32,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Self::with_correlation(routing_key, priority, payload, Uuid::new_v4())
    }

    /// Create an envelope with an explicit correlation ID (for replies/continuations).
    pub fn with_correlation<T: Serialize>(
        routing_key: RoutingKey,
        priority: i32,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            routing_key,
            priority,
            payload: serde_json::to_vec(payload)?,
            correlation_id,
            caller: default_caller(),
            max_processing_ms: None,
            long_running: false,
            created_at: Utc::now(),
        })
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    pub fn max_processing_time(mut self, limit: Duration) -> Self {
        self.max_processing_ms = Some(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn long_running(mut self, long_running: bool) -> Self {
        self.long_running = long_running;
        self
    }

    pub fn processing_limit(&self) -> Option<Duration> {
        self.max_processing_ms.map(Duration::from_millis)
    }

    /// Deserialize the payload into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

//! Event payloads published by a shell session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Emission counter
// ---------------------------------------------------------------------------

static EMISSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Next process-wide emission sequence number.
pub fn next_emission_sequence() -> u64 {
    EMISSION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Fields shared by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub emission_sequence: u64,
}

impl EventMeta {
    pub fn new() -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            emission_sequence: next_emission_sequence(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Telemetry record of one wrapped API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub class: String,
    pub method: String,
    pub deprecated: bool,
    pub is_async: bool,
    /// Nesting depth of wrapped calls when this one started. Zero is top level.
    pub call_depth: usize,
}

impl ApiCallEvent {
    pub fn new(
        class: impl Into<String>,
        method: impl Into<String>,
        deprecated: bool,
        is_async: bool,
        call_depth: usize,
    ) -> Self {
        Self {
            meta: EventMeta::new(),
            class: class.into(),
            method: method.into(),
            deprecated,
            is_async,
            call_depth,
        }
    }
}

/// Everything a session publishes on its bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellEvent {
    ApiCall(ApiCallEvent),
    Warning {
        #[serde(flatten)]
        meta: EventMeta,
        message: String,
    },
    Interrupted {
        #[serde(flatten)]
        meta: EventMeta,
        class: String,
        method: String,
    },
    ErrorTransformed {
        #[serde(flatten)]
        meta: EventMeta,
        kind: crate::error::ErrorKind,
        message: String,
    },
}

impl ShellEvent {
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            meta: EventMeta::new(),
            message: message.into(),
        }
    }

    pub fn interrupted(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self::Interrupted {
            meta: EventMeta::new(),
            class: class.into(),
            method: method.into(),
        }
    }

    /// Event type discriminator.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ApiCall(_) => "api_call",
            Self::Warning { .. } => "warning",
            Self::Interrupted { .. } => "interrupted",
            Self::ErrorTransformed { .. } => "error_transformed",
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::ApiCall(e) => &e.meta,
            Self::Warning { meta, .. }
            | Self::Interrupted { meta, .. }
            | Self::ErrorTransformed { meta, .. } => meta,
        }
    }
}

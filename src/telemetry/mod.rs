//! Process-wide telemetry for wrapped API calls.
//!
//! Records per-method call counters. No arguments or documents are
//! collected, only class and method names. Per-call spans come from
//! `tracing` in the call wrapper.
//! Telemetry can be disabled with `SHELLCORE_TELEMETRY_OPT_OUT` or
//! `OTEL_SDK_DISABLED`.

use std::env;
use std::sync::OnceLock;

use dashmap::DashMap;

use crate::events::ApiCallEvent;

// ---------------------------------------------------------------------------
// Singleton
// ---------------------------------------------------------------------------

static INSTANCE: OnceLock<Telemetry> = OnceLock::new();

/// Get the global `Telemetry` singleton.
pub fn telemetry() -> &'static Telemetry {
    INSTANCE.get_or_init(Telemetry::new)
}

/// Whether telemetry is disabled by the environment.
///
/// Checks `SHELLCORE_TELEMETRY_OPT_OUT` and `OTEL_SDK_DISABLED`.
pub fn is_telemetry_disabled() -> bool {
    ["SHELLCORE_TELEMETRY_OPT_OUT", "OTEL_SDK_DISABLED"]
        .iter()
        .any(|name| {
            let value = env::var(name).unwrap_or_default().to_lowercase();
            value == "true" || value == "1"
        })
}

/// Install a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Counter store for API call telemetry.
#[derive(Debug)]
pub struct Telemetry {
    /// Whether the environment allowed telemetry at startup.
    pub ready: bool,
    calls: DashMap<String, u64>,
    deprecated_calls: DashMap<String, u64>,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            ready: !is_telemetry_disabled(),
            calls: DashMap::new(),
            deprecated_calls: DashMap::new(),
        }
    }

    /// Count one API call.
    pub fn record_api_call(&self, event: &ApiCallEvent) {
        if !self.ready {
            return;
        }
        let key = format!("{}.{}", event.class, event.method);
        if event.deprecated {
            *self.deprecated_calls.entry(key.clone()).or_insert(0) += 1;
        }
        *self.calls.entry(key).or_insert(0) += 1;
    }

    /// Number of recorded calls to `class.method`.
    pub fn call_count(&self, class: &str, method: &str) -> u64 {
        self.calls
            .get(&format!("{class}.{method}"))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Number of recorded calls to `class.method` flagged deprecated.
    pub fn deprecated_call_count(&self, class: &str, method: &str) -> u64 {
        self.deprecated_calls
            .get(&format!("{class}.{method}"))
            .map(|v| *v)
            .unwrap_or(0)
    }
}

//! Session context shared by every object of one execution context.
//!
//! Objects reach the session only through the narrow [`SessionContext`]
//! interface: the cancellation signal, the telemetry sink, the
//! error-transform hook, one-time warnings and the display batch size.
//! [`ShellSession`] is the concrete context and also owns the service
//! provider used to open cursors.

pub mod config;
pub mod interrupt;
pub mod plugins;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::RwLock;

use crate::error::ShellError;
use crate::events::{ApiCallEvent, EventBus, EventMeta, ShellEvent};
use crate::provider::ServiceProvider;
use crate::telemetry::telemetry;

pub use config::{ApiVersionInfo, SessionConfig};
pub use interrupt::InterruptFlag;
pub use plugins::{PluginError, PluginRegistry, ShellPlugin};

/// Shared handle to a session context.
pub type SessionRef = Arc<dyn SessionContext>;

/// Read interface through which wrapped calls reach their session.
pub trait SessionContext: Send + Sync {
    /// The per-session cancellation signal.
    fn interrupt_flag(&self) -> &InterruptFlag;

    /// Bound of one top-level cursor materialization.
    fn display_batch_size(&self) -> usize;

    /// Record a wrapped call. Must not block.
    fn emit_api_call(&self, event: ApiCallEvent);

    /// Publish any other session event. Must not block.
    fn emit_event(&self, event: ShellEvent);

    /// Route a failure through the session's transform hooks.
    fn transform_error(&self, err: ShellError) -> ShellError;

    /// Show `message` once per session.
    fn print_warning(&self, message: &str);

    /// Enter a wrapped call, returning the depth before entering.
    fn enter_call(&self) -> usize;

    /// Leave a wrapped call.
    fn exit_call(&self);
}

// ---------------------------------------------------------------------------
// ShellSession
// ---------------------------------------------------------------------------

/// The concrete session of one execution context.
pub struct ShellSession {
    config: SessionConfig,
    provider: Arc<dyn ServiceProvider>,
    interrupt: InterruptFlag,
    bus: EventBus,
    plugins: RwLock<PluginRegistry>,
    warnings_shown: DashSet<String>,
    call_depth: AtomicUsize,
}

impl ShellSession {
    pub fn new(provider: Arc<dyn ServiceProvider>, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            interrupt: InterruptFlag::new(),
            bus: EventBus::new(),
            plugins: RwLock::new(PluginRegistry::new()),
            warnings_shown: DashSet::new(),
            call_depth: AtomicUsize::new(0),
        })
    }

    /// Session with default configuration.
    pub fn with_provider(provider: Arc<dyn ServiceProvider>) -> Arc<Self> {
        Self::new(provider, SessionConfig::default())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn ServiceProvider> {
        &self.provider
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    pub fn register_plugin(&self, plugin: impl ShellPlugin) {
        self.plugins.write().register(plugin);
    }

    /// This session as the trait object handed to shell objects.
    pub fn context(self: &Arc<Self>) -> SessionRef {
        self.clone()
    }

    /// Current nesting depth of wrapped calls.
    pub fn call_depth(&self) -> usize {
        self.call_depth.load(Ordering::SeqCst)
    }
}

impl SessionContext for ShellSession {
    fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    fn display_batch_size(&self) -> usize {
        self.config.display_batch_size
    }

    fn emit_api_call(&self, event: ApiCallEvent) {
        if !self.config.telemetry_enabled {
            return;
        }
        telemetry().record_api_call(&event);
        self.plugins.read().invoke_on_api_call(&event);
        self.bus.emit(ShellEvent::ApiCall(event));
    }

    fn emit_event(&self, event: ShellEvent) {
        self.bus.emit(event);
    }

    fn transform_error(&self, err: ShellError) -> ShellError {
        let transformed = self.plugins.read().transform_error(err);
        self.bus.emit(ShellEvent::ErrorTransformed {
            meta: EventMeta::new(),
            kind: transformed.kind(),
            message: transformed.to_string(),
        });
        transformed
    }

    fn print_warning(&self, message: &str) {
        if !self.config.show_warnings {
            return;
        }
        if self.warnings_shown.insert(message.to_string()) {
            log::warn!("Warning: {}", message);
            self.bus.emit(ShellEvent::warning(message));
        }
    }

    fn enter_call(&self) -> usize {
        self.call_depth.fetch_add(1, Ordering::SeqCst)
    }

    fn exit_call(&self) {
        let _ = self
            .call_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
    }
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("config", &self.config)
            .field("interrupted", &self.interrupt.is_set())
            .field("call_depth", &self.call_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bus::drain;
    use crate::provider::memory::MemoryProvider;

    fn session() -> Arc<ShellSession> {
        ShellSession::with_provider(Arc::new(MemoryProvider::new()))
    }

    #[test]
    fn test_warning_printed_once() {
        let s = session();
        let mut rx = s.events().subscribe();
        s.print_warning("hasNext may block");
        s.print_warning("hasNext may block");
        s.print_warning("something else");
        let warnings = drain(&mut rx)
            .into_iter()
            .filter(|e| e.event_type() == "warning")
            .count();
        assert_eq!(warnings, 2);
    }

    #[test]
    fn test_api_calls_reach_bus() {
        let s = session();
        let mut rx = s.events().subscribe();
        s.emit_api_call(ApiCallEvent::new("Cursor", "limit", false, false, 0));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "api_call");
    }

    #[test]
    fn test_telemetry_disabled_suppresses_events() {
        let config = SessionConfig {
            telemetry_enabled: false,
            ..SessionConfig::default()
        };
        let s = ShellSession::new(Arc::new(MemoryProvider::new()), config);
        let mut rx = s.events().subscribe();
        s.emit_api_call(ApiCallEvent::new("Cursor", "limit", false, false, 0));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_call_depth_never_underflows() {
        let s = session();
        assert_eq!(s.enter_call(), 0);
        assert_eq!(s.enter_call(), 1);
        s.exit_call();
        s.exit_call();
        s.exit_call();
        assert_eq!(s.call_depth(), 0);
    }

    struct Tag;

    impl ShellPlugin for Tag {
        fn transform_error(&self, err: ShellError) -> ShellError {
            err.annotate("tagged")
        }
    }

    #[test]
    fn test_transform_uses_plugins() {
        let s = session();
        s.register_plugin(Tag);
        let err = s.transform_error(ShellError::resource("boom"));
        assert_eq!(err.to_string(), "boom (tagged)");
    }
}

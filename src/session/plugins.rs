//! Session plugins: error transformation and API-call observation.
//!
//! Plugins are invoked in registration order. Observer failures are logged
//! and never abort the call being observed.

use crate::error::ShellError;
use crate::events::ApiCallEvent;

/// Error returned by a plugin observer.
#[derive(Debug, Clone)]
pub struct PluginError {
    pub message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PluginError: {}", self.message)
    }
}

impl std::error::Error for PluginError {}

impl From<&str> for PluginError {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PluginError {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A session extension. All methods default to no-ops.
pub trait ShellPlugin: Send + Sync + 'static {
    /// Name used in log output.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Rewrite a failure before it reaches the caller, e.g. to attach context.
    fn transform_error(&self, err: ShellError) -> ShellError {
        err
    }

    /// Observe a wrapped API call.
    fn on_api_call(&self, _event: &ApiCallEvent) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Ordered collection of plugins.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn ShellPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: impl ShellPlugin) {
        self.plugins.push(Box::new(plugin));
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run `err` through every plugin's transform, in order.
    pub fn transform_error(&self, err: ShellError) -> ShellError {
        self.plugins
            .iter()
            .fold(err, |err, plugin| plugin.transform_error(err))
    }

    /// Notify every plugin of an API call.
    pub fn invoke_on_api_call(&self, event: &ApiCallEvent) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.on_api_call(event) {
                log::warn!("plugin {} on_api_call error: {}", plugin.name(), e);
            }
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

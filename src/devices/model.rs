//! Device model traits and the provider registry
//!
//! A device model is declared by a module file (see [`super::module`]) and
//! instantiated by the provider registered under the module's `kind`.

use super::module::ModelModule;
use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Channel a device reports its id on after its state may have changed
#[derive(Debug, Clone)]
pub struct ChangeListener {
    tx: mpsc::UnboundedSender<String>,
}

impl ChangeListener {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Report a change. Returns false once the receiving side is gone.
    pub fn notify(&self, device_id: &str) -> bool {
        self.tx.send(device_id.to_string()).is_ok()
    }
}

/// Listener list for device implementations
#[derive(Debug, Default)]
pub struct Listeners {
    inner: Mutex<Vec<ChangeListener>>,
}

impl Listeners {
    pub fn add(&self, listener: ChangeListener) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.push(listener);
        }
    }

    /// Notify every live listener, dropping closed ones
    pub fn notify(&self, device_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.retain(|l| l.notify(device_id));
        }
    }
}

/// A physical (or simulated) device exposed by a model
pub trait Device: Send + Sync {
    /// Stable identifier, unique within the model
    fn id(&self) -> &str;

    /// Device kind, e.g. `"actuator"`
    fn kind(&self) -> &str;

    /// Current state snapshot
    fn state(&self) -> Value;

    /// Apply a new state.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] when the value does not fit the
    /// device.
    fn set_state(&self, state: Value) -> CoreResult<()>;

    /// Subscribe to change events
    fn add_listener(&self, listener: ChangeListener);
}

/// A robot: a named set of devices
pub trait DeviceModel: Send + Sync {
    fn name(&self) -> &str;

    /// Devices in declaration order
    fn devices(&self) -> Vec<Arc<dyn Device>>;
}

/// Builds a model from a parsed module; the error text explains the rejection
pub type ModelProvider = fn(&ModelModule) -> Result<Box<dyn DeviceModel>, String>;

/// Build-time registry of model providers, keyed by `[model] kind`
#[derive(Default)]
pub struct ModelRegistry {
    providers: HashMap<String, ModelProvider>,
}

impl ModelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the providers compiled into this binary
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(super::sim::PROVIDER_KIND, super::sim::provide);
        registry
    }

    /// Register a provider. A provider already registered for `kind` is replaced.
    pub fn register(&mut self, kind: &str, provider: ModelProvider) {
        self.providers.insert(kind.to_string(), provider);
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.providers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Parse the module at `path` and instantiate the model it declares
    pub fn load_file(&self, path: &Path) -> CoreResult<Box<dyn DeviceModel>> {
        let not_found = |reason: String| {
            CoreError::DeviceDefinitionNotFound(format!("{}: {}", path.display(), reason))
        };

        let text = std::fs::read_to_string(path).map_err(|e| not_found(e.to_string()))?;
        let module = ModelModule::parse(&text).map_err(not_found)?;
        self.instantiate(&module).map_err(not_found)
    }

    /// Instantiate the single model a module declares
    pub fn instantiate(&self, module: &ModelModule) -> Result<Box<dyn DeviceModel>, String> {
        let section = module
            .model
            .as_ref()
            .ok_or_else(|| "no [model] table declared".to_string())?;

        let provider = self.providers.get(&section.kind).ok_or_else(|| {
            format!(
                "unknown model kind '{}' (available: {})",
                section.kind,
                self.kinds().join(", ")
            )
        })?;

        provider(module)
    }
}

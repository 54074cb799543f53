//! Device Synchronizer
//!
//! Holds the currently loaded device model, answers state queries, and
//! republishes device change events to a [`DeviceNotifier`] only when a
//! device's state actually differs from what subscribers last saw.

use super::model::{ChangeListener, Device, DeviceModel, ModelRegistry};
use crate::error::{CoreError, CoreResult};
use crate::events::DeviceNotifier;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Last published state per device id
#[derive(Debug, Default)]
struct StateCache {
    states: Mutex<HashMap<String, Value>>,
}

impl StateCache {
    /// Store `state` if it differs from the cached value. Returns whether it changed.
    fn compare_and_update(&self, id: &str, state: Value) -> bool {
        let Ok(mut states) = self.states.lock() else {
            return false;
        };
        if states.get(id) == Some(&state) {
            return false;
        }
        states.insert(id.to_string(), state);
        true
    }

    fn reset(&self, entries: impl IntoIterator<Item = (String, Value)>) {
        if let Ok(mut states) = self.states.lock() {
            states.clear();
            states.extend(entries);
        }
    }

    fn clear(&self) {
        self.reset(std::iter::empty());
    }

    #[cfg(test)]
    fn get(&self, id: &str) -> Option<Value> {
        self.states.lock().ok().and_then(|s| s.get(id).cloned())
    }
}

/// The model currently in use
struct LoadedModel {
    path: PathBuf,
    model: Box<dyn DeviceModel>,
    devices: Vec<Arc<dyn Device>>,
    listener: JoinHandle<()>,
}

impl LoadedModel {
    fn find(&self, id: &str) -> CoreResult<&Arc<dyn Device>> {
        self.devices
            .iter()
            .find(|d| d.id() == id)
            .ok_or_else(|| CoreError::DeviceNotFound {
                id: id.to_string(),
                known: self.ids(),
            })
    }

    fn ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.id().to_string()).collect()
    }
}

impl Drop for LoadedModel {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Hot-swappable device model with deduplicated change publishing
pub struct DeviceSynchronizer {
    registry: ModelRegistry,
    notifier: Arc<dyn DeviceNotifier>,
    slot: RwLock<Option<LoadedModel>>,
    cache: Arc<StateCache>,
}

impl DeviceSynchronizer {
    pub fn new(registry: ModelRegistry, notifier: Arc<dyn DeviceNotifier>) -> Self {
        Self {
            registry,
            notifier,
            slot: RwLock::new(None),
            cache: Arc::new(StateCache::default()),
        }
    }

    /// Load the model module at `path`, replacing any loaded model.
    ///
    /// Every device is published once after a successful load, changed or
    /// not, so subscribers always receive a full snapshot.
    pub async fn load(&self, path: &Path) -> CoreResult<()> {
        if !path.is_file() {
            return Err(CoreError::ModelFileNotFound(path.display().to_string()));
        }

        let mut slot = self.slot.write().await;
        if let Some(previous) = slot.take() {
            info!("[DEVICES] Unloaded model '{}'", previous.model.name());
        }
        self.cache.clear();

        let model = self.registry.load_file(path)?;
        let devices = model.devices();

        self.cache
            .reset(devices.iter().map(|d| (d.id().to_string(), d.state())));
        for device in &devices {
            debug!("[DEVICES] {} ({})", device.id(), device.kind());
            self.notifier.on_device_changed(device.id());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for device in &devices {
            device.add_listener(ChangeListener::new(tx.clone()));
        }
        let listener = tokio::spawn(publish_changes(
            rx,
            devices.clone(),
            self.cache.clone(),
            self.notifier.clone(),
        ));

        info!(
            "[DEVICES] Loaded model '{}' from {} ({} devices)",
            model.name(),
            path.display(),
            devices.len()
        );

        *slot = Some(LoadedModel {
            path: path.to_path_buf(),
            model,
            devices,
            listener,
        });
        Ok(())
    }

    /// Load the current model's module again
    pub async fn reload(&self) -> CoreResult<()> {
        let path = self.loaded_path().await.ok_or(CoreError::NoModelLoaded)?;
        self.load(&path).await
    }

    /// Drop the loaded model, if any
    pub async fn unload(&self) {
        if let Some(previous) = self.slot.write().await.take() {
            info!("[DEVICES] Unloaded model '{}'", previous.model.name());
        }
        self.cache.clear();
    }

    pub async fn loaded_path(&self) -> Option<PathBuf> {
        self.slot.read().await.as_ref().map(|m| m.path.clone())
    }

    /// Ids of the loaded model's devices; empty when nothing is loaded
    pub async fn device_ids(&self) -> Vec<String> {
        self.slot
            .read()
            .await
            .as_ref()
            .map(LoadedModel::ids)
            .unwrap_or_default()
    }

    pub async fn state_of(&self, device_id: &str) -> CoreResult<Value> {
        let slot = self.slot.read().await;
        let loaded = slot.as_ref().ok_or(CoreError::NoModelLoaded)?;
        Ok(loaded.find(device_id)?.state())
    }

    pub async fn all_states(&self) -> CoreResult<Map<String, Value>> {
        let slot = self.slot.read().await;
        let loaded = slot.as_ref().ok_or(CoreError::NoModelLoaded)?;
        Ok(loaded
            .devices
            .iter()
            .map(|d| (d.id().to_string(), d.state()))
            .collect())
    }

    /// Ask a device to apply a new state.
    ///
    /// Publishing happens through the device's own change event.
    pub async fn update_state(&self, device_id: &str, state: Value) -> CoreResult<()> {
        let slot = self.slot.read().await;
        let loaded = slot.as_ref().ok_or(CoreError::NoModelLoaded)?;
        let device = loaded.find(device_id)?;
        debug!("[DEVICES] Setting {} to {}", device_id, state);
        device.set_state(state)
    }
}

/// Drain device change events, publishing the ones that changed state
async fn publish_changes(
    mut rx: mpsc::UnboundedReceiver<String>,
    devices: Vec<Arc<dyn Device>>,
    cache: Arc<StateCache>,
    notifier: Arc<dyn DeviceNotifier>,
) {
    while let Some(id) = rx.recv().await {
        let Some(device) = devices.iter().find(|d| d.id() == id) else {
            warn!("[DEVICES] Change event from unknown device {}", id);
            continue;
        };

        if cache.compare_and_update(&id, device.state()) {
            notifier.on_device_changed(&id);
        }
    }
}

//! In-process simulated devices
//!
//! The `sim` provider lets projects run the full control plane without
//! hardware. Supported device kinds:
//!
//! | kind | state |
//! |---|---|
//! | `actuator` | `{"position": number}`, bounded by optional `min`/`max` |
//! | `relay` | `{"active": bool}` |
//! | `value` | any JSON value |

use super::model::{ChangeListener, Device, DeviceModel, Listeners};
use super::module::{DeviceSpec, ModelModule};
use crate::error::{CoreError, CoreResult};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// `[model] kind` served by this provider
pub const PROVIDER_KIND: &str = "sim";

fn invalid(id: &str, reason: impl Into<String>) -> CoreError {
    CoreError::InvalidState {
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// Position-controlled actuator
pub struct SimActuator {
    id: String,
    position: Mutex<f64>,
    min: Option<f64>,
    max: Option<f64>,
    listeners: Listeners,
}

impl SimActuator {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position: Mutex::new(0.0),
            min: None,
            max: None,
            listeners: Listeners::default(),
        }
    }

    /// Limit accepted positions (builder-style)
    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

impl Device for SimActuator {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "actuator"
    }

    fn state(&self) -> Value {
        let position = self.position.lock().map(|p| *p).unwrap_or_default();
        json!({ "position": position })
    }

    fn set_state(&self, state: Value) -> CoreResult<()> {
        let target = state
            .get("position")
            .and_then(Value::as_f64)
            .ok_or_else(|| invalid(&self.id, "expected {\"position\": number}"))?;

        if self.min.is_some_and(|min| target < min) || self.max.is_some_and(|max| target > max) {
            return Err(invalid(&self.id, format!("position {} out of range", target)));
        }

        if let Ok(mut position) = self.position.lock() {
            *position = target;
        }
        self.listeners.notify(&self.id);
        Ok(())
    }

    fn add_listener(&self, listener: ChangeListener) {
        self.listeners.add(listener);
    }
}

/// Discrete on/off device
pub struct SimRelay {
    id: String,
    active: Mutex<bool>,
    listeners: Listeners,
}

impl SimRelay {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active: Mutex::new(false),
            listeners: Listeners::default(),
        }
    }
}

impl Device for SimRelay {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "relay"
    }

    fn state(&self) -> Value {
        let active = self.active.lock().map(|a| *a).unwrap_or_default();
        json!({ "active": active })
    }

    fn set_state(&self, state: Value) -> CoreResult<()> {
        let target = state
            .get("active")
            .and_then(Value::as_bool)
            .ok_or_else(|| invalid(&self.id, "expected {\"active\": bool}"))?;

        if let Ok(mut active) = self.active.lock() {
            *active = target;
        }
        self.listeners.notify(&self.id);
        Ok(())
    }

    fn add_listener(&self, listener: ChangeListener) {
        self.listeners.add(listener);
    }
}

/// Free-form state holder
pub struct SimValue {
    id: String,
    value: Mutex<Value>,
    listeners: Listeners,
}

impl SimValue {
    pub fn new(id: impl Into<String>, initial: Value) -> Self {
        Self {
            id: id.into(),
            value: Mutex::new(initial),
            listeners: Listeners::default(),
        }
    }
}

impl Device for SimValue {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "value"
    }

    fn state(&self) -> Value {
        self.value.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn set_state(&self, state: Value) -> CoreResult<()> {
        if let Ok(mut value) = self.value.lock() {
            *value = state;
        }
        self.listeners.notify(&self.id);
        Ok(())
    }

    fn add_listener(&self, listener: ChangeListener) {
        self.listeners.add(listener);
    }
}

/// A simulated robot
pub struct SimModel {
    name: String,
    devices: Vec<Arc<dyn Device>>,
}

impl DeviceModel for SimModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices.clone()
    }
}

fn build_device(spec: &DeviceSpec) -> Result<Arc<dyn Device>, String> {
    let id = spec
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let initial = spec.initial_json();

    let device: Arc<dyn Device> = match spec.kind.as_str() {
        "actuator" => {
            let actuator = SimActuator::new(id)
                .with_range(spec.min.map(f64::from), spec.max.map(f64::from));
            if let Some(state) = initial {
                actuator.set_state(state).map_err(|e| e.to_string())?;
            }
            Arc::new(actuator)
        }
        "relay" => {
            let relay = SimRelay::new(id);
            if let Some(state) = initial {
                relay.set_state(state).map_err(|e| e.to_string())?;
            }
            Arc::new(relay)
        }
        "value" => Arc::new(SimValue::new(id, initial.unwrap_or(Value::Null))),
        other => return Err(format!("unknown sim device kind '{}'", other)),
    };

    Ok(device)
}

/// Provider entry point registered under [`PROVIDER_KIND`]
pub fn provide(module: &ModelModule) -> Result<Box<dyn DeviceModel>, String> {
    let name = module
        .model
        .as_ref()
        .and_then(|m| m.name.clone())
        .unwrap_or_else(|| "robot".to_string());

    let mut devices = Vec::with_capacity(module.devices.len());
    for spec in &module.devices {
        let device = build_device(spec)?;
        if devices.iter().any(|d: &Arc<dyn Device>| d.id() == device.id()) {
            return Err(format!("duplicate device id '{}'", device.id()));
        }
        devices.push(device);
    }

    Ok(Box::new(SimModel { name, devices }))
}

//! Device model module files
//!
//! A project describes its robot in a TOML module:
//!
//! ```toml
//! [model]
//! kind = "sim"
//! name = "rover"
//!
//! [[devices]]
//! id = "left_wheel"
//! kind = "actuator"
//! min = -1.0
//! max = 1.0
//!
//! [[devices]]
//! kind = "relay"
//! ```
//!
//! Devices without an `id` get a random UUID when the model is instantiated.

use serde::Deserialize;

/// The model declaration, exactly one per module
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    /// Provider that instantiates the model
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// One `[[devices]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub min: Option<f32>,
    #[serde(default)]
    pub max: Option<f32>,
    /// Initial state, in TOML form
    #[serde(default)]
    pub initial: Option<toml::Value>,
}

impl DeviceSpec {
    /// Initial state converted to JSON
    pub fn initial_json(&self) -> Option<serde_json::Value> {
        self.initial
            .as_ref()
            .and_then(|v| serde_json::to_value(v).ok())
    }
}

/// A parsed module file
#[derive(Debug, Clone, Deserialize)]
pub struct ModelModule {
    #[serde(default)]
    pub model: Option<ModelSection>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

impl ModelModule {
    pub fn parse(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_module() {
        let module = ModelModule::parse(
            r#"
            [model]
            kind = "sim"
            name = "rover"

            [[devices]]
            id = "arm"
            kind = "actuator"
            max = 90.0

            [[devices]]
            kind = "value"
            initial = { mode = "idle", speed = 2 }
            "#,
        )
        .unwrap();

        let model = module.model.unwrap();
        assert_eq!(model.kind, "sim");
        assert_eq!(model.name.as_deref(), Some("rover"));
        assert_eq!(module.devices.len(), 2);
        assert_eq!(module.devices[0].max, Some(90.0));
        assert!(module.devices[1].id.is_none());
        assert_eq!(
            module.devices[1].initial_json(),
            Some(json!({"mode": "idle", "speed": 2}))
        );
    }

    #[test]
    fn test_duplicate_model_table_is_rejected() {
        let text = "[model]\nkind = \"sim\"\n[model]\nkind = \"sim\"\n";
        assert!(ModelModule::parse(text).is_err());
    }
}

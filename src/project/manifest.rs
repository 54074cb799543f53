//! Workspace manifest (`manifest.json`)
//!
//! ```json
//! {
//!     "name": "rover",
//!     "selected_project": "demo",
//!     "projects": [ { "id": "demo", "target": "./main.py" } ]
//! }
//! ```

use crate::error::ProjectResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// An installed project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: String,
    /// Program to run, relative to the project directory
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub selected_project: Option<String>,
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
    /// Keys this process does not use, preserved on save
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Read the manifest; a missing file is an empty workspace
    pub fn load(path: &Path) -> ProjectResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> ProjectResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn project(&self, id: &str) -> Option<&ProjectEntry> {
        self.projects.iter().find(|p| p.id == id)
    }

    /// Entry for the selected project
    pub fn selected(&self) -> Option<&ProjectEntry> {
        self.selected_project
            .as_deref()
            .and_then(|id| self.project(id))
    }

    pub fn selected_mut(&mut self) -> Option<&mut ProjectEntry> {
        let id = self.selected_project.clone()?;
        self.projects.iter_mut().find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::load(&dir.path().join("manifest.json")).unwrap();
        assert!(manifest.projects.is_empty());
        assert!(manifest.selected().is_none());
    }

    #[test]
    fn test_unknown_keys_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{"name": "rover", "selected_project": "demo", "projects": [{"id": "demo", "target": "./main.py"}], "theme": "dark"}"#,
        )
        .unwrap();

        let mut manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.selected().unwrap().target, "./main.py");
        manifest.selected_mut().unwrap().target = "./other.py".into();
        manifest.save(&path).unwrap();

        let reloaded = Manifest::load(&path).unwrap();
        assert_eq!(reloaded.name.as_deref(), Some("rover"));
        assert_eq!(reloaded.project("demo").unwrap().target, "./other.py");
        assert_eq!(reloaded.extra["theme"], "dark");
    }
}

//! Command and result types
//!
//! A [`Command`] is an endpoint name plus a JSON object payload. WebSocket
//! clients send that shape directly; the BLE communication characteristic
//! carries a space-separated line which [`Command::parse_line`] lifts into the
//! same form:
//!
//! ```text
//! switch-project <project_id>
//! install-project <project_id> <url> [token]
//! set-state {"uuid": "...", "state": {...}}
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced while parsing a command line
#[derive(Error, Debug)]
pub enum CommandParseError {
    #[error("Empty command")]
    Empty,

    #[error("Failed to parse state: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Failed to parse state: expected a JSON object")]
    NotAnObject,
}

/// A decoded request, routed by endpoint name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub endpoint: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Command {
    /// Create a command with an empty payload
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            payload: Map::new(),
        }
    }

    /// Builder-style payload entry
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Build a command from an endpoint and an arbitrary JSON payload.
    /// Anything other than an object yields an empty payload.
    pub fn from_parts(endpoint: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            endpoint: endpoint.into(),
            payload,
        }
    }

    /// Non-empty string argument from the payload
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Parse a BLE command line into a command
    pub fn parse_line(line: &str) -> Result<Self, CommandParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(CommandParseError::Empty);
        }

        let (endpoint, rest) = line.split_once(' ').unwrap_or((line, ""));
        let args: Vec<&str> = rest.split(' ').filter(|a| !a.is_empty()).collect();
        let mut command = Command::new(endpoint);

        let names: &[&str] = match endpoint {
            "switch-project" => &["project_id"],
            "switch-branch" => &["branch_name"],
            "change-target" => &["target_name"],
            "install-project" => &["project_id", "url", "token"],
            "get-state" => &["device_id"],
            "set-state" => {
                if !rest.trim().is_empty() {
                    match serde_json::from_str::<Value>(rest)? {
                        Value::Object(map) => command.payload = map,
                        _ => return Err(CommandParseError::NotAnObject),
                    }
                }
                &[]
            }
            _ => &[],
        };

        for (name, value) in names.iter().zip(args) {
            command
                .payload
                .insert(name.to_string(), Value::String(value.to_string()));
        }

        Ok(command)
    }
}

/// Response payload: text for most commands, raw bytes when a handler
/// produces an already-encoded body
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Text(String),
    Bytes(Bytes),
}

impl Response {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Response::Text(text) => text.as_bytes(),
            Response::Bytes(bytes) => bytes,
        }
    }

    /// Text view of the payload (lossy for non UTF-8 bytes)
    pub fn to_text(&self) -> String {
        match self {
            Response::Text(text) => text.clone(),
            Response::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

impl From<String> for Response {
    fn from(text: String) -> Self {
        Response::Text(text)
    }
}

impl From<&str> for Response {
    fn from(text: &str) -> Self {
        Response::Text(text.to_string())
    }
}

impl From<Bytes> for Response {
    fn from(bytes: Bytes) -> Self {
        Response::Bytes(bytes)
    }
}

/// Outcome of executing a command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub response: Response,
}

impl CommandResult {
    /// Successful result with a payload
    pub fn ok(response: impl Into<Response>) -> Self {
        Self {
            success: true,
            response: response.into(),
        }
    }

    /// Successful result with no payload
    pub fn done() -> Self {
        Self::ok("")
    }

    /// Failed result carrying a message
    pub fn failed(message: impl Into<Response>) -> Self {
        Self {
            success: false,
            response: message.into(),
        }
    }

    /// Encode as `0,<payload>` on success or `1,<payload>` on failure
    pub fn to_status_frame(&self) -> Bytes {
        let body = self.response.as_bytes();
        let mut buf = BytesMut::with_capacity(body.len() + 2);
        buf.put_slice(if self.success { b"0," } else { b"1," });
        buf.put_slice(body);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plain_endpoint() {
        let cmd = Command::parse_line("list-projects").unwrap();
        assert_eq!(cmd.endpoint, "list-projects");
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn test_parse_positional_arguments() {
        let cmd = Command::parse_line("install-project demo https://example.com/demo.git").unwrap();
        assert_eq!(cmd.str_arg("project_id"), Some("demo"));
        assert_eq!(cmd.str_arg("url"), Some("https://example.com/demo.git"));
        assert_eq!(cmd.str_arg("token"), None);

        let cmd = Command::parse_line("switch-branch main\n").unwrap();
        assert_eq!(cmd.str_arg("branch_name"), Some("main"));
    }

    #[test]
    fn test_parse_missing_argument_leaves_payload_empty() {
        let cmd = Command::parse_line("switch-project").unwrap();
        assert_eq!(cmd.str_arg("project_id"), None);
    }

    #[test]
    fn test_parse_set_state_keeps_json_intact() {
        let cmd =
            Command::parse_line(r#"set-state {"uuid": "arm", "state": {"label": "two words"}}"#)
                .unwrap();
        assert_eq!(cmd.endpoint, "set-state");
        assert_eq!(cmd.payload["uuid"], json!("arm"));
        assert_eq!(cmd.payload["state"]["label"], json!("two words"));
    }

    #[test]
    fn test_parse_set_state_rejects_garbage() {
        assert!(matches!(
            Command::parse_line("set-state {nope"),
            Err(CommandParseError::InvalidJson(_))
        ));
        assert!(matches!(
            Command::parse_line("set-state [1, 2]"),
            Err(CommandParseError::NotAnObject)
        ));
        assert!(matches!(Command::parse_line("  \n"), Err(CommandParseError::Empty)));
    }

    #[test]
    fn test_from_parts() {
        let cmd = Command::from_parts("get-state", json!({"device_id": "gripper"}));
        assert_eq!(cmd.str_arg("device_id"), Some("gripper"));

        let cmd = Command::from_parts("name", Value::Null);
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn test_status_frame() {
        assert_eq!(&CommandResult::ok("main").to_status_frame()[..], b"0,main");
        assert_eq!(&CommandResult::failed("nope").to_status_frame()[..], b"1,nope");
        assert_eq!(&CommandResult::done().to_status_frame()[..], b"0,");

        let raw = CommandResult::ok(Bytes::from_static(&[0xff, b'x']));
        assert_eq!(raw.response.to_text(), "\u{fffd}x");
    }
}

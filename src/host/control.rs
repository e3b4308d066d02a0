//! Control-plane methods every host serves.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `initialize` request method.
pub const INITIALIZE_METHOD: &str = "initialize";
/// `shutdown` request method.
pub const SHUTDOWN_METHOD: &str = "shutdown";
/// `exit` notification method.
pub const EXIT_METHOD: &str = "exit";
/// `version` request method.
pub const VERSION_METHOD: &str = "version";

/// The closed set of control methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMethod {
    /// Capability negotiation; runs on-initialize callbacks.
    Initialize,
    /// Graceful teardown; runs on-shutdown callbacks.
    Shutdown,
    /// Ends the session.
    Exit,
    /// Reports server name and version.
    Version,
}

impl ControlMethod {
    /// Parses a method name.
    #[must_use]
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            INITIALIZE_METHOD => Some(Self::Initialize),
            SHUTDOWN_METHOD => Some(Self::Shutdown),
            EXIT_METHOD => Some(Self::Exit),
            VERSION_METHOD => Some(Self::Version),
            _ => None,
        }
    }

    /// Wire method name.
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::Initialize => INITIALIZE_METHOD,
            Self::Shutdown => SHUTDOWN_METHOD,
            Self::Exit => EXIT_METHOD,
            Self::Version => VERSION_METHOD,
        }
    }

    /// Returns `true` for methods sent as notifications.
    #[must_use]
    pub const fn is_notification(self) -> bool {
        matches!(self, Self::Exit)
    }
}

/// Client information sent with `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `initialize` params. Every member is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[allow(clippy::derive_partial_eq_without_eq)]
pub struct InitializeParams {
    /// Process id of the client, if it reports one.
    pub process_id: Option<i64>,
    /// Client identification.
    pub client_info: Option<ClientInfo>,
    /// Client capabilities, passed to on-initialize callbacks untouched.
    pub capabilities: Value,
    /// Free-form options for hosted services.
    pub initialization_options: Option<Value>,
}

/// Server identification returned from `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

/// `initialize` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::derive_partial_eq_without_eq)]
pub struct InitializeResult {
    /// Capabilities merged from every on-initialize callback.
    pub capabilities: Map<String, Value>,
    /// Server identification.
    pub server_info: ServerInfo,
}

/// `version` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Server version.
    pub version: String,
    /// Server name.
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_method_round_trip() {
        for m in [
            ControlMethod::Initialize,
            ControlMethod::Shutdown,
            ControlMethod::Exit,
            ControlMethod::Version,
        ] {
            assert_eq!(ControlMethod::from_method(m.method()), Some(m));
        }
        assert_eq!(ControlMethod::from_method("connection/connect"), None);
        assert!(ControlMethod::Exit.is_notification());
        assert!(!ControlMethod::Shutdown.is_notification());
    }

    #[test]
    fn test_initialize_params_accept_empty_object() {
        let params: InitializeParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!(params, InitializeParams::default());
    }

    #[test]
    fn test_initialize_params_camel_case() {
        let params: InitializeParams = serde_json::from_value(json!({
            "processId": 4242,
            "clientInfo": {"name": "editor", "version": "1.9"},
            "capabilities": {"workspace": {}},
            "somethingElse": true
        }))
        .unwrap();
        assert_eq!(params.process_id, Some(4242));
        assert_eq!(params.client_info.unwrap().name, "editor");
        assert_eq!(params.capabilities, json!({"workspace": {}}));
    }

    #[test]
    fn test_initialize_result_shape() {
        let result = InitializeResult {
            capabilities: Map::new(),
            server_info: ServerInfo {
                name: "toolhost".to_string(),
                version: "0.3.0".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(result).unwrap(),
            json!({"capabilities": {}, "serverInfo": {"name": "toolhost", "version": "0.3.0"}})
        );
    }
}

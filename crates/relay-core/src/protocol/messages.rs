//! Outbound JSON message types.
//!
//! Two kinds of frame are ever sent to a client:
//!
//! - A [`ServerReply`] in response to each control frame the client sent.
//! - A [`Notification`] whenever the bus delivers an event for a module the
//!   client is subscribed to.
//!
//! # Serde representation
//!
//! ```json
//! {"result":true,"subscriptions":["about","web"]}
//! {"result":false,"error":"Params not defined."}
//! {"module":"web","action":"set_language","kind":"notification","data":{"language":"cs"},"controller_id":"00000A1B2C3D4E5F"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::request::ProtocolError;
use crate::domain::subscriptions::SubscriptionSet;

/// Value of the `kind` field on every notification.
pub const NOTIFICATION_KIND: &str = "notification";

fn default_kind() -> String {
    NOTIFICATION_KIND.to_string()
}

/// An event emitted by an upstream controller.
///
/// The bus delivers these without a `controller_id`; the registry stamps the
/// id of the controller the bus bridge received it from right before fan-out.
/// Fields this type does not know about are kept in `extra` and forwarded to
/// clients unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Topic used for subscription filtering, e.g. `"web"`.
    pub module: String,

    /// What happened inside the module, e.g. `"set_language"`.
    pub action: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    /// Arbitrary payload; `null` when the upstream sent none.
    #[serde(default)]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notification {
    /// Builds a notification with `kind` set to `"notification"` and no
    /// controller id.
    pub fn new(module: impl Into<String>, action: impl Into<String>, data: Value) -> Self {
        Self {
            module: module.into(),
            action: action.into(),
            kind: default_kind(),
            data,
            controller_id: None,
            extra: Map::new(),
        }
    }

    /// Returns the notification with `controller_id` set.
    pub fn stamped(mut self, controller_id: impl Into<String>) -> Self {
        self.controller_id = Some(controller_id.into());
        self
    }
}

/// Reply sent to a client after each control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerReply {
    /// The request succeeded; carries the full subscription set afterwards.
    Subscriptions {
        result: bool,
        subscriptions: Vec<String>,
    },

    /// The request was rejected.
    Error { result: bool, error: String },
}

impl ServerReply {
    pub fn subscriptions(set: &SubscriptionSet) -> Self {
        ServerReply::Subscriptions {
            result: true,
            subscriptions: set.to_vec(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerReply::Error {
            result: false,
            error: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ServerReply::Subscriptions { .. })
    }
}

impl From<ProtocolError> for ServerReply {
    fn from(err: ProtocolError) -> Self {
        ServerReply::error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_serializes_all_wire_fields() {
        // Arrange
        let n = Notification::new("testa", "testa", json!({"test": "a"})).stamped("C1");

        // Act
        let value = serde_json::to_value(&n).unwrap();

        // Assert
        assert_eq!(
            value,
            json!({
                "module": "testa",
                "action": "testa",
                "kind": "notification",
                "data": {"test": "a"},
                "controller_id": "C1",
            })
        );
    }

    #[test]
    fn test_unstamped_notification_omits_controller_id() {
        let n = Notification::new("web", "x", Value::Null);

        let value = serde_json::to_value(&n).unwrap();

        assert!(value.get("controller_id").is_none());
    }

    #[test]
    fn test_notification_preserves_unknown_fields() {
        // Arrange: upstream sends an extra field the relay does not model
        let raw = r#"{"module":"web","action":"a","kind":"notification","data":1,"seq":9}"#;

        // Act
        let n: Notification = serde_json::from_str(raw).unwrap();
        let out = serde_json::to_value(&n).unwrap();

        // Assert
        assert_eq!(n.extra.get("seq"), Some(&json!(9)));
        assert_eq!(out["seq"], json!(9));
    }

    #[test]
    fn test_notification_defaults_kind_and_data() {
        let n: Notification = serde_json::from_str(r#"{"module":"m","action":"a"}"#).unwrap();

        assert_eq!(n.kind, NOTIFICATION_KIND);
        assert_eq!(n.data, Value::Null);
    }

    #[test]
    fn test_notification_requires_module() {
        let result = serde_json::from_str::<Notification>(r#"{"action":"a"}"#);

        assert!(result.is_err());
    }

    #[test]
    fn test_subscriptions_reply_serializes() {
        let mut set = SubscriptionSet::new();
        set.subscribe(["b", "a"]);

        let value = serde_json::to_value(ServerReply::subscriptions(&set)).unwrap();

        assert_eq!(value, json!({"result": true, "subscriptions": ["a", "b"]}));
    }

    #[test]
    fn test_error_reply_from_protocol_error() {
        let reply = ServerReply::from(ProtocolError::MissingParams);

        let value = serde_json::to_value(&reply).unwrap();

        assert_eq!(value, json!({"result": false, "error": "Params not defined."}));
        assert!(!reply.is_success());
    }

    #[test]
    fn test_reply_deserializes_into_matching_variant() {
        let ok: ServerReply =
            serde_json::from_str(r#"{"result":true,"subscriptions":[]}"#).unwrap();
        let err: ServerReply = serde_json::from_str(r#"{"result":false,"error":"x"}"#).unwrap();

        assert!(ok.is_success());
        assert_eq!(err, ServerReply::error("x"));
    }
}

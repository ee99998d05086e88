//! Parsing of inbound client control frames.
//!
//! A client controls its subscriptions with JSON text frames of the form:
//!
//! ```json
//! {"action": "subscribe",   "params": ["about", "web"]}
//! {"action": "unsubscribe", "params": "web"}
//! ```
//!
//! `params` is either a single module name or an array of module names.
//! Any other field in the object is ignored.
//!
//! # Validation order
//!
//! The checks below run in a fixed order and the first failure wins.  The
//! `Display` text of each [`ProtocolError`] variant is exactly what the client
//! receives in the `error` field of the reply, so these strings are part of
//! the wire protocol and must not change.
//!
//! 1. The frame is JSON                 → `Not in json format.`
//! 2. It is an object with `action`     → `Action not defined.`
//! 3. It has `params`                   → `Params not defined.`
//! 4. `action` is a known action        → `Unknown action '<action>'`
//! 5. `params` is a string or an array  → `Not a valid module list '<params>'`
//! 6. Every array element is a string   → `Module item is not a string '<item>'`

use serde_json::Value;
use thiserror::Error;

/// A client frame that violated the control protocol.
///
/// These are reported back to the offending client; they never close the
/// connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Not in json format.")]
    NotJson,

    #[error("Action not defined.")]
    MissingAction,

    #[error("Params not defined.")]
    MissingParams,

    /// Carries the action as the client sent it (strings unquoted, anything
    /// else rendered as JSON).
    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("Not a valid module list '{0}'")]
    InvalidModuleList(String),

    #[error("Module item is not a string '{0}'")]
    ModuleNotString(String),
}

/// The two control actions a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Subscribe => "subscribe",
            Action::Unsubscribe => "unsubscribe",
        }
    }
}

/// The `params` of a control frame: one module or several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleList {
    Single(String),
    Many(Vec<String>),
}

impl ModuleList {
    /// Borrows the module names regardless of the variant.
    pub fn as_slice(&self) -> &[String] {
        match self {
            ModuleList::Single(module) => std::slice::from_ref(module),
            ModuleList::Many(modules) => modules,
        }
    }
}

impl TryFrom<&Value> for ModuleList {
    type Error = ProtocolError;

    fn try_from(params: &Value) -> Result<Self, Self::Error> {
        match params {
            Value::String(module) => Ok(ModuleList::Single(module.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(module) => Ok(module.clone()),
                    other => Err(ProtocolError::ModuleNotString(other.to_string())),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(ModuleList::Many),
            other => Err(ProtocolError::InvalidModuleList(other.to_string())),
        }
    }
}

/// A validated control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub action: Action,
    pub modules: ModuleList,
}

impl ClientRequest {
    /// Parses and validates one raw text frame.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProtocolError`] in the order documented at the
    /// top of this module.
    ///
    /// # Example
    ///
    /// ```rust
    /// use relay_core::{Action, ClientRequest, ModuleList};
    ///
    /// let req = ClientRequest::parse(r#"{"action":"subscribe","params":"web"}"#).unwrap();
    /// assert_eq!(req.action, Action::Subscribe);
    /// assert_eq!(req.modules, ModuleList::Single("web".into()));
    /// ```
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let parsed: Value = serde_json::from_str(raw).map_err(|_| ProtocolError::NotJson)?;

        let object = parsed.as_object().ok_or(ProtocolError::MissingAction)?;
        let action = object.get("action").ok_or(ProtocolError::MissingAction)?;
        let params = object.get("params").ok_or(ProtocolError::MissingParams)?;

        let action = match action.as_str() {
            Some("subscribe") => Action::Subscribe,
            Some("unsubscribe") => Action::Unsubscribe,
            Some(other) => return Err(ProtocolError::UnknownAction(other.to_string())),
            None => return Err(ProtocolError::UnknownAction(action.to_string())),
        };

        let modules = ModuleList::try_from(params)?;

        Ok(Self { action, modules })
    }
}

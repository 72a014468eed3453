//! Page → worker control messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message posted to a worker.
///
/// Wire form is `{ "type": "SKIP_WAITING" }`. Any other `type` decodes as [`Unknown`].
///
/// [`Unknown`]: ControlMessage::Unknown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Stop waiting for old clients and activate now.
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,

    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Decode a posted value. Values without a string `type` are not messages.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.get("type")?.as_str()?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_skip_waiting_wire_form() {
        assert_eq!(
            ControlMessage::SkipWaiting.to_value(),
            json!({ "type": "SKIP_WAITING" })
        );
        assert_eq!(
            ControlMessage::from_value(&json!({ "type": "SKIP_WAITING" })),
            Some(ControlMessage::SkipWaiting)
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            ControlMessage::from_value(&json!({ "type": "CLEAR_CACHE" })),
            Some(ControlMessage::Unknown)
        );
        assert_eq!(ControlMessage::from_value(&json!("SKIP_WAITING")), None);
        assert_eq!(ControlMessage::from_value(&json!({ "type": 7 })), None);
        assert_eq!(ControlMessage::from_value(&Value::Null), None);
    }
}

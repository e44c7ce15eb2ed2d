use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// CDP error code for failures reported by the extension.
pub const EXTENSION_ERROR: i64 = -32000;
/// CDP error code for methods the broker does not support.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// CDP error code for timeouts and lost/absent extension connections.
pub const INTERNAL_ERROR: i64 = -32603;

/// Raw inbound frame from a CDP client before validation.
///
/// Every client text frame is deserialized into this shape first; a frame
/// without an `id` or `method` is a protocol-decode fault.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    /// Request ID chosen by the client; echoed on the response.
    pub id: Option<u64>,
    /// CDP method name (e.g., `Target.attachToTarget`).
    pub method: Option<String>,
    /// Optional parameters.
    pub params: Option<Value>,
    /// Session ID for session-scoped commands.
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Build a successful CDP response frame.
#[must_use]
pub fn response_ok(id: u64, session_id: Option<&str>, result: Value) -> Value {
    let mut frame = json!({ "id": id, "result": result });
    if let Some(sid) = session_id {
        frame["sessionId"] = Value::String(sid.to_owned());
    }
    frame
}

/// Build a CDP error response frame.
#[must_use]
pub fn response_err(id: u64, session_id: Option<&str>, code: i64, message: &str) -> Value {
    let mut frame = json!({ "id": id, "error": { "code": code, "message": message } });
    if let Some(sid) = session_id {
        frame["sessionId"] = Value::String(sid.to_owned());
    }
    frame
}

/// Build a CDP event frame, optionally stamped with a session ID.
#[must_use]
pub fn event(method: &str, params: Value, session_id: Option<&str>) -> Value {
    let mut frame = json!({ "method": method, "params": params });
    if let Some(sid) = session_id {
        frame["sessionId"] = Value::String(sid.to_owned());
    }
    frame
}

/// Command sent from the broker to the extension.
#[derive(Debug, Serialize)]
pub struct ExtensionCommand {
    /// Outbound ID for response correlation. Monotonic per link.
    pub id: u64,
    /// Extension method name (e.g., `cdpCommand`, `listTabs`).
    pub method: String,
    /// Optional parameters for the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Raw incoming frame from the extension before classification.
///
/// The union of response and event fields; classified via
/// [`classify`](Self::classify), mirroring the CDP message shapes.
#[derive(Debug, Deserialize)]
pub struct ExtensionFrame {
    /// Present for responses; absent for unsolicited events.
    pub id: Option<u64>,
    /// Present for unsolicited events.
    pub method: Option<String>,
    /// Event parameters.
    pub params: Option<Value>,
    /// Successful response payload.
    pub result: Option<Value>,
    /// Error message. Extension errors carry a string message only.
    pub error: Option<String>,
}

/// Classification of a raw extension frame.
pub enum ExtensionFrameKind {
    /// A response to a previously sent command.
    Response {
        /// The outbound ID the response correlates to.
        id: u64,
        /// The result value, or the extension's error message.
        result: Result<Value, String>,
    },
    /// An unsolicited event (`cdpEvent`, `tabDetached`, `tabUpdated`, `pong`).
    Event {
        /// The event method name.
        method: String,
        /// Event parameters.
        params: Value,
    },
}

impl ExtensionFrame {
    /// Classify this raw frame as either a response or an event.
    ///
    /// Frames with an `id` are responses; frames with a `method` but no `id`
    /// are events. Returns `None` if neither field is present.
    #[must_use]
    pub fn classify(self) -> Option<ExtensionFrameKind> {
        if let Some(id) = self.id {
            let result = match self.error {
                Some(message) => Err(message),
                None => Ok(self.result.unwrap_or(Value::Null)),
            };
            Some(ExtensionFrameKind::Response { id, result })
        } else if let Some(method) = self.method {
            Some(ExtensionFrameKind::Event {
                method,
                params: self.params.unwrap_or(Value::Null),
            })
        } else {
            None
        }
    }
}

/// Payload of an unsolicited `cdpEvent` frame from the extension.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpEventPayload {
    /// Browser tab the event originated from.
    #[serde(rename = "tabId")]
    pub tab_id: u64,
    /// CDP event method name.
    pub method: String,
    /// Event parameters.
    #[serde(default)]
    pub params: Value,
    /// Browser-assigned child session (OOPIF) the event belongs to, if any.
    #[serde(rename = "childSessionId")]
    pub child_session_id: Option<String>,
}

/// Payload of an unsolicited `tabDetached` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct TabDetachedPayload {
    #[serde(rename = "tabId")]
    pub tab_id: u64,
    /// Browser-reported detach reason (e.g., `canceled_by_user`).
    pub reason: String,
}

/// Payload of an unsolicited `tabUpdated` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct TabUpdatedPayload {
    #[serde(rename = "tabId")]
    pub tab_id: u64,
    pub url: Option<String>,
    pub title: Option<String>,
}

/// A single tab in a `listTabs` result.
#[derive(Debug, Clone, Deserialize)]
pub struct TabRecord {
    #[serde(rename = "tabId")]
    pub tab_id: u64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub active: bool,
}

/// Result of an extension `attachTab` / `createTab` call.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachResult {
    /// The session ID the broker supplied, echoed back.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Browser-provided target identity, when available.
    #[serde(rename = "targetId")]
    pub target_id: Option<String>,
    /// Browser-provided target description.
    #[serde(rename = "targetInfo")]
    pub target_info: Option<Value>,
    #[serde(rename = "tabId")]
    pub tab_id: u64,
}

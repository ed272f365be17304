//! Inbound frame decoding for the notification channel.
//!
//! The channel is shared with sibling features, so only the `notification`
//! envelope is consumed here. Everything else is reported as ignored, and
//! anything that fails to parse is reported as malformed instead of erroring.

use serde::Deserialize;
use serde_json::Value;

use crate::record::NotificationRecord;

/// Envelope type carrying a notification payload.
pub const NOTIFICATION_FRAME: &str = "notification";

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A notification for this subsystem
    Notification(NotificationRecord),
    /// Well-formed frame meant for another feature
    Ignored { kind: Option<String> },
    /// Unparseable frame
    Malformed(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    notification: Option<Value>,
}

/// Decode a text frame.
pub fn parse_frame(text: &str) -> InboundFrame {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => return InboundFrame::Malformed(format!("invalid envelope: {e}")),
    };

    if envelope.kind.as_deref() != Some(NOTIFICATION_FRAME) {
        return InboundFrame::Ignored {
            kind: envelope.kind,
        };
    }

    let Some(payload) = envelope.notification else {
        return InboundFrame::Malformed("notification frame without payload".to_string());
    };

    match serde_json::from_value::<NotificationRecord>(payload) {
        Ok(record) => InboundFrame::Notification(record),
        Err(e) => InboundFrame::Malformed(format!("invalid notification payload: {e}")),
    }
}

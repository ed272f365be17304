use serde::Serialize;

use crate::connection::ConnectionState;
use crate::record::NotificationRecord;

/// Events broadcast by the notification service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    StateChanged {
        state: ConnectionState,
    },
    /// A new streamed record was accepted.
    Received {
        record: NotificationRecord,
    },
    HistoryUpdated {
        pages: usize,
        has_more: bool,
    },
    HistoryFailed {
        error: String,
    },
    UnreadChanged {
        unread: u64,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    ReconnectGaveUp {
        attempts: u32,
        consecutive_server_errors: u32,
    },
    IdentityChanged {
        profile_id: Option<String>,
    },
}

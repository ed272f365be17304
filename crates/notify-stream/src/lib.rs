//! Notify-stream: real-time notification delivery and reconciliation.
//!
//! Keeps one streaming connection per identity, merges streamed records with
//! paginated persisted history and derives a single unread counter from
//! three independently changing inputs.
//!
//! ## Core Types
//!
//! - [`NotificationRecord`] - A persisted or streamed notification
//! - [`Identity`] - Credential and selected profile scoping all state
//! - [`NotificationSession`] - Synchronous state machine owning all mutable state
//! - [`NotificationService`] / [`NotificationHandle`] - Async driver and its handle
//!
//! ## Building Blocks
//!
//! - [`ReconnectPolicy`] - Backoff regimes and give-up thresholds
//! - [`StreamWindow`] - Bounded window of streamed records with eviction reporting
//! - [`merge()`] - Deduplicated, newest-first merged view
//! - [`UnreadCounts`] - Pure unread derivation
//!
//! ## Collaborators
//!
//! - [`HistoryStore`] / [`RestHistoryStore`] - Paginated history and read-state calls
//! - [`Connector`] / [`WsConnector`] - Streaming channel transport

pub mod address;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod frame;
pub mod history;
pub mod lifecycle;
pub mod merge;
pub mod reconnect;
pub mod record;
pub mod service;
pub mod session;
pub mod unread;
pub mod window;

pub use address::channel_url;
pub use config::{NotifyConfig, NotifyConfigBuilder};
pub use connection::{
    CloseRequest, ConnectionSignal, ConnectionState, Connector, SocketEvent, SocketEventKind,
    SocketHandle, WsConnector,
};
pub use error::{NotifyError, Result};
pub use events::NotificationEvent;
pub use frame::{InboundFrame, parse_frame};
pub use history::{HistoryCache, HistoryPage, HistoryStore, PageExtra, RestHistoryStore};
pub use lifecycle::{LifecycleController, LifecycleDecision, LifecycleInputs};
pub use merge::{MergedRecord, RecordOrigin, merge};
pub use reconnect::{CloseKind, ReconnectDecision, ReconnectPolicy, ReconnectTracker};
pub use record::{Identity, NotificationKind, NotificationRecord, RecordKey};
pub use service::{NotificationHandle, NotificationService};
pub use session::{Effect, FetchRequest, NotificationSession, NotificationSnapshot};
pub use unread::UnreadCounts;
pub use window::{PushOutcome, StreamWindow};

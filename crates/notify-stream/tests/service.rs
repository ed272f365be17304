//! Integration tests for the notification service.
//!
//! The service runs against an in-memory history store and a connector whose
//! sockets are driven by the test, on a paused clock so backoff delays elapse
//! instantly.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use url::Url;

use notify_stream::{
    CloseRequest, ConnectionState, Connector, HistoryPage, HistoryStore, Identity,
    LifecycleInputs, NotificationEvent, NotificationHandle, NotificationKind, NotificationRecord,
    NotificationService, NotificationSnapshot, NotifyConfig, NotifyError, PageExtra,
    ReconnectPolicy, Result, SocketEvent, SocketEventKind, SocketHandle,
};

struct MockSocket {
    generation: u64,
    url: Url,
    events: mpsc::Sender<SocketEvent>,
    close_rx: oneshot::Receiver<CloseRequest>,
}

/// Connector recording every socket it was asked to open.
#[derive(Clone, Default)]
struct MockConnector {
    sockets: Arc<Mutex<Vec<MockSocket>>>,
}

impl Connector for MockConnector {
    fn open(&self, url: Url, generation: u64, events: mpsc::Sender<SocketEvent>) -> SocketHandle {
        let (close_tx, close_rx) = oneshot::channel();
        self.sockets.lock().unwrap().push(MockSocket {
            generation,
            url,
            events,
            close_rx,
        });
        SocketHandle::new(generation, close_tx)
    }
}

impl MockConnector {
    fn count(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    fn url(&self, idx: usize) -> Url {
        self.sockets.lock().unwrap()[idx].url.clone()
    }

    fn close_request(&self, idx: usize) -> Option<CloseRequest> {
        let mut sockets = self.sockets.lock().unwrap();
        sockets[idx].close_rx.try_recv().ok()
    }

    async fn emit(&self, idx: usize, kind: SocketEventKind) {
        let (generation, events) = {
            let sockets = self.sockets.lock().unwrap();
            (sockets[idx].generation, sockets[idx].events.clone())
        };
        events
            .send(SocketEvent::new(generation, kind))
            .await
            .expect("service stopped");
    }

    async fn handshake(&self, idx: usize) {
        self.emit(idx, SocketEventKind::Opened).await;
    }

    async fn deliver(&self, idx: usize, record: &NotificationRecord) {
        let frame = json!({"type": "notification", "notification": record}).to_string();
        self.emit(idx, SocketEventKind::Message(frame)).await;
    }

    async fn close(&self, idx: usize, code: u16) {
        self.emit(
            idx,
            SocketEventKind::Closed {
                code,
                reason: String::new(),
            },
        )
        .await;
    }
}

/// Connector whose sockets take a while to finish their close handshake.
#[derive(Clone, Default)]
struct SlowCloseConnector {
    closed: Arc<Mutex<Vec<CloseRequest>>>,
}

impl Connector for SlowCloseConnector {
    fn open(&self, _url: Url, generation: u64, _events: mpsc::Sender<SocketEvent>) -> SocketHandle {
        let (close_tx, close_rx) = oneshot::channel();
        let closed = Arc::clone(&self.closed);
        let task = tokio::spawn(async move {
            if let Ok(request) = close_rx.await {
                tokio::time::sleep(Duration::from_millis(300)).await;
                closed.lock().unwrap().push(request);
            }
        });
        SocketHandle::with_task(generation, close_tx, task)
    }
}

/// History store serving one first page per profile.
#[derive(Default)]
struct MockHistory {
    pages: Mutex<HashMap<String, HistoryPage>>,
    fetches: AtomicUsize,
    fail_mark_all: AtomicBool,
}

impl MockHistory {
    fn set_page(&self, profile: &str, records: Vec<NotificationRecord>, unread: u64) {
        self.pages.lock().unwrap().insert(
            profile.to_string(),
            HistoryPage {
                results: records,
                next: None,
                extra_data: PageExtra {
                    unread_count: unread,
                },
            },
        );
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryStore for MockHistory {
    async fn fetch_page(&self, identity: &Identity, _cursor: Option<&str>) -> Result<HistoryPage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(identity.profile_id())
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_read(&self, _identity: &Identity, _id: i64) -> Result<()> {
        Ok(())
    }

    async fn mark_all_read(&self, _identity: &Identity) -> Result<u64> {
        if self.fail_mark_all.load(Ordering::SeqCst) {
            return Err(NotifyError::http(500, "boom"));
        }
        Ok(0)
    }
}

fn config() -> NotifyConfig {
    NotifyConfig::builder()
        .base_url("https://example.com/api")
        .reconnect(ReconnectPolicy {
            jitter: false,
            ..ReconnectPolicy::default()
        })
        .build()
        .unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn active(profile: &str) -> LifecycleInputs {
    LifecycleInputs::new(true, Some(Identity::new(profile, format!("token-{profile}"))), true)
}

fn start() -> (NotificationHandle, MockConnector, Arc<MockHistory>) {
    start_with(config())
}

fn start_with(config: NotifyConfig) -> (NotificationHandle, MockConnector, Arc<MockHistory>) {
    let connector = MockConnector::default();
    let history = Arc::new(MockHistory::default());
    let handle =
        NotificationService::spawn(config, history.clone(), Arc::new(connector.clone())).unwrap();
    (handle, connector, history)
}

async fn wait_for(
    handle: &NotificationHandle,
    mut condition: impl FnMut(&NotificationSnapshot) -> bool,
) -> NotificationSnapshot {
    let mut rx = handle.watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| condition(s)))
        .await
        .expect("timed out waiting for snapshot")
        .expect("service stopped");
    snapshot.clone()
}

async fn wait_sockets(connector: &MockConnector, count: usize) {
    for _ in 0..10_000 {
        if connector.count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} sockets, saw {}", connector.count());
}

/// Let the driver drain everything queued so far.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

async fn next_reconnect_or_give_up(events: &mut broadcast::Receiver<NotificationEvent>) -> Option<u64> {
    loop {
        match events.recv().await.expect("event channel closed") {
            NotificationEvent::Reconnecting { delay_ms, .. } => return Some(delay_ms),
            NotificationEvent::ReconnectGaveUp { .. } => return None,
            _ => {}
        }
    }
}

mod service_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_streamed_record_replaced_by_persisted_copy() {
        let (handle, connector, history) = start();
        handle.set_lifecycle(active("a")).await.unwrap();
        wait_sockets(&connector, 1).await;
        assert_eq!(
            connector.url(0).as_str(),
            "wss://example.com/ws/notifications/a/?token=token-a"
        );
        connector.handshake(0).await;
        wait_for(&handle, |s| s.state == ConnectionState::Connected && s.history_loaded).await;

        let streamed = NotificationRecord::new(NotificationKind::LikePost, at(1))
            .with_sender("dana")
            .with_extra("post_id", json!(7));
        connector.deliver(0, &streamed).await;
        let snapshot = wait_for(&handle, |s| s.unread_count == 1).await;
        assert_eq!(snapshot.unread.streamed, 1);

        history.set_page("a", vec![streamed.clone().with_id(42)], 1);
        handle.refresh().await.unwrap();
        let snapshot = wait_for(&handle, |s| {
            s.notifications.first().and_then(|m| m.record.id) == Some(42)
        })
        .await;
        assert_eq!(snapshot.notifications.len(), 1);
        assert_eq!(snapshot.unread.streamed, 0);
        assert_eq!(snapshot.unread_count, 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_closures_back_off_then_give_up() {
        let (handle, connector, _history) = start();
        let mut events = handle.subscribe();
        handle.set_lifecycle(active("a")).await.unwrap();

        let mut delays = Vec::new();
        for idx in 0..5 {
            wait_sockets(&connector, idx + 1).await;
            connector.close(idx, 1006).await;
            match next_reconnect_or_give_up(&mut events).await {
                Some(delay) => delays.push(delay),
                None => break,
            }
        }
        assert_eq!(delays, vec![3_000, 6_000, 12_000, 24_000]);

        let snapshot = wait_for(&handle, |s| s.state == ConnectionState::Error).await;
        assert_eq!(snapshot.reconnect_attempts, 4);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.count(), 5);

        // Switching identity is a lifecycle event and retries again.
        handle.set_lifecycle(active("b")).await.unwrap();
        wait_sockets(&connector, 6).await;

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_switch_during_backoff() {
        let (handle, connector, _history) = start();
        handle.set_lifecycle(active("a")).await.unwrap();
        wait_sockets(&connector, 1).await;
        connector.handshake(0).await;
        connector
            .deliver(0, &NotificationRecord::new(NotificationKind::Mention, at(1)))
            .await;
        wait_for(&handle, |s| s.notifications.len() == 1).await;

        connector.close(0, 1006).await;
        wait_for(&handle, |s| s.reconnect_attempts == 1).await;

        handle.set_lifecycle(active("b")).await.unwrap();
        wait_sockets(&connector, 2).await;
        assert!(connector.url(1).path().contains("/notifications/b/"));
        let snapshot = wait_for(&handle, |s| s.profile_id.as_deref() == Some("b")).await;
        assert!(snapshot.notifications.is_empty());

        // A late frame from the old socket never reaches the new identity.
        connector
            .deliver(0, &NotificationRecord::new(NotificationKind::Follow, at(2)))
            .await;
        settle().await;
        assert!(handle.snapshot().notifications.is_empty());

        // The cancelled backoff timer never fires.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.count(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_closes_and_foreground_refetches() {
        let (handle, connector, history) = start();
        handle.set_lifecycle(active("a")).await.unwrap();
        wait_sockets(&connector, 1).await;
        connector.handshake(0).await;
        wait_for(&handle, |s| s.history_loaded).await;
        assert_eq!(history.fetches(), 1);

        handle.set_foreground(false).await.unwrap();
        wait_for(&handle, |s| s.state == ConnectionState::Disconnected).await;
        let request = connector.close_request(0).expect("socket was not closed");
        assert_eq!(request.code, 1000);
        assert_eq!(request.reason, "going inactive");

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.count(), 1);

        handle.set_foreground(true).await.unwrap();
        wait_sockets(&connector, 2).await;
        settle().await;
        assert_eq!(history.fetches(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mark_all_read_leaves_state_untouched() {
        let (handle, connector, history) = start();
        history.set_page(
            "a",
            vec![
                NotificationRecord::new(NotificationKind::Follow, at(1)).with_id(1),
                NotificationRecord::new(NotificationKind::Mention, at(2)).with_id(2),
            ],
            2,
        );
        history.fail_mark_all.store(true, Ordering::SeqCst);

        handle.set_lifecycle(active("a")).await.unwrap();
        wait_sockets(&connector, 1).await;
        wait_for(&handle, |s| s.unread_count == 2).await;

        let err = handle.mark_all_read().await.unwrap_err();
        assert!(matches!(err, NotifyError::Http { status: 500, .. }));
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.unread_count, 2);
        assert!(snapshot.notifications.iter().all(|m| !m.record.is_read));

        handle.mark_read(1).await.unwrap();
        assert_eq!(handle.snapshot().unread_count, 1);
        handle.mark_read(1).await.unwrap();
        assert_eq!(handle.snapshot().unread_count, 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_fills_coalesce_into_one_refresh() {
        let mut config = config();
        config.stream_window = 2;
        config.refresh_debounce = Duration::from_secs(2);
        let (handle, connector, history) = start_with(config);

        handle.set_lifecycle(active("a")).await.unwrap();
        wait_sockets(&connector, 1).await;
        connector.handshake(0).await;
        wait_for(&handle, |s| s.history_loaded).await;
        let initial = history.fetches();

        // The second and third records both fill the window.
        for (idx, secs) in [1, 2, 3].into_iter().enumerate() {
            connector
                .deliver(0, &NotificationRecord::new(NotificationKind::Mention, at(secs)))
                .await;
            wait_for(&handle, |s| s.unread.streamed as usize == (idx + 1).min(2)).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(history.fetches(), initial);

        // Past the deadline of the first fill, short of the second.
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(history.fetches(), initial);

        tokio::time::sleep(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(history.fetches(), initial + 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(history.fetches(), initial + 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_read_without_identity_fails() {
        let (handle, _connector, _history) = start();
        let err = handle.mark_read(1).await.unwrap_err();
        assert!(matches!(err, NotifyError::NoIdentity));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_close_handshake() {
        let connector = SlowCloseConnector::default();
        let handle = NotificationService::spawn(
            config(),
            Arc::new(MockHistory::default()),
            Arc::new(connector.clone()),
        )
        .unwrap();
        handle.set_lifecycle(active("a")).await.unwrap();
        wait_for(&handle, |s| s.state == ConnectionState::Connecting).await;

        handle.shutdown().await;
        let closed = connector.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].code, 1000);
        assert_eq!(closed[0].reason, "shutting down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_socket() {
        let (handle, connector, _history) = start();
        handle.set_lifecycle(active("a")).await.unwrap();
        wait_sockets(&connector, 1).await;

        handle.shutdown().await;
        assert!(!handle.is_running());
        assert_eq!(connector.close_request(0).unwrap().reason, "shutting down");
        assert!(matches!(
            handle.refresh().await,
            Err(NotifyError::ServiceStopped)
        ));
    }
}

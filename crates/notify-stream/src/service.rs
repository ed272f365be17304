//! Async driver of the notification session.
//!
//! One task owns the [`NotificationSession`] and the live socket handle. It
//! selects over user commands, socket events, the reconnect and refresh timer
//! slots, and completions of spawned REST calls, then performs the effects
//! the session returns. Consumers talk to it through a [`NotificationHandle`].

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NotifyConfig;
use crate::connection::{Connector, SocketEvent, SocketHandle, WsConnector};
use crate::error::{NotifyError, Result};
use crate::events::NotificationEvent;
use crate::history::{HistoryPage, HistoryStore, RestHistoryStore};
use crate::lifecycle::{LifecycleInputs, REASON_PROFILE_CHANGED};
use crate::reconnect::CLOSE_NORMAL;
use crate::record::Identity;
use crate::session::{Effect, FetchRequest, NotificationSession, NotificationSnapshot};

/// Upper bound on waiting for closing sockets when the service stops.
const SOCKET_CLOSE_GRACE: Duration = Duration::from_secs(5);

enum Command {
    SetLifecycle(LifecycleInputs),
    SetAuthenticated(bool),
    SetIdentity(Option<Identity>),
    SetForeground(bool),
    Logout,
    SetExternalPending(u64),
    Refresh,
    LoadMore,
    MarkRead {
        id: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    MarkAllRead {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Completion of a spawned REST call.
enum TaskOutcome {
    Page {
        request: FetchRequest,
        result: Result<HistoryPage>,
    },
    MarkRead {
        epoch: u64,
        id: i64,
        result: Result<()>,
        reply: oneshot::Sender<Result<()>>,
    },
    MarkAllRead {
        epoch: u64,
        result: Result<u64>,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug, PartialEq)]
enum CommandResult {
    Continue,
    Stop,
}

pub struct NotificationService;

impl NotificationService {
    /// Spawn the service on the current runtime.
    pub fn spawn(
        config: NotifyConfig,
        history: Arc<dyn HistoryStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<NotificationHandle> {
        config.validate()?;

        let capacity = config.event_capacity;
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (socket_tx, socket_rx) = mpsc::channel(capacity);
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(NotificationSnapshot::default());
        let cancel = CancellationToken::new();

        let driver = ServiceDriver {
            session: NotificationSession::new(config),
            history,
            connector,
            socket: None,
            closing: Vec::new(),
            socket_tx,
            socket_rx,
            task_tx,
            task_rx,
            reconnect_timer: None,
            refresh_timer: None,
            event_tx: event_tx.clone(),
            snapshot_tx,
        };
        tokio::spawn(driver.run(command_rx, cancel.clone()));

        Ok(NotificationHandle {
            command_tx,
            event_tx,
            snapshot_rx,
            cancel,
        })
    }

    /// Spawn the service against the REST backend and a WebSocket channel.
    pub fn spawn_default(config: NotifyConfig) -> Result<NotificationHandle> {
        let history = RestHistoryStore::new(&config.base_url, config.request_timeout)?;
        Self::spawn(config, Arc::new(history), Arc::new(WsConnector))
    }
}

/// Cloneable handle on a running notification service.
#[derive(Clone)]
pub struct NotificationHandle {
    command_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<NotificationEvent>,
    snapshot_rx: watch::Receiver<NotificationSnapshot>,
    cancel: CancellationToken,
}

impl NotificationHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| NotifyError::ServiceStopped)
    }

    pub async fn set_lifecycle(&self, inputs: LifecycleInputs) -> Result<()> {
        self.send(Command::SetLifecycle(inputs)).await
    }

    pub async fn set_authenticated(&self, authenticated: bool) -> Result<()> {
        self.send(Command::SetAuthenticated(authenticated)).await
    }

    pub async fn set_identity(&self, identity: Option<Identity>) -> Result<()> {
        self.send(Command::SetIdentity(identity)).await
    }

    pub async fn set_foreground(&self, foreground: bool) -> Result<()> {
        self.send(Command::SetForeground(foreground)).await
    }

    /// Drop authentication and identity; clears all streamed and cached state.
    pub async fn logout(&self) -> Result<()> {
        self.send(Command::Logout).await
    }

    /// Count owned by a sibling subsystem, added verbatim to the unread total.
    pub async fn set_external_pending(&self, count: u64) -> Result<()> {
        self.send(Command::SetExternalPending(count)).await
    }

    /// Refetch the first history page.
    pub async fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh).await
    }

    pub async fn load_more(&self) -> Result<()> {
        self.send(Command::LoadMore).await
    }

    /// Mark one record read. Local state only changes once the call succeeded.
    pub async fn mark_read(&self, id: i64) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::MarkRead { id, reply }).await?;
        rx.await.map_err(|_| NotifyError::ServiceStopped)?
    }

    /// Mark everything read. On failure nothing local changes.
    pub async fn mark_all_read(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::MarkAllRead { reply }).await?;
        rx.await.map_err(|_| NotifyError::ServiceStopped)?
    }

    pub fn snapshot(&self) -> NotificationSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<NotificationSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Stop the service without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the service and wait for it to exit, including the close
    /// handshake of the live socket (bounded by a grace period).
    pub async fn shutdown(&self) {
        if self.command_tx.send(Command::Shutdown).await.is_ok() {
            self.command_tx.closed().await;
        }
    }
}

struct ServiceDriver {
    session: NotificationSession,
    history: Arc<dyn HistoryStore>,
    connector: Arc<dyn Connector>,
    socket: Option<SocketHandle>,
    /// Socket tasks asked to close and not yet finished
    closing: Vec<JoinHandle<()>>,
    socket_tx: mpsc::Sender<SocketEvent>,
    socket_rx: mpsc::Receiver<SocketEvent>,
    task_tx: mpsc::UnboundedSender<TaskOutcome>,
    task_rx: mpsc::UnboundedReceiver<TaskOutcome>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    refresh_timer: Option<Pin<Box<Sleep>>>,
    event_tx: broadcast::Sender<NotificationEvent>,
    snapshot_tx: watch::Sender<NotificationSnapshot>,
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

impl ServiceDriver {
    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        info!("Notification service started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Notification service cancelled");
                    break;
                }

                command = command_rx.recv() => {
                    if self.handle_command(command) == CommandResult::Stop {
                        break;
                    }
                }

                Some(event) = self.socket_rx.recv() => {
                    let effects = self.session.handle_socket_event(event);
                    self.perform(effects);
                }

                Some(outcome) = self.task_rx.recv() => {
                    self.handle_outcome(outcome);
                }

                _ = wait_timer(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    let effects = self.session.reconnect_due();
                    self.perform(effects);
                }

                _ = wait_timer(&mut self.refresh_timer) => {
                    self.refresh_timer = None;
                    debug!("Debounced history refresh");
                    let effects = self.session.refresh_due();
                    self.perform(effects);
                }
            }

            self.publish();
        }

        let effects = self.session.teardown();
        self.perform(effects);
        self.publish();

        let ServiceDriver {
            socket_rx, closing, ..
        } = self;
        // Close events of retired sockets have nowhere to go now.
        drop(socket_rx);
        for task in closing {
            if timeout(SOCKET_CLOSE_GRACE, task).await.is_err() {
                debug!("Socket close handshake did not finish in time");
            }
        }
        info!("Notification service stopped");
    }

    fn handle_command(&mut self, command: Option<Command>) -> CommandResult {
        let Some(command) = command else {
            debug!("All notification handles dropped");
            return CommandResult::Stop;
        };

        let effects = match command {
            Command::SetLifecycle(inputs) => self.session.update_lifecycle(inputs),
            Command::SetAuthenticated(authenticated) => {
                self.update_inputs(|inputs| inputs.authenticated = authenticated)
            }
            Command::SetIdentity(identity) => self.update_inputs(|inputs| inputs.identity = identity),
            Command::SetForeground(foreground) => {
                self.update_inputs(|inputs| inputs.foreground = foreground)
            }
            Command::Logout => self.update_inputs(|inputs| {
                inputs.authenticated = false;
                inputs.identity = None;
            }),
            Command::SetExternalPending(count) => self.session.set_external_pending(count),
            Command::Refresh => self.session.refresh(),
            Command::LoadMore => self.session.load_more(),
            Command::MarkRead { id, reply } => {
                self.spawn_mark_read(id, reply);
                Vec::new()
            }
            Command::MarkAllRead { reply } => {
                self.spawn_mark_all_read(reply);
                Vec::new()
            }
            Command::Shutdown => return CommandResult::Stop,
        };

        self.perform(effects);
        CommandResult::Continue
    }

    fn update_inputs(&mut self, update: impl FnOnce(&mut LifecycleInputs)) -> Vec<Effect> {
        let mut inputs = self.session.lifecycle_inputs().clone();
        update(&mut inputs);
        self.session.update_lifecycle(inputs)
    }

    fn handle_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Page { request, result } => {
                let effects = match result {
                    Ok(page) => self.session.history_loaded(
                        request.epoch,
                        request.seq,
                        request.is_reset(),
                        page,
                    ),
                    Err(e) => self
                        .session
                        .history_failed(request.epoch, request.seq, &e.to_string()),
                };
                self.perform(effects);
            }
            TaskOutcome::MarkRead {
                epoch,
                id,
                result,
                reply,
            } => {
                let result = result.and_then(|()| {
                    if epoch != self.session.epoch() {
                        return Err(NotifyError::Superseded);
                    }
                    let effects = self.session.apply_mark_read(epoch, id);
                    self.perform(effects);
                    Ok(())
                });
                if let Err(e) = &result {
                    warn!(id, error = %e, "Marking notification read failed");
                }
                self.publish();
                let _ = reply.send(result);
            }
            TaskOutcome::MarkAllRead {
                epoch,
                result,
                reply,
            } => {
                let result = result.and_then(|server_unread| {
                    if epoch != self.session.epoch() {
                        return Err(NotifyError::Superseded);
                    }
                    debug!(server_unread, "Mark-all-read acknowledged");
                    let effects = self.session.apply_mark_all_read(epoch);
                    self.perform(effects);
                    Ok(())
                });
                if let Err(e) = &result {
                    warn!(error = %e, "Marking all notifications read failed");
                }
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    fn spawn_mark_read(&self, id: i64, reply: oneshot::Sender<Result<()>>) {
        let Some((epoch, identity)) = self.session.mutation_target() else {
            let _ = reply.send(Err(NotifyError::NoIdentity));
            return;
        };
        let history = Arc::clone(&self.history);
        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let result = history.mark_read(&identity, id).await;
            let _ = task_tx.send(TaskOutcome::MarkRead {
                epoch,
                id,
                result,
                reply,
            });
        });
    }

    fn spawn_mark_all_read(&self, reply: oneshot::Sender<Result<()>>) {
        let Some((epoch, identity)) = self.session.mutation_target() else {
            let _ = reply.send(Err(NotifyError::NoIdentity));
            return;
        };
        let history = Arc::clone(&self.history);
        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let result = history.mark_all_read(&identity).await;
            let _ = task_tx.send(TaskOutcome::MarkAllRead {
                epoch,
                result,
                reply,
            });
        });
    }

    fn spawn_fetch(&self, request: FetchRequest) {
        let history = Arc::clone(&self.history);
        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let result = history
                .fetch_page(&request.identity, request.cursor.as_deref())
                .await;
            let _ = task_tx.send(TaskOutcome::Page { request, result });
        });
    }

    fn perform(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Open { generation, url } => {
                    if let Some(previous) = self.socket.take() {
                        self.retire(previous, CLOSE_NORMAL, REASON_PROFILE_CHANGED);
                    }
                    self.socket = Some(self.connector.open(url, generation, self.socket_tx.clone()));
                }
                Effect::Close {
                    generation,
                    code,
                    reason,
                } => {
                    if let Some(socket) = self.socket.take_if(|s| s.generation() == generation) {
                        self.retire(socket, code, reason);
                    }
                }
                Effect::ScheduleReconnect { delay } => {
                    self.reconnect_timer = Some(Box::pin(sleep(delay)));
                }
                Effect::CancelReconnect => self.reconnect_timer = None,
                Effect::ScheduleRefresh { delay } => {
                    self.refresh_timer = Some(Box::pin(sleep(delay)));
                }
                Effect::CancelRefresh => self.refresh_timer = None,
                Effect::FetchHistory(request) => self.spawn_fetch(request),
                Effect::Emit(event) => {
                    // No subscribers is fine.
                    let _ = self.event_tx.send(event);
                }
            }
        }
    }

    fn retire(&mut self, mut socket: SocketHandle, code: u16, reason: &str) {
        socket.close(code, reason);
        self.closing.retain(|task| !task.is_finished());
        if let Some(task) = socket.take_task() {
            self.closing.push(task);
        }
    }

    fn publish(&self) {
        let snapshot = self.session.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

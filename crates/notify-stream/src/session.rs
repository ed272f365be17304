//! The single owned state object of the notification subsystem.
//!
//! [`NotificationSession`] is synchronous: every input (lifecycle change,
//! socket event, timer expiry, fetch or mutation completion) mutates the
//! session and returns the [`Effect`]s the async driver has to perform. All
//! generation, epoch and sequence checks live here.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::address::channel_url;
use crate::config::NotifyConfig;
use crate::connection::{ConnectionSignal, ConnectionState, SocketEvent, SocketEventKind};
use crate::events::NotificationEvent;
use crate::frame::{InboundFrame, parse_frame};
use crate::history::{HistoryCache, HistoryPage};
use crate::lifecycle::{
    LifecycleController, LifecycleDecision, LifecycleInputs, REASON_LOGGED_OUT,
    REASON_PROFILE_CHANGED, REASON_SHUTDOWN,
};
use crate::merge::{MergedRecord, merge};
use crate::reconnect::{CLOSE_NORMAL, CloseKind, ReconnectDecision, ReconnectTracker};
use crate::record::{Identity, NotificationRecord};
use crate::unread::{UnreadCounts, streamed_unpersisted_unread};
use crate::window::{PushOutcome, StreamWindow};

/// Side effect requested by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open a socket tagged with `generation`.
    Open { generation: u64, url: Url },
    /// Close the socket tagged with `generation`.
    Close {
        generation: u64,
        code: u16,
        reason: &'static str,
    },
    /// Arm the reconnect timer, replacing any pending one.
    ScheduleReconnect { delay: Duration },
    CancelReconnect,
    /// Arm the refresh debounce timer, replacing any pending one.
    ScheduleRefresh { delay: Duration },
    CancelRefresh,
    FetchHistory(FetchRequest),
    Emit(NotificationEvent),
}

/// A history fetch to run. The result is handed back together with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub epoch: u64,
    pub seq: u64,
    pub identity: Identity,
    /// `None` fetches (and replaces) the first page
    pub cursor: Option<String>,
}

impl FetchRequest {
    pub fn is_reset(&self) -> bool {
        self.cursor.is_none()
    }
}

/// Read-only view published after every input.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotificationSnapshot {
    pub state: ConnectionState,
    pub profile_id: Option<String>,
    pub notifications: Vec<MergedRecord>,
    pub unread: UnreadCounts,
    pub unread_count: u64,
    pub has_more: bool,
    pub history_loaded: bool,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone)]
struct ActiveConnection {
    generation: u64,
    identity: Identity,
}

#[derive(Debug, Clone, Copy)]
enum LocalRead {
    One(i64),
    All,
}

#[derive(Debug)]
pub struct NotificationSession {
    config: NotifyConfig,
    lifecycle: LifecycleController,
    generation: u64,
    active: Option<ActiveConnection>,
    state: ConnectionState,
    tracker: ReconnectTracker,
    reconnect_pending: bool,
    /// Set once reconnection was abandoned; cleared by lifecycle events only.
    pinned: bool,
    window: StreamWindow,
    history: HistoryCache,
    external_pending: u64,
    epoch: u64,
    fetch_seq: u64,
    latest_reset_seq: u64,
    load_more_seq: Option<u64>,
    /// In-flight fetch seq -> mutation seq at the time it was issued
    in_flight: HashMap<u64, u64>,
    mutation_seq: u64,
    /// Reads applied while fetches were in flight
    local_reads: Vec<(u64, LocalRead)>,
    reported_unread: u64,
}

impl NotificationSession {
    pub fn new(config: NotifyConfig) -> Self {
        let window = StreamWindow::new(config.stream_window);
        Self {
            config,
            lifecycle: LifecycleController::new(),
            generation: 0,
            active: None,
            state: ConnectionState::Idle,
            tracker: ReconnectTracker::new(),
            reconnect_pending: false,
            pinned: false,
            window,
            history: HistoryCache::new(),
            external_pending: 0,
            epoch: 0,
            fetch_seq: 0,
            latest_reset_seq: 0,
            load_more_seq: None,
            in_flight: HashMap::new(),
            mutation_seq: 0,
            local_reads: Vec::new(),
            reported_unread: 0,
        }
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation of the most recently opened socket.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn lifecycle_inputs(&self) -> &LifecycleInputs {
        self.lifecycle.inputs()
    }

    /// Identity and scope epoch a read-state mutation should run under.
    pub fn mutation_target(&self) -> Option<(u64, Identity)> {
        self.lifecycle
            .inputs()
            .scoped_identity()
            .map(|identity| (self.epoch, identity.clone()))
    }

    pub fn unread(&self) -> UnreadCounts {
        UnreadCounts {
            persisted: self.history.persisted_unread(),
            streamed: streamed_unpersisted_unread(
                self.window.iter(),
                &self.history.keys(),
                &self.config.out_of_band_kinds,
            ),
            external: self.external_pending,
        }
    }

    pub fn snapshot(&self) -> NotificationSnapshot {
        let unread = self.unread();
        NotificationSnapshot {
            state: self.state,
            profile_id: self
                .lifecycle
                .inputs()
                .scoped_identity()
                .map(|identity| identity.profile_id().to_string()),
            notifications: merge(self.history.records(), self.window.iter()),
            unread,
            unread_count: unread.total(),
            has_more: self.history.has_more(),
            history_loaded: self.history.is_loaded(),
            reconnect_attempts: self.tracker.attempts(),
        }
    }

    /// Re-evaluate the lifecycle with new inputs.
    pub fn update_lifecycle(&mut self, inputs: LifecycleInputs) -> Vec<Effect> {
        if &inputs == self.lifecycle.inputs() {
            return Vec::new();
        }

        let mut effects = Vec::new();
        let change = self.lifecycle.update(inputs);

        if change.scope_changed {
            self.reset_scope(&mut effects);
        }
        if (change.scope_changed || change.foregrounded) && self.pinned {
            info!("Lifecycle re-evaluated, retrying the notification channel");
            self.pinned = false;
            self.tracker.reset();
        }

        let live = self.active.as_ref().map(|active| active.identity.clone());
        match LifecycleController::decide(
            self.lifecycle.inputs(),
            live.as_ref(),
            self.reconnect_pending,
        ) {
            LifecycleDecision::Connect(identity) => {
                if !self.pinned {
                    self.open(identity, &mut effects);
                }
            }
            LifecycleDecision::Switch { to } => {
                self.close_active(REASON_PROFILE_CHANGED, &mut effects);
                self.open(to, &mut effects);
            }
            LifecycleDecision::Disconnect(reason) => {
                self.close_active(reason, &mut effects);
                self.cancel_reconnect(&mut effects);
            }
            LifecycleDecision::Keep => {}
        }

        if (change.scope_changed || change.foregrounded)
            && self.lifecycle.inputs().scoped_identity().is_some()
        {
            effects.push(Effect::CancelRefresh);
            self.fetch_first(&mut effects);
        }

        self.settle(effects)
    }

    /// Apply an event reported by a socket task.
    pub fn handle_socket_event(&mut self, event: SocketEvent) -> Vec<Effect> {
        let SocketEvent { generation, kind } = event;
        match &self.active {
            Some(active) if active.generation == generation => {}
            _ => {
                trace!(generation, live = self.generation, "Ignoring event from superseded socket");
                return Vec::new();
            }
        }

        let mut effects = Vec::new();
        match kind {
            SocketEventKind::Opened => {
                info!(generation, "Notification channel connected");
                self.tracker.reset();
                self.transition(ConnectionSignal::Opened, &mut effects);
            }
            SocketEventKind::Message(text) => match parse_frame(&text) {
                InboundFrame::Notification(record) => self.receive(record, &mut effects),
                InboundFrame::Ignored { kind } => {
                    trace!(generation, ?kind, "Ignoring frame for another feature");
                }
                InboundFrame::Malformed(reason) => {
                    warn!(generation, %reason, "Dropping malformed frame");
                }
            },
            SocketEventKind::Error(message) => {
                warn!(generation, %message, "Notification channel error");
                self.transition(ConnectionSignal::TransportError, &mut effects);
            }
            SocketEventKind::Closed { code, reason } => {
                self.active = None;
                self.transition(ConnectionSignal::Closed, &mut effects);

                let kind = CloseKind::from_code(code);
                if kind == CloseKind::Normal {
                    info!(generation, code, %reason, "Notification channel closed");
                } else if self.lifecycle.inputs().connect_target().is_none() {
                    debug!(generation, code, "Channel closed while no connection is wanted");
                } else {
                    warn!(generation, code, %reason, "Notification channel closed unexpectedly");
                    self.schedule_reconnect(kind, &mut effects);
                }
            }
        }

        self.settle(effects)
    }

    /// The reconnect timer fired.
    pub fn reconnect_due(&mut self) -> Vec<Effect> {
        if !self.reconnect_pending {
            return Vec::new();
        }
        self.reconnect_pending = false;

        let mut effects = Vec::new();
        if self.active.is_none() && !self.pinned {
            if let Some(identity) = self.lifecycle.inputs().connect_target().cloned() {
                debug!(attempt = self.tracker.attempts(), "Reconnecting notification channel");
                self.open(identity, &mut effects);
            }
        }
        self.settle(effects)
    }

    /// The refresh debounce timer fired.
    pub fn refresh_due(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.fetch_first(&mut effects);
        effects
    }

    /// Refetch the first page now, dropping any pending debounced refresh.
    pub fn refresh(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::CancelRefresh];
        self.fetch_first(&mut effects);
        effects
    }

    /// Fetch the next page if there is one and none is already in flight.
    pub fn load_more(&mut self) -> Vec<Effect> {
        if self.load_more_seq.is_some() || !self.history.is_loaded() {
            return Vec::new();
        }
        let Some(identity) = self.lifecycle.inputs().scoped_identity().cloned() else {
            return Vec::new();
        };
        let Some(cursor) = self.history.next_cursor().map(str::to_owned) else {
            return Vec::new();
        };

        let request = self.next_fetch(identity, Some(cursor));
        self.load_more_seq = Some(request.seq);
        vec![Effect::FetchHistory(request)]
    }

    pub fn history_loaded(
        &mut self,
        epoch: u64,
        seq: u64,
        reset: bool,
        page: HistoryPage,
    ) -> Vec<Effect> {
        let issued_at = self.in_flight.remove(&seq);
        if self.load_more_seq == Some(seq) {
            self.load_more_seq = None;
        }

        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Dropping history page of a previous identity");
            return Vec::new();
        }
        if seq < self.latest_reset_seq {
            debug!(seq, latest = self.latest_reset_seq, "Dropping superseded history page");
            self.prune_local_reads();
            return Vec::new();
        }

        let records = page.results.len();
        if reset {
            if self.load_more_seq.is_some_and(|pending| pending < seq) {
                self.load_more_seq = None;
            }
            self.history.replace_first(page);
        } else {
            self.history.append(page);
        }
        if let Some(issued_at) = issued_at {
            self.reapply_local_reads(issued_at);
        }
        self.prune_local_reads();

        debug!(
            seq,
            reset,
            records,
            pages = self.history.page_count(),
            "History page applied"
        );
        let effects = vec![Effect::Emit(NotificationEvent::HistoryUpdated {
            pages: self.history.page_count(),
            has_more: self.history.has_more(),
        })];
        self.settle(effects)
    }

    pub fn history_failed(&mut self, epoch: u64, seq: u64, error: &str) -> Vec<Effect> {
        self.in_flight.remove(&seq);
        if self.load_more_seq == Some(seq) {
            self.load_more_seq = None;
        }
        self.prune_local_reads();

        if epoch != self.epoch {
            return Vec::new();
        }
        warn!(seq, %error, "History fetch failed");
        vec![Effect::Emit(NotificationEvent::HistoryFailed {
            error: error.to_string(),
        })]
    }

    /// Apply a successful mark-one-read call.
    pub fn apply_mark_read(&mut self, epoch: u64, id: i64) -> Vec<Effect> {
        if epoch != self.epoch {
            debug!(id, "Ignoring read receipt of a previous identity");
            return Vec::new();
        }
        self.record_local_read(LocalRead::One(id));

        let streamed = self.window.mark_read(id);
        let persisted = self.history.mark_read(id);
        debug!(id, streamed, persisted, "Notification marked read");
        self.settle(Vec::new())
    }

    /// Apply a successful mark-all-read call.
    pub fn apply_mark_all_read(&mut self, epoch: u64) -> Vec<Effect> {
        if epoch != self.epoch {
            return Vec::new();
        }
        self.record_local_read(LocalRead::All);

        self.window.mark_all_read();
        self.history.mark_all_read();
        debug!("All notifications marked read");
        self.settle(Vec::new())
    }

    pub fn set_external_pending(&mut self, count: u64) -> Vec<Effect> {
        self.external_pending = count;
        self.settle(Vec::new())
    }

    /// Close everything. Safe to call repeatedly.
    pub fn teardown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.close_active(REASON_SHUTDOWN, &mut effects);
        self.cancel_reconnect(&mut effects);
        effects.push(Effect::CancelRefresh);
        effects
    }

    fn receive(&mut self, record: NotificationRecord, effects: &mut Vec<Effect>) {
        match self.window.push(record.clone()) {
            PushOutcome::Duplicate => {
                debug!(id = ?record.id, kind = %record.kind, "Ignoring replayed notification");
            }
            PushOutcome::Inserted { evicted, full } => {
                trace!(id = ?record.id, kind = %record.kind, "Notification received");
                if !evicted.is_empty() {
                    debug!(evicted = evicted.len(), "Stream window evicted oldest records");
                }
                effects.push(Effect::Emit(NotificationEvent::Received { record }));
                if full {
                    effects.push(Effect::ScheduleRefresh {
                        delay: self.config.refresh_debounce,
                    });
                }
            }
        }
    }

    fn open(&mut self, identity: Identity, effects: &mut Vec<Effect>) {
        self.cancel_reconnect(effects);

        let url = match channel_url(
            &self.config.base_url,
            &self.config.stream_path_suffix,
            &identity,
        ) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Cannot derive the notification channel address");
                self.pinned = true;
                self.transition(ConnectionSignal::GaveUp, effects);
                return;
            }
        };

        self.generation += 1;
        let generation = self.generation;
        info!(generation, profile_id = identity.profile_id(), "Opening notification channel");
        self.active = Some(ActiveConnection {
            generation,
            identity,
        });
        self.transition(ConnectionSignal::Connect, effects);
        effects.push(Effect::Open { generation, url });
    }

    fn close_active(&mut self, reason: &'static str, effects: &mut Vec<Effect>) {
        if let Some(active) = self.active.take() {
            // No socket carries this generation, so the old one goes inert.
            self.generation += 1;
            debug!(generation = active.generation, reason, "Closing notification channel");
            effects.push(Effect::Close {
                generation: active.generation,
                code: CLOSE_NORMAL,
                reason,
            });
            self.transition(ConnectionSignal::Stopped, effects);
        }
    }

    fn cancel_reconnect(&mut self, effects: &mut Vec<Effect>) {
        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        }
    }

    fn schedule_reconnect(&mut self, kind: CloseKind, effects: &mut Vec<Effect>) {
        match self.tracker.on_close(&self.config.reconnect, kind) {
            ReconnectDecision::Retry(delay) => {
                let attempt = self.tracker.attempts();
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                info!(
                    attempt,
                    delay_ms,
                    server_error = kind.is_server_error(),
                    "Scheduling reconnect"
                );
                self.reconnect_pending = true;
                effects.push(Effect::ScheduleReconnect { delay });
                effects.push(Effect::Emit(NotificationEvent::Reconnecting { attempt, delay_ms }));
            }
            ReconnectDecision::GiveUp => {
                let attempts = self.tracker.attempts();
                let consecutive_server_errors = self.tracker.consecutive_server_errors();
                error!(
                    attempts,
                    consecutive_server_errors, "Giving up on the notification channel"
                );
                self.pinned = true;
                self.transition(ConnectionSignal::GaveUp, effects);
                effects.push(Effect::Emit(NotificationEvent::ReconnectGaveUp {
                    attempts,
                    consecutive_server_errors,
                }));
            }
        }
    }

    fn reset_scope(&mut self, effects: &mut Vec<Effect>) {
        let next = self.lifecycle.inputs().scoped_identity().cloned();
        let reason = if next.is_some() {
            REASON_PROFILE_CHANGED
        } else {
            REASON_LOGGED_OUT
        };

        self.close_active(reason, effects);
        self.cancel_reconnect(effects);
        effects.push(Effect::CancelRefresh);

        self.window.clear();
        self.history.clear();
        self.tracker.reset();
        self.epoch += 1;
        self.in_flight.clear();
        self.local_reads.clear();
        self.load_more_seq = None;
        self.transition(ConnectionSignal::Reset, effects);

        let profile_id = next.map(|identity| identity.profile_id().to_string());
        info!(epoch = self.epoch, profile_id = ?profile_id, "Notification scope changed");
        effects.push(Effect::Emit(NotificationEvent::IdentityChanged { profile_id }));
    }

    fn fetch_first(&mut self, effects: &mut Vec<Effect>) {
        if let Some(identity) = self.lifecycle.inputs().scoped_identity().cloned() {
            let request = self.next_fetch(identity, None);
            effects.push(Effect::FetchHistory(request));
        }
    }

    fn next_fetch(&mut self, identity: Identity, cursor: Option<String>) -> FetchRequest {
        self.fetch_seq += 1;
        let seq = self.fetch_seq;
        if cursor.is_none() {
            self.latest_reset_seq = seq;
        }
        self.in_flight.insert(seq, self.mutation_seq);
        FetchRequest {
            epoch: self.epoch,
            seq,
            identity,
            cursor,
        }
    }

    fn record_local_read(&mut self, read: LocalRead) {
        self.mutation_seq += 1;
        if !self.in_flight.is_empty() {
            self.local_reads.push((self.mutation_seq, read));
        }
    }

    /// Re-apply reads that completed after the page was requested, since the
    /// page may predate them.
    fn reapply_local_reads(&mut self, issued_at: u64) {
        for (_, read) in self.local_reads.iter().filter(|(seq, _)| *seq > issued_at) {
            match *read {
                LocalRead::One(id) => {
                    self.history.mark_read(id);
                }
                LocalRead::All => self.history.mark_all_read(),
            }
        }
    }

    fn prune_local_reads(&mut self) {
        match self.in_flight.values().min().copied() {
            None => self.local_reads.clear(),
            Some(oldest) => self.local_reads.retain(|(seq, _)| *seq > oldest),
        }
    }

    fn transition(&mut self, signal: ConnectionSignal, effects: &mut Vec<Effect>) {
        let next = self.state.on_signal(signal);
        if next != self.state {
            trace!(from = ?self.state, to = ?next, ?signal, "Connection state changed");
            self.state = next;
            effects.push(Effect::Emit(NotificationEvent::StateChanged { state: next }));
        }
    }

    fn settle(&mut self, mut effects: Vec<Effect>) -> Vec<Effect> {
        let unread = self.unread().total();
        if unread != self.reported_unread {
            self.reported_unread = unread;
            effects.push(Effect::Emit(NotificationEvent::UnreadChanged { unread }));
        }
        effects
    }
}

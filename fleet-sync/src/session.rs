//! The engine: one injectable session per application context.
//!
//! ```text
//!               ┌──────────────────── SyncSession ─────────────────────┐
//!  transport ──►│ normalize ─► CacheSynchronizer ─► listeners / reads  │
//!  events       │     │               ▲                                │
//!               │     └─ membership ──┴─► SubscriptionManager ─► open/close
//!               │ status ─► ReconnectController ─► resubscribe         │
//!               │ presence ─► PresenceTracker                          │
//!               │ broadcast ─► TypingIndicators / BroadcastMessenger   │
//!               └──────────────┬───────────────────────────────────────┘
//!                              ▼
//!                     SessionEvent (next_event)
//! ```
//!
//! The session owns every component and is driven by one task calling
//! [`SyncSession::next_event`]. Each call waits for the earliest of an
//! inbound transport event, a reconnect deadline, a typing expiry or the
//! maintenance tick, handles it completely and reports what happened.
//! Reads are synchronous and never touch the network.

use fleet_model::{Entity, EntityId, EntityRecord, TableName};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::broadcast::{
    BroadcastEvent, BroadcastMessenger, BroadcastStats, TypingChange, TypingIndicators,
    TypingPayload, TYPING_EVENT,
};
use crate::cache::{CacheChange, CacheCollection, ListenerId};
use crate::channel::{ChannelHandle, ChannelName, ChannelStatus};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError, WriteError};
use crate::handlers::HandlerId;
use crate::membership::MembershipSet;
use crate::normalize::{ChangeEventNormalizer, MalformedPayload, NormalizerStats};
use crate::optimistic::{MutationId, OptimisticOp, PendingOptimisticEntry};
use crate::persistence::{PersistenceApi, WriteAck, WriteOp, WriteRequest};
use crate::presence::{PresenceDelta, PresenceTracker};
use crate::reconnect::{ReconnectController, ReconnectDecision};
use crate::subscription::{ChannelPlanner, ReconcileReport, StatusChange, SubscriptionManager};
use crate::synchronizer::{ApplyOutcome, CacheSynchronizer, SyncStats};
use crate::transport::{Transport, TransportEvent, TransportEventKind, WsOptions, WsTransport};

/// Something the session did in response to one wake-up.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A CDC event was applied to the cache.
    Applied {
        table: TableName,
        id: EntityId,
        outcome: ApplyOutcome,
    },
    /// Collections were flagged stale after a payload was rejected.
    Invalidated {
        channel: ChannelName,
        tables: Vec<TableName>,
        reason: MalformedPayload,
    },
    StatusChanged(StatusChange),
    /// The local user's memberships changed and channels were reconciled.
    MembershipChanged(ReconcileReport),
    PresenceChanged(PresenceDelta),
    Broadcast(BroadcastEvent),
    Typing(TypingChange),
    TypingExpired(TypingChange),
    /// Optimistic mutations never confirmed over CDC. Their values stay.
    PendingExpired(Vec<PendingOptimisticEntry>),
    Reconnecting {
        channel: ChannelName,
        attempt: u32,
        delay: std::time::Duration,
    },
    Recovered {
        channel: ChannelName,
        attempts: u32,
    },
    GaveUp {
        channel: ChannelName,
        attempts: u32,
    },
    Resynced {
        table: TableName,
        records: usize,
    },
    ResyncFailed {
        table: TableName,
        error: WriteError,
    },
    /// A maintenance tick with nothing to report.
    Idle,
}

/// Point-in-time counters across the session's components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub sync: SyncStats,
    pub normalizer: NormalizerStats,
    pub broadcast: BroadcastStats,
    pub channels: usize,
    pub pending_mutations: usize,
    pub degraded: bool,
}

pub struct SyncSession<T: Transport> {
    config: SyncConfig,
    transport: T,
    events: mpsc::Receiver<TransportEvent>,
    persistence: Arc<dyn PersistenceApi>,
    normalizer: ChangeEventNormalizer,
    synchronizer: CacheSynchronizer,
    subscriptions: SubscriptionManager,
    presence: PresenceTracker,
    messenger: BroadcastMessenger,
    typing: TypingIndicators,
    reconnect: ReconnectController,
    queue: VecDeque<SessionEvent>,
    pending_resync: BTreeSet<TableName>,
    next_maintenance: Instant,
    next_resync: Option<Instant>,
    closed: bool,
}

impl SyncSession<WsTransport> {
    /// Session over a WebSocket connection to `config.relay_url`.
    pub fn connect(config: SyncConfig, persistence: Arc<dyn PersistenceApi>) -> Result<Self> {
        config.validate()?;
        let transport = WsTransport::spawn(config.relay_url.clone(), WsOptions::from(&config));
        Self::new(config, transport, persistence)
    }
}

impl<T: Transport> SyncSession<T> {
    pub fn new(
        config: SyncConfig,
        mut transport: T,
        persistence: Arc<dyn PersistenceApi>,
    ) -> Result<Self> {
        config.validate()?;
        let events = transport
            .take_event_rx()
            .ok_or(SyncError::EventStreamTaken)?;
        let now = Instant::now();
        Ok(Self {
            subscriptions: SubscriptionManager::new(ChannelPlanner::from_config(&config)),
            presence: PresenceTracker::new(config.user_id.clone()),
            typing: TypingIndicators::new(config.typing_timeout()),
            reconnect: ReconnectController::new(config.backoff.clone()),
            next_maintenance: now + config.maintenance_interval(),
            next_resync: config.resync_interval().map(|interval| now + interval),
            normalizer: ChangeEventNormalizer::new(),
            synchronizer: CacheSynchronizer::new(),
            messenger: BroadcastMessenger::new(),
            queue: VecDeque::new(),
            pending_resync: BTreeSet::new(),
            closed: false,
            config,
            transport,
            events,
            persistence,
        })
    }

    /// Open the static and membership channels, load the membership table
    /// (which plans the room channels) and then every other bound table.
    ///
    /// Load failures leave the collection stale and are reported as
    /// [`SessionEvent::ResyncFailed`].
    pub async fn start(&mut self) -> ReconcileReport {
        let report = self.subscriptions.start(&mut self.transport);
        log::info!(
            "Session for {} started with {} channel(s)",
            self.config.user_id,
            report.opened.len()
        );
        self.queue_channel_tables(&report.opened);

        let membership = self.membership_table();
        self.resync_and_report(membership).await;
        self.drain_resyncs().await;
        report
    }

    /// Wait for and handle the next thing that happens. Returns `None`
    /// once the transport's event stream has ended.
    ///
    /// Overdue retries and timers run before any waiting transport event,
    /// so steady traffic cannot hold them back.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if self.closed {
                return None;
            }

            let now = Instant::now();
            let reconnect_at = self.reconnect.next_deadline();
            if reconnect_at.is_some_and(|deadline| now >= deadline) {
                self.run_reconnects(now);
                continue;
            }
            let timers_at = self.timer_deadline();
            if now >= timers_at {
                if let Some(event) = self.fire_timers().await {
                    return Some(event);
                }
                continue;
            }

            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        log::warn!("Transport event stream ended");
                        self.closed = true;
                    }
                },
                _ = sleep_until(reconnect_at) => self.run_reconnects(Instant::now()),
                _ = tokio::time::sleep_until(timers_at) => {
                    if let Some(event) = self.fire_timers().await {
                        return Some(event);
                    }
                    continue;
                }
            }
            self.drain_resyncs().await;
        }
    }

    /// Run whatever timers are due. Returns the first resulting event, or
    /// `Idle` for a maintenance tick that produced nothing.
    async fn fire_timers(&mut self) -> Option<SessionEvent> {
        let now = Instant::now();
        for change in self.typing.sweep(now) {
            self.queue.push_back(SessionEvent::TypingExpired(change));
        }
        let ticked = now >= self.next_maintenance;
        if ticked {
            self.run_maintenance(now);
        }
        self.drain_resyncs().await;
        match self.queue.pop_front() {
            Some(event) => Some(event),
            None if ticked => Some(SessionEvent::Idle),
            None => None,
        }
    }

    /// Earliest of the maintenance tick and the next typing expiry.
    fn timer_deadline(&self) -> Instant {
        match self.typing.next_deadline() {
            Some(expiry) => expiry.min(self.next_maintenance),
            None => self.next_maintenance,
        }
    }

    /// Handle every transport event that is already waiting, without
    /// sleeping, and return everything that resulted.
    pub async fn drain_ready(&mut self) -> Vec<SessionEvent> {
        while let Ok(event) = self.events.try_recv() {
            self.handle_transport_event(event);
            self.drain_resyncs().await;
        }
        self.queue.drain(..).collect()
    }

    /// Close every channel deliberately. Nothing is reconnected afterwards.
    pub fn shutdown(&mut self) -> Vec<ChannelName> {
        let closed = self.subscriptions.close_all(&mut self.transport);
        self.forget_channels(&closed);
        log::info!("Session for {} shut down", self.config.user_id);
        closed
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent { handle, kind } = event;
        match kind {
            TransportEventKind::Status(status) => self.handle_status(handle, status),
            TransportEventKind::Change(raw) => self.handle_change(handle, &raw),
            TransportEventKind::Broadcast { event, payload } => {
                self.handle_broadcast(handle, event, payload)
            }
            TransportEventKind::PresenceSync(presences) => {
                let Some(channel) = self.live_channel(handle) else {
                    return;
                };
                let delta = self
                    .presence
                    .handle_sync(&channel, presences, Instant::now());
                self.push_presence(delta);
            }
            TransportEventKind::PresenceDiff { joins, leaves } => {
                let Some(channel) = self.live_channel(handle) else {
                    return;
                };
                let now = Instant::now();
                let mut delta = self.presence.handle_join(&channel, joins, now);
                delta
                    .left
                    .extend(self.presence.handle_leave(&channel, leaves, now).left);
                self.push_presence(delta);
            }
        }
    }

    fn live_channel(&self, handle: ChannelHandle) -> Option<ChannelName> {
        let name = self.subscriptions.resolve_name(handle).cloned();
        if name.is_none() {
            log::trace!("Dropping event for stale handle {handle}");
        }
        name
    }

    fn handle_status(&mut self, handle: ChannelHandle, status: ChannelStatus) {
        let Some(change) = self
            .subscriptions
            .handle_status(handle, status, &mut self.transport)
        else {
            return;
        };
        let channel = change.channel.clone();
        self.queue.push_back(SessionEvent::StatusChanged(change));

        if status == ChannelStatus::Subscribed {
            self.track_self(&channel, handle);
        } else if status.is_failure() {
            self.presence.clear_self_tracked(channel.as_str());
        }

        match self.reconnect.on_status(&channel, status, Instant::now()) {
            ReconnectDecision::Scheduled { attempt, delay } => {
                self.queue.push_back(SessionEvent::Reconnecting {
                    channel,
                    attempt,
                    delay,
                });
            }
            ReconnectDecision::GaveUp { attempts } => {
                self.queue
                    .push_back(SessionEvent::GaveUp { channel, attempts });
            }
            ReconnectDecision::Reset { attempts } => {
                // Anything sent while the channel was down is lost.
                if let Some(spec) = self.subscriptions.spec(channel.as_str()) {
                    for table in spec.tables() {
                        self.synchronizer.invalidate(&table);
                        self.pending_resync.insert(table);
                    }
                }
                self.queue
                    .push_back(SessionEvent::Recovered { channel, attempts });
            }
            ReconnectDecision::AlreadyScheduled
            | ReconnectDecision::Cancelled
            | ReconnectDecision::Ignored => {}
        }
    }

    fn track_self(&mut self, channel: &ChannelName, handle: ChannelHandle) {
        let Some(spec) = self.subscriptions.spec(channel.as_str()) else {
            return;
        };
        if !self.presence.needs_self_track(channel.as_str(), spec.modes) {
            return;
        }
        let meta = self.presence.local_payload(&self.config.presence_metadata);
        self.transport.track(handle, meta);
        self.presence.mark_self_tracked(channel);
        log::debug!("Tracking {} on {channel}", self.config.user_id);
    }

    fn handle_change(&mut self, handle: ChannelHandle, raw: &Value) {
        let Some(entry) = self.subscriptions.resolve(handle) else {
            log::trace!("Dropping change for stale handle {handle}");
            return;
        };
        let channel = entry.spec().name.clone();

        let event = match self.normalizer.normalize(raw, Instant::now()) {
            Ok(event) => event,
            Err(malformed) => {
                let tables = match &malformed.table {
                    Some(table) => vec![table.clone()],
                    None => entry.spec().tables(),
                };
                for table in &tables {
                    self.synchronizer.invalidate(table);
                    self.pending_resync.insert(table.clone());
                }
                self.queue.push_back(SessionEvent::Invalidated {
                    channel,
                    tables,
                    reason: malformed,
                });
                return;
            }
        };

        let outcome = self.synchronizer.apply_change_event(&event);
        let table = event.table().clone();
        self.queue.push_back(SessionEvent::Applied {
            table: table.clone(),
            id: event.entity_id().clone(),
            outcome,
        });
        if table == self.membership_table() && outcome.changed_cache() {
            self.refresh_memberships();
        }
    }

    fn handle_broadcast(&mut self, handle: ChannelHandle, event: String, payload: Value) {
        let Some(channel) = self.live_channel(handle) else {
            return;
        };
        if event == TYPING_EVENT {
            if let Some(change) = self.typing.observe(&channel, &payload, Instant::now()) {
                self.queue.push_back(SessionEvent::Typing(change));
            }
        }
        let event = BroadcastEvent {
            channel,
            event,
            payload,
        };
        self.messenger.dispatch(&event);
        self.queue.push_back(SessionEvent::Broadcast(event));
    }

    fn push_presence(&mut self, delta: PresenceDelta) {
        if !delta.is_empty() {
            self.queue.push_back(SessionEvent::PresenceChanged(delta));
        }
    }

    fn run_reconnects(&mut self, now: Instant) {
        for channel in self.reconnect.due(now) {
            if self.subscriptions.entry(channel.as_str()).is_none() {
                log::debug!("Channel {channel} no longer wanted, dropping its retry");
                self.reconnect.cancel(&channel);
                continue;
            }
            if let Some(handle) = self
                .subscriptions
                .resubscribe(&channel, &mut self.transport)
            {
                log::info!(
                    "Resubscribing {channel} as {handle} (attempt {})",
                    self.reconnect.attempts(&channel)
                );
            }
        }
    }

    fn run_maintenance(&mut self, now: Instant) {
        self.next_maintenance = now + self.config.maintenance_interval();

        let expired = self
            .synchronizer
            .expire_pending(now, self.config.pending_timeout());
        if !expired.is_empty() {
            self.queue.push_back(SessionEvent::PendingExpired(expired));
        }

        if let Some(window) = self.config.presence_stale_after() {
            for delta in self.presence.sweep_stale(now, window) {
                self.queue.push_back(SessionEvent::PresenceChanged(delta));
            }
        }

        if let (Some(due), Some(interval)) = (self.next_resync, self.config.resync_interval()) {
            if now >= due {
                self.next_resync = Some(now + interval);
                let tables: Vec<TableName> = self.synchronizer.cache().tables().cloned().collect();
                log::debug!("Periodic resync of {} collection(s)", tables.len());
                self.pending_resync.extend(tables);
            }
        }
    }

    /// Re-derive memberships from the cached membership table and reconcile
    /// the channel set against them.
    fn refresh_memberships(&mut self) {
        let binding = &self.config.membership;
        let next = self
            .synchronizer
            .collection(&binding.table)
            .map(|collection| {
                MembershipSet::from_collection(
                    collection,
                    &binding.user_field,
                    &self.config.user_id,
                    &binding.key_field,
                )
            })
            .unwrap_or_default();
        if &next == self.subscriptions.memberships() {
            return;
        }

        let report = self.subscriptions.reconcile(&next, &mut self.transport);
        self.forget_channels(&report.closed);
        self.queue_channel_tables(&report.opened);
        if !report.is_empty() {
            self.queue.push_back(SessionEvent::MembershipChanged(report));
        }
    }

    fn forget_channels(&mut self, closed: &[ChannelName]) {
        for channel in closed {
            self.reconnect.cancel(channel);
            self.presence.forget_channel(channel.as_str());
            self.typing.forget_channel(channel.as_str());
        }
    }

    fn queue_channel_tables(&mut self, channels: &[ChannelName]) {
        let membership = self.membership_table();
        for channel in channels {
            if let Some(spec) = self.subscriptions.spec(channel.as_str()) {
                self.pending_resync.extend(
                    spec.tables()
                        .into_iter()
                        .filter(|table| *table != membership),
                );
            }
        }
    }

    async fn drain_resyncs(&mut self) {
        while let Some(table) = self.pending_resync.pop_first() {
            self.resync_and_report(table).await;
        }
    }

    async fn resync_and_report(&mut self, table: TableName) {
        match self.resync(table.clone()).await {
            Ok(records) => self
                .queue
                .push_back(SessionEvent::Resynced { table, records }),
            Err(SyncError::Resync { table, source }) => {
                self.queue.push_back(SessionEvent::ResyncFailed {
                    table,
                    error: source,
                })
            }
            Err(e) => log::error!("Resync of {table} failed: {e}"),
        }
    }

    /// Replace a collection with a fresh snapshot from the persistence API.
    /// Pending optimistic mutations are replayed on top. On failure the
    /// collection stays stale and keeps its last values.
    pub async fn resync(&mut self, table: impl Into<TableName>) -> Result<usize> {
        let table = table.into();
        self.pending_resync.remove(&table);
        let records = match self.persistence.fetch(&table).await {
            Ok(records) => records,
            Err(source) => {
                log::warn!("Resync of {table} failed: {source}");
                if !self.collection(table.as_str()).is_some_and(CacheCollection::is_stale) {
                    self.synchronizer.invalidate(&table);
                }
                return Err(SyncError::Resync { table, source });
            }
        };
        let len = self.synchronizer.replace_collection(&table, records);
        if table == self.membership_table() {
            self.refresh_memberships();
        }
        Ok(len)
    }

    /// Apply a mutation locally and build the write that persists it.
    ///
    /// An upsert of a cached record becomes an update, anything else a
    /// create. Deleting a record that is not cached is refused.
    pub fn begin_mutation(
        &mut self,
        table: impl Into<TableName>,
        op: OptimisticOp,
    ) -> Result<(MutationId, WriteRequest)> {
        let table = table.into();
        let write = match &op {
            OptimisticOp::Upsert(record) => {
                if self.record(table.as_str(), record.id().as_str()).is_some() {
                    WriteOp::Update(record.clone())
                } else {
                    WriteOp::Create(record.clone())
                }
            }
            OptimisticOp::Delete(id) => {
                if self.record(table.as_str(), id.as_str()).is_none() {
                    return Err(SyncError::MissingRecord {
                        table,
                        id: id.to_string(),
                    });
                }
                WriteOp::Delete(id.clone())
            }
        };

        let mutation_id = MutationId::new();
        self.synchronizer
            .apply_optimistic(&table, op, mutation_id, Instant::now())?;
        if table == self.membership_table() {
            self.refresh_memberships();
        }
        Ok((
            mutation_id,
            WriteRequest {
                table,
                op: write,
                mutation_id,
            },
        ))
    }

    /// Feed the persistence API's answer for a mutation started with
    /// [`begin_mutation`](Self::begin_mutation).
    ///
    /// A refused write is rolled back and returned as [`SyncError::Write`].
    pub fn complete_mutation(
        &mut self,
        mutation_id: MutationId,
        result: std::result::Result<WriteAck, WriteError>,
    ) -> Result<EntityId> {
        let table = self
            .synchronizer
            .pending()
            .get(mutation_id)
            .map(|entry| entry.table.clone());

        let outcome = match result {
            Ok(ack) => match self.synchronizer.confirm_write(mutation_id, &ack.id) {
                // The CDC confirmation (or the expiry) beat the write ack.
                Ok(()) | Err(SyncError::UnknownMutation(_)) => Ok(ack.id),
                Err(e) => Err(e),
            },
            Err(error) => {
                log::warn!("Write for mutation {mutation_id} failed: {error}");
                match self.synchronizer.rollback(mutation_id) {
                    Ok(()) => {}
                    Err(SyncError::UnknownMutation(_)) => {
                        log::warn!("Mutation {mutation_id} no longer pending, nothing to roll back");
                    }
                    Err(e) => return Err(e),
                }
                Err(SyncError::Write(error))
            }
        };

        if table.is_some_and(|table| table == self.membership_table()) {
            self.refresh_memberships();
        }
        outcome
    }

    /// Optimistic apply, persistence write, then confirm or roll back.
    /// Returns the server id of the affected record.
    pub async fn mutate(
        &mut self,
        table: impl Into<TableName>,
        op: OptimisticOp,
    ) -> Result<EntityId> {
        let (mutation_id, request) = self.begin_mutation(table, op)?;
        let result = self.persistence.write(request).await;
        self.complete_mutation(mutation_id, result)
    }

    /// Broadcast to a subscribed channel. Returns `false` if dropped.
    pub fn send_broadcast(&mut self, channel: &str, event: &str, payload: Value) -> bool {
        self.messenger.send(
            &self.subscriptions,
            &mut self.transport,
            channel,
            event,
            payload,
        )
    }

    pub fn set_typing(&mut self, channel: &str, is_typing: bool) -> bool {
        let payload = TypingPayload::new(self.config.user_id.clone(), is_typing).to_value();
        self.send_broadcast(channel, TYPING_EVENT, payload)
    }

    pub fn on_broadcast<F>(&mut self, channel: &str, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&BroadcastEvent) + Send + 'static,
    {
        self.messenger.on_event(channel, event, handler)
    }

    pub fn off_broadcast(&mut self, id: HandlerId) -> bool {
        self.messenger.off(id)
    }

    /// Register a cache change listener.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&CacheChange) + Send + 'static,
    {
        self.synchronizer.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.synchronizer.unsubscribe(id)
    }

    pub fn watch_status<F>(&mut self, handler: F) -> HandlerId
    where
        F: Fn(&StatusChange) + Send + 'static,
    {
        self.subscriptions.watch(handler)
    }

    pub fn unwatch_status(&mut self, id: HandlerId) -> bool {
        self.subscriptions.unwatch(id)
    }

    pub fn query<F>(&self, table: &str, predicate: F) -> Vec<&EntityRecord>
    where
        F: FnMut(&EntityRecord) -> bool,
    {
        self.synchronizer.query(table, predicate)
    }

    pub fn collection(&self, table: &str) -> Option<&CacheCollection> {
        self.synchronizer.collection(table)
    }

    pub fn record(&self, table: &str, id: &str) -> Option<&EntityRecord> {
        self.synchronizer.cache().get(table, id)
    }

    /// Every cached record of `E`'s table decoded as `E`, in insertion
    /// order. Records that do not decode are skipped.
    pub fn query_as<E: Entity>(&self) -> Vec<E> {
        let Some(collection) = self.collection(E::TABLE) else {
            return Vec::new();
        };
        collection
            .iter()
            .filter_map(|record| match E::from_record(record) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    log::debug!("Skipping {}/{}: {e}", E::TABLE, record.id());
                    None
                }
            })
            .collect()
    }

    pub fn record_as<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        self.record(E::TABLE, id)
            .map(E::from_record)
            .transpose()
            .map_err(SyncError::from)
    }

    /// Typed [`mutate`](Self::mutate) upsert into `E`'s table.
    pub async fn save<E: Entity>(&mut self, entity: &E) -> Result<EntityId> {
        let record = entity.to_record()?;
        self.mutate(E::table(), OptimisticOp::Upsert(record)).await
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.is_online(user_id)
    }

    pub fn online_users(&self, channel: &str) -> Vec<&str> {
        self.presence.online_users(channel)
    }

    pub fn typing_users(&self, channel: &str) -> Vec<&str> {
        self.typing.typing_users(channel)
    }

    pub fn channel_status(&self, channel: &str) -> Option<ChannelStatus> {
        self.subscriptions.status(channel)
    }

    /// True while any channel is down and not yet recovered.
    pub fn is_degraded(&self) -> bool {
        self.reconnect.is_degraded()
    }

    pub fn pending_count(&self) -> usize {
        self.synchronizer.pending_count()
    }

    pub fn memberships(&self) -> &MembershipSet {
        self.subscriptions.memberships()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn synchronizer(&self) -> &CacheSynchronizer {
        &self.synchronizer
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            sync: self.synchronizer.stats(),
            normalizer: self.normalizer.stats(),
            broadcast: self.messenger.stats(),
            channels: self.subscriptions.len(),
            pending_mutations: self.synchronizer.pending_count(),
            degraded: self.reconnect.is_degraded(),
        }
    }

    fn membership_table(&self) -> TableName {
        TableName::from(self.config.membership.table.as_str())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

//! Subscription manager: which channels are open, and in what state.
//!
//! ```text
//!            open                ack
//!   Idle ───────────► Connecting ─────► Subscribed
//!    ▲                   │                 │
//!    │   error/timeout   ▼                 │ teardown
//!    └────────────── Error/TimedOut ◄──────┤
//!                                          ▼
//!                                        Closed
//! ```
//!
//! The desired channel set is planned from the local user's memberships:
//! static channels, the user's own membership channel (the trigger for
//! recomputing memberships) and one channel per membership. Reconciling
//! against a new plan opens what is missing and closes what is no longer
//! wanted; a channel present in both plans keeps its handle.
//!
//! Every opening carries a liveness flag. It is cleared synchronously on
//! failure or teardown, before the transport has even seen the close, and
//! events are only resolved for live handles.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::{
    CdcBinding, ChannelHandle, ChannelName, ChannelSpec, ChannelStatus, DeliveryModes, RowFilter,
};
use crate::config::{MembershipBinding, ScopedBinding, SyncConfig};
use crate::handlers::{HandlerId, HandlerTable};
use crate::membership::MembershipSet;
use crate::transport::Transport;

/// Builds channel specs from the configuration and a membership set.
#[derive(Debug, Clone)]
pub struct ChannelPlanner {
    user_id: String,
    membership: MembershipBinding,
    room_prefix: String,
    room_bindings: Vec<ScopedBinding>,
    room_modes: DeliveryModes,
    static_channels: Vec<ChannelSpec>,
}

impl ChannelPlanner {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            user_id: config.user_id.clone(),
            membership: config.membership.clone(),
            room_prefix: config.room_channel_prefix.clone(),
            room_bindings: config.room_bindings.clone(),
            room_modes: config.room_modes,
            static_channels: config.static_channels.clone(),
        }
    }

    pub fn membership_channel_name(&self) -> ChannelName {
        ChannelName::new(format!("memberships:{}", self.user_id))
    }

    /// CDC on the membership table, restricted to the local user's rows.
    pub fn membership_channel(&self) -> ChannelSpec {
        ChannelSpec::new(self.membership_channel_name(), DeliveryModes::CDC).with_binding(
            CdcBinding::filtered(
                self.membership.table.as_str(),
                RowFilter::eq(&self.membership.user_field, &self.user_id),
            ),
        )
    }

    pub fn room_channel_name(&self, key: &str) -> ChannelName {
        ChannelName::new(format!("{}:{key}", self.room_prefix))
    }

    pub fn room_channel(&self, key: &str) -> ChannelSpec {
        self.room_bindings.iter().fold(
            ChannelSpec::new(self.room_channel_name(key), self.room_modes),
            |spec, binding| {
                spec.with_binding(CdcBinding::filtered(
                    binding.table.as_str(),
                    RowFilter::eq(&binding.scope_field, key),
                ))
            },
        )
    }

    /// The full desired channel set, keyed by name.
    pub fn plan(&self, memberships: &MembershipSet) -> BTreeMap<ChannelName, ChannelSpec> {
        let mut plan: BTreeMap<ChannelName, ChannelSpec> = self
            .static_channels
            .iter()
            .map(|spec| (spec.name.clone(), spec.clone()))
            .collect();
        let own = self.membership_channel();
        plan.insert(own.name.clone(), own);
        for key in memberships.iter() {
            let spec = self.room_channel(key);
            plan.insert(spec.name.clone(), spec);
        }
        plan
    }
}

/// One planned channel and its current opening.
#[derive(Debug)]
pub struct ChannelEntry {
    spec: ChannelSpec,
    handle: Option<ChannelHandle>,
    status: ChannelStatus,
    alive: Arc<AtomicBool>,
}

impl ChannelEntry {
    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.handle
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn is_live(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Result of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<ChannelName>,
    pub closed: Vec<ChannelName>,
    pub retained: Vec<ChannelName>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

/// A status transition that was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub channel: ChannelName,
    pub handle: ChannelHandle,
    pub previous: ChannelStatus,
    pub status: ChannelStatus,
}

pub struct SubscriptionManager {
    planner: ChannelPlanner,
    channels: BTreeMap<ChannelName, ChannelEntry>,
    by_handle: HashMap<ChannelHandle, ChannelName>,
    memberships: MembershipSet,
    watchers: HandlerTable<(), StatusChange>,
}

impl SubscriptionManager {
    pub fn new(planner: ChannelPlanner) -> Self {
        Self {
            planner,
            channels: BTreeMap::new(),
            by_handle: HashMap::new(),
            memberships: MembershipSet::new(),
            watchers: HandlerTable::default(),
        }
    }

    pub fn planner(&self) -> &ChannelPlanner {
        &self.planner
    }

    /// Open the static channels and the membership channel.
    pub fn start(&mut self, transport: &mut dyn Transport) -> ReconcileReport {
        let memberships = self.memberships.clone();
        self.reconcile(&memberships, transport)
    }

    /// Bring the open channel set in line with `memberships`.
    ///
    /// Channels wanted both before and after are not touched, even if the
    /// membership was removed and re-added since the last call.
    pub fn reconcile(
        &mut self,
        memberships: &MembershipSet,
        transport: &mut dyn Transport,
    ) -> ReconcileReport {
        let plan = self.planner.plan(memberships);
        let mut report = ReconcileReport::default();

        let stale: Vec<ChannelName> = self
            .channels
            .keys()
            .filter(|name| !plan.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            self.teardown(&name, transport);
            report.closed.push(name);
        }

        for (name, spec) in plan {
            if self.channels.contains_key(&name) {
                report.retained.push(name);
                continue;
            }
            self.channels.insert(
                name.clone(),
                ChannelEntry {
                    spec,
                    handle: None,
                    status: ChannelStatus::Idle,
                    alive: Arc::new(AtomicBool::new(false)),
                },
            );
            self.open(&name, transport);
            report.opened.push(name);
        }

        self.memberships = memberships.clone();
        if !report.is_empty() {
            log::info!(
                "Reconciled channels: {} opened, {} closed, {} retained",
                report.opened.len(),
                report.closed.len(),
                report.retained.len()
            );
        }
        report
    }

    fn open(&mut self, name: &ChannelName, transport: &mut dyn Transport) -> Option<ChannelHandle> {
        let entry = self.channels.get_mut(name)?;
        let handle = transport.open_channel(&entry.spec);
        entry.handle = Some(handle);
        entry.status = ChannelStatus::Connecting;
        entry.alive = Arc::new(AtomicBool::new(true));
        self.by_handle.insert(handle, name.clone());
        log::debug!("Opening channel {name} as {handle}");
        Some(handle)
    }

    /// Deliberate close. The entry is dropped.
    fn teardown(&mut self, name: &ChannelName, transport: &mut dyn Transport) -> bool {
        let Some(entry) = self.channels.remove(name) else {
            return false;
        };
        entry.alive.store(false, Ordering::Release);
        if let Some(handle) = entry.handle {
            self.by_handle.remove(&handle);
            transport.close_channel(handle);
            self.watchers.dispatch(
                &(),
                &StatusChange {
                    channel: name.clone(),
                    handle,
                    previous: entry.status,
                    status: ChannelStatus::Closed,
                },
            );
        }
        log::info!("Closed channel {name}");
        true
    }

    /// Feed a status event from the transport.
    ///
    /// Events for superseded handles and illegal transitions are dropped.
    /// On `Error`/`TimedOut` the opening is torn down at once and the
    /// channel goes back to `Idle`, awaiting a resubscription.
    pub fn handle_status(
        &mut self,
        handle: ChannelHandle,
        status: ChannelStatus,
        transport: &mut dyn Transport,
    ) -> Option<StatusChange> {
        let name = self.by_handle.get(&handle)?.clone();
        let entry = self.channels.get_mut(&name)?;
        if entry.handle != Some(handle) || entry.status == status {
            return None;
        }
        if !entry.status.can_transition_to(status) {
            log::debug!(
                "Ignoring {} -> {status} on channel {name}",
                entry.status
            );
            return None;
        }

        let change = StatusChange {
            channel: name.clone(),
            handle,
            previous: entry.status,
            status,
        };
        if status.is_failure() {
            entry.alive.store(false, Ordering::Release);
            entry.handle = None;
            entry.status = ChannelStatus::Idle;
            self.by_handle.remove(&handle);
            transport.close_channel(handle);
            log::warn!("Channel {name} is {status}");
        } else {
            entry.status = status;
            log::info!("Channel {name} is {status}");
        }
        self.watchers.dispatch(&(), &change);
        Some(change)
    }

    /// The channel for a live handle.
    pub fn resolve(&self, handle: ChannelHandle) -> Option<&ChannelEntry> {
        let name = self.by_handle.get(&handle)?;
        self.channels
            .get(name)
            .filter(|entry| entry.handle == Some(handle) && entry.is_live())
    }

    pub fn resolve_name(&self, handle: ChannelHandle) -> Option<&ChannelName> {
        self.resolve(handle).map(|entry| &entry.spec.name)
    }

    /// Reopen a channel that failed. Returns `None` if the channel is no
    /// longer planned or already has an opening.
    pub fn resubscribe(
        &mut self,
        name: &ChannelName,
        transport: &mut dyn Transport,
    ) -> Option<ChannelHandle> {
        let entry = self.channels.get(name)?;
        if entry.handle.is_some() {
            log::debug!("Channel {name} already open, skipping resubscribe");
            return None;
        }
        self.open(name, transport)
    }

    /// Tear down every channel.
    pub fn close_all(&mut self, transport: &mut dyn Transport) -> Vec<ChannelName> {
        let names: Vec<ChannelName> = self.channels.keys().cloned().collect();
        for name in &names {
            self.teardown(name, transport);
        }
        self.memberships = MembershipSet::new();
        names
    }

    /// Observe accepted status transitions (including teardown).
    pub fn watch<F>(&mut self, handler: F) -> HandlerId
    where
        F: Fn(&StatusChange) + Send + 'static,
    {
        self.watchers.insert((), handler)
    }

    pub fn unwatch(&mut self, id: HandlerId) -> bool {
        self.watchers.remove(id)
    }

    pub fn memberships(&self) -> &MembershipSet {
        &self.memberships
    }

    pub fn entry(&self, name: &str) -> Option<&ChannelEntry> {
        self.channels.get(name)
    }

    pub fn status(&self, name: &str) -> Option<ChannelStatus> {
        self.channels.get(name).map(ChannelEntry::status)
    }

    pub fn handle(&self, name: &str) -> Option<ChannelHandle> {
        self.channels.get(name).and_then(ChannelEntry::handle)
    }

    pub fn spec(&self, name: &str) -> Option<&ChannelSpec> {
        self.channels.get(name).map(ChannelEntry::spec)
    }

    /// Liveness flag of the current opening.
    pub fn liveness(&self, name: &str) -> Option<Arc<AtomicBool>> {
        self.channels.get(name).map(|entry| entry.alive.clone())
    }

    /// Handle of a channel that can carry traffic right now.
    pub fn subscribed_handle(&self, name: &str) -> Option<ChannelHandle> {
        self.channels
            .get(name)
            .filter(|entry| entry.status == ChannelStatus::Subscribed && entry.is_live())
            .and_then(ChannelEntry::handle)
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &ChannelName> {
        self.channels.keys()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

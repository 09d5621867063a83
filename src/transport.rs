//! Transport port.
//!
//! The engine never establishes connections; it only needs unicast, group
//! broadcast, and group membership. Delivery is fire-and-forget and unknown
//! targets are dropped.

use crate::membership::MembershipIndex;
use crate::protocol::ServerEvent;
use crate::types::{ConnectionId, GroupId};
use parking_lot::Mutex;
use std::collections::HashMap;

pub trait Transport: Send + Sync {
    fn unicast(&self, connection: &ConnectionId, event: ServerEvent);

    fn broadcast(&self, group: &GroupId, event: ServerEvent);

    fn join_group(&self, connection: &ConnectionId, group: &GroupId);

    fn leave_group(&self, connection: &ConnectionId, group: &GroupId);
}

#[derive(Default)]
struct MemoryState {
    attached: HashMap<ConnectionId, Vec<ServerEvent>>,
    groups: MembershipIndex<GroupId, ConnectionId>,
    /// Global delivery order, for ordering assertions
    log: Vec<(ConnectionId, ServerEvent)>,
}

/// In-process transport that records what each connection receives.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection; deliveries to unattached connections are dropped.
    pub fn attach(&self, connection: &ConnectionId) {
        self.state
            .lock()
            .attached
            .entry(connection.clone())
            .or_default();
    }

    /// Detach a connection, dropping its inbox and group memberships.
    pub fn detach(&self, connection: &ConnectionId) {
        let mut state = self.state.lock();
        state.attached.remove(connection);
        state.groups.remove_value(connection);
    }

    pub fn is_attached(&self, connection: &ConnectionId) -> bool {
        self.state.lock().attached.contains_key(connection)
    }

    /// Take everything delivered to `connection` so far.
    pub fn drain(&self, connection: &ConnectionId) -> Vec<ServerEvent> {
        self.state
            .lock()
            .attached
            .get_mut(connection)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Copy of everything delivered to `connection` and not yet drained.
    pub fn inbox(&self, connection: &ConnectionId) -> Vec<ServerEvent> {
        self.state
            .lock()
            .attached
            .get(connection)
            .cloned()
            .unwrap_or_default()
    }

    /// Every delivery in order, across connections.
    pub fn delivery_log(&self) -> Vec<(ConnectionId, ServerEvent)> {
        self.state.lock().log.clone()
    }

    pub fn group_size(&self, group: &GroupId) -> usize {
        self.state.lock().groups.count(group)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        for inbox in state.attached.values_mut() {
            inbox.clear();
        }
        state.log.clear();
    }
}

impl MemoryState {
    fn deliver(&mut self, connection: &ConnectionId, event: ServerEvent) {
        if let Some(inbox) = self.attached.get_mut(connection) {
            inbox.push(event.clone());
            self.log.push((connection.clone(), event));
        }
    }
}

impl Transport for MemoryTransport {
    fn unicast(&self, connection: &ConnectionId, event: ServerEvent) {
        self.state.lock().deliver(connection, event);
    }

    fn broadcast(&self, group: &GroupId, event: ServerEvent) {
        let mut state = self.state.lock();
        let mut members: Vec<ConnectionId> = state.groups.values_of(group).cloned().collect();
        members.sort();
        for connection in members {
            state.deliver(&connection, event.clone());
        }
    }

    fn join_group(&self, connection: &ConnectionId, group: &GroupId) {
        let mut state = self.state.lock();
        if state.attached.contains_key(connection) {
            state.groups.add(group.clone(), connection.clone());
        }
    }

    fn leave_group(&self, connection: &ConnectionId, group: &GroupId) {
        self.state.lock().groups.remove(group, connection);
    }
}

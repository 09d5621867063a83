//! A single live context: membership, phase and per-connection diff caches.

use crate::change_cache::{ChangeCache, Channel};
use crate::context::config::{ContextConfig, ContextInfo};
use crate::membership::MembershipIndex;
use crate::protocol::{ContextDescriptor, ServerEvent};
use crate::transport::Transport;
use crate::types::{ClientId, ConnectionId, ContextId};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Lifecycle of a context. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Active,
    Closed,
}

struct ContextState {
    phase: Phase,
    members: MembershipIndex<ClientId, ConnectionId>,
    cache: ChangeCache<ConnectionId>,
}

pub(crate) struct Context {
    pub descriptor: ContextDescriptor,
    pub id: ContextId,
    pub config: Arc<ContextConfig>,
    state: Mutex<ContextState>,
}

impl Context {
    pub fn new(descriptor: ContextDescriptor, id: ContextId, config: Arc<ContextConfig>) -> Self {
        Self {
            descriptor,
            id,
            config,
            state: Mutex::new(ContextState {
                phase: Phase::Uninitialized,
                members: MembershipIndex::new(),
                cache: ChangeCache::new(),
            }),
        }
    }

    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            id: self.id.clone(),
            name: self.descriptor.name.clone(),
            params: self.descriptor.params.clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn set_phase(&self, phase: Phase) {
        self.state.lock().phase = phase;
    }

    /// Distinct clients, sorted
    pub fn clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self.state.lock().members.keys().cloned().collect();
        clients.sort();
        clients
    }

    /// Member connections, sorted
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut connections: Vec<ConnectionId> =
            self.state.lock().members.values().cloned().collect();
        connections.sort();
        connections
    }

    pub fn client_of(&self, connection: &ConnectionId) -> Option<ClientId> {
        self.state.lock().members.keys_of(connection).next().cloned()
    }

    pub fn is_member(&self, connection: &ConnectionId) -> bool {
        self.state.lock().members.has_value(connection)
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().members.value_len()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Register a connection for a client. A connection maps to one client, so
    /// a connection rejoining under another identity replaces its old mapping.
    pub fn add_member(&self, client: ClientId, connection: ConnectionId) {
        let mut state = self.state.lock();
        state.members.remove_value(&connection);
        state.members.add(client, connection);
    }

    /// Remove a connection. Returns its client and whether that client has no
    /// connections left, or `None` if it was not a member.
    pub fn remove_connection(&self, connection: &ConnectionId) -> Option<(ClientId, bool)> {
        let mut state = self.state.lock();
        let client = state.members.remove_value(connection).into_iter().next()?;
        state.cache.forget(connection);
        let last = !state.members.has_key(&client);
        Some((client, last))
    }

    /// Drop every member, returning the connections that were present.
    pub fn clear_members(&self) -> Vec<ConnectionId> {
        let connections = self.connections();
        let mut state = self.state.lock();
        state.members.clear();
        state.cache.clear();
        connections
    }

    /// Push `payload` on `channel` to each target whose cached copy differs.
    /// Returns how many connections were sent the payload.
    pub fn push(
        &self,
        transport: &dyn Transport,
        channel: Channel,
        targets: &[ConnectionId],
        payload: &Value,
    ) -> usize {
        let mut state = self.state.lock();
        let mut sent = 0;
        for connection in targets {
            if !state.members.has_value(connection) {
                continue;
            }
            let emitted = state.cache.maybe_emit(connection, channel, payload, |dest, value| {
                let event = match channel {
                    Channel::Data => ServerEvent::Data {
                        id: self.id.clone(),
                        data: value.clone(),
                    },
                    Channel::Status => ServerEvent::Status {
                        id: self.id.clone(),
                        status: value.clone(),
                    },
                };
                transport.unicast(dest, event);
            });
            if emitted {
                sent += 1;
            }
        }
        sent
    }
}

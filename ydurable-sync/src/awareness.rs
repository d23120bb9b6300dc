//! Ephemeral per-client presence ("awareness") state.
//!
//! Each remote client owns one JSON state and a clock. Updates arrive as
//! [`AwarenessUpdate`]s of `(client id, clock, state-or-null)` entries.
//! A newer clock replaces the state; a `null` state at the current clock
//! removes it. Nothing here is persisted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::protocol::{AwarenessUpdate, AwarenessUpdateEntry, ProtocolError};

pub type ClientId = u64;
pub type Clock = u32;

/// States not refreshed for this long are dropped by the sweep.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: Clock,
    last_updated: Instant,
}

/// Client ids touched by one update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    /// Includes renewals whose state did not change.
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// `added ++ updated ++ removed`
    pub fn changed_clients(&self) -> Vec<ClientId> {
        let mut all = Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        all.extend_from_slice(&self.added);
        all.extend_from_slice(&self.updated);
        all.extend_from_slice(&self.removed);
        all
    }
}

/// Awareness states of every client on one document.
#[derive(Debug, Default)]
pub struct Awareness {
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, ClientMeta>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of clients that currently have a state.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn apply_update(&mut self, update: AwarenessUpdate) -> Result<AwarenessChange, ProtocolError> {
        self.apply_update_at(update, Instant::now())
    }

    fn apply_update_at(
        &mut self,
        update: AwarenessUpdate,
        now: Instant,
    ) -> Result<AwarenessChange, ProtocolError> {
        // Parse every state first so invalid JSON leaves the table untouched.
        let mut entries = Vec::with_capacity(update.clients.len());
        for (client_id, entry) in update.clients {
            let state: Value = serde_json::from_str(&entry.json)?;
            entries.push((client_id, entry.clock, state));
        }
        entries.sort_unstable_by_key(|(client_id, _, _)| *client_id);

        let mut change = AwarenessChange::default();
        for (client_id, clock, state) in entries {
            let known = self.meta.get(&client_id).copied();
            let current_clock = known.map_or(0, |m| m.clock);
            let removal = state.is_null();
            let accept = current_clock < clock
                || (current_clock == clock && removal && self.states.contains_key(&client_id));
            if !accept {
                continue;
            }
            if removal {
                self.states.remove(&client_id);
            } else {
                self.states.insert(client_id, state);
            }
            self.meta.insert(
                client_id,
                ClientMeta {
                    clock,
                    last_updated: now,
                },
            );
            match (known, removal) {
                (None, false) => change.added.push(client_id),
                (Some(_), true) => change.removed.push(client_id),
                (Some(_), false) => change.updated.push(client_id),
                (None, true) => {}
            }
        }
        Ok(change)
    }

    /// Drop the states of `client_ids`. Returns the ids that had a state.
    pub fn remove_states(&mut self, client_ids: &[ClientId]) -> Vec<ClientId> {
        client_ids
            .iter()
            .copied()
            .filter(|id| self.states.remove(id).is_some())
            .collect()
    }

    /// Remove states last refreshed `timeout` or more before `now`.
    pub fn remove_outdated_at(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let mut outdated: Vec<ClientId> = self
            .meta
            .iter()
            .filter(|(id, meta)| {
                self.states.contains_key(id)
                    && now.saturating_duration_since(meta.last_updated) >= timeout
            })
            .map(|(id, _)| *id)
            .collect();
        outdated.sort_unstable();
        self.remove_states(&outdated)
    }

    /// Current entries of `client_ids`. Removed clients carry `null` at
    /// their last clock; ids never seen are skipped.
    pub fn update_with_clients(&self, client_ids: &[ClientId]) -> AwarenessUpdate {
        let clients = client_ids
            .iter()
            .filter_map(|id| {
                let meta = self.meta.get(id)?;
                let json = self.states.get(id).unwrap_or(&Value::Null).to_string();
                Some((
                    *id,
                    AwarenessUpdateEntry {
                        clock: meta.clock,
                        json: json.into(),
                    },
                ))
            })
            .collect();
        AwarenessUpdate { clients }
    }
}

/// Build an update from explicit entries, mainly for peers and tests.
pub fn awareness_update(entries: &[(ClientId, Clock, Value)]) -> AwarenessUpdate {
    let clients = entries
        .iter()
        .map(|(id, clock, state)| {
            (
                *id,
                AwarenessUpdateEntry {
                    clock: *clock,
                    json: state.to_string().into(),
                },
            )
        })
        .collect();
    AwarenessUpdate { clients }
}

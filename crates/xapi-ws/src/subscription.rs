//! Subscription registry for the Stream channel
//!
//! Maps `(command, canonical parameters)` to the connections currently
//! subscribed, so a repeated subscribe reuses the existing stream instead of
//! opening a second one. Connections are referenced by id only; entries are
//! purged when their connection closes and pruned whenever a lookup finds
//! them pointing at a connection that is no longer live.

use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;
use xapi_types::ConnectionId;

/// Canonical key of an empty parameter set
pub const EMPTY_PARAMS: &str = "{}";

/// Result of a registry lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryMatch {
    /// Connection to use
    pub connection_id: ConnectionId,
    /// The connection is already subscribed to the exact key
    pub exact: bool,
}

type Subscribers = HashMap<ConnectionId, Instant>;

/// Active stream subscriptions
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, BTreeMap<String, Subscribers>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the preferred connection for `(command, params)`
    ///
    /// Preference: a connection subscribed to the exact key, then one
    /// subscribed to the command with empty parameters, then any connection
    /// subscribed to the command. Entries whose connection fails `is_live`
    /// are removed first and never returned.
    pub fn lookup(
        &mut self,
        command: &str,
        params: &str,
        is_live: impl Fn(&ConnectionId) -> bool,
    ) -> Option<RegistryMatch> {
        self.prune(command, &is_live);
        let by_params = self.entries.get(command)?;

        if let Some(id) = by_params.get(params).and_then(newest) {
            return Some(RegistryMatch {
                connection_id: id,
                exact: true,
            });
        }
        if let Some(id) = by_params.get(EMPTY_PARAMS).and_then(newest) {
            return Some(RegistryMatch {
                connection_id: id,
                exact: false,
            });
        }
        by_params.values().find_map(newest).map(|id| RegistryMatch {
            connection_id: id,
            exact: false,
        })
    }

    /// Record a subscription
    pub fn record(&mut self, command: &str, params: &str, connection_id: ConnectionId, at: Instant) {
        self.entries
            .entry(command.to_string())
            .or_default()
            .entry(params.to_string())
            .or_default()
            .insert(connection_id, at);
    }

    /// Whether `connection_id` is subscribed to the exact key
    pub fn contains(&self, command: &str, params: &str, connection_id: &ConnectionId) -> bool {
        self.entries
            .get(command)
            .and_then(|by_params| by_params.get(params))
            .is_some_and(|subs| subs.contains_key(connection_id))
    }

    /// Remove one connection's subscription to the exact key
    pub fn remove_entry(&mut self, command: &str, params: &str, connection_id: &ConnectionId) -> bool {
        let Some(by_params) = self.entries.get_mut(command) else {
            return false;
        };
        let removed = by_params
            .get_mut(params)
            .is_some_and(|subs| subs.remove(connection_id).is_some());
        by_params.retain(|_, subs| !subs.is_empty());
        if by_params.is_empty() {
            self.entries.remove(command);
        }
        removed
    }

    /// Remove the exact key; returns the connections that were subscribed
    pub fn remove_key(&mut self, command: &str, params: &str) -> Vec<ConnectionId> {
        let Some(by_params) = self.entries.get_mut(command) else {
            return Vec::new();
        };
        let mut ids: Vec<ConnectionId> = by_params
            .remove(params)
            .map(|subs| subs.into_keys().collect())
            .unwrap_or_default();
        ids.sort();
        if by_params.is_empty() {
            self.entries.remove(command);
        }
        ids
    }

    /// Drop every entry referencing `connection_id`; returns how many
    pub fn purge_connection(&mut self, connection_id: &ConnectionId) -> usize {
        let mut purged = 0;
        for by_params in self.entries.values_mut() {
            for subs in by_params.values_mut() {
                if subs.remove(connection_id).is_some() {
                    purged += 1;
                }
            }
            by_params.retain(|_, subs| !subs.is_empty());
        }
        self.entries.retain(|_, by_params| !by_params.is_empty());
        purged
    }

    /// Total number of (key, connection) subscriptions
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|by_params| by_params.values())
            .map(HashMap::len)
            .sum()
    }

    /// Returns true if nothing is subscribed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self, command: &str, is_live: &impl Fn(&ConnectionId) -> bool) {
        let Some(by_params) = self.entries.get_mut(command) else {
            return;
        };
        for subs in by_params.values_mut() {
            subs.retain(|id, _| is_live(id));
        }
        by_params.retain(|_, subs| !subs.is_empty());
        if by_params.is_empty() {
            self.entries.remove(command);
        }
    }
}

/// Most recently subscribed connection
fn newest(subs: &Subscribers) -> Option<ConnectionId> {
    subs.iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(id, _)| id.clone())
}

//! Concurrent registry of live subscriptions across all connections.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{ConnId, Connection},
    event::Event,
    filter::{matches_any, Filter},
};

/// One active subscription.
#[derive(Debug)]
pub struct Listener {
    pub subscription_id: String,
    pub filters: Vec<Filter>,
    cancel: CancellationToken,
}

impl Listener {
    pub fn matches(&self, ev: &Event) -> bool {
        matches_any(&self.filters, ev)
    }
}

struct Entry {
    conn: Arc<Connection>,
    listeners: HashMap<String, Listener>,
}

/// Maps connection -> subscription id -> [`Listener`].
///
/// Backed by a sharded map: registrations on one connection only lock the
/// shard holding it, and iteration holds shard read locks without ever
/// awaiting, so callers snapshot what they need and write afterwards.
#[derive(Default)]
pub struct SubscriptionRegistry {
    connections: DashMap<ConnId, Entry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a listener for `(conn, subscription_id)` and return its
    /// cancellation token. An existing listener under the same id is
    /// cancelled and replaced.
    pub fn register(
        &self,
        conn: &Arc<Connection>,
        subscription_id: &str,
        filters: Vec<Filter>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let mut entry = self.connections.entry(conn.id()).or_insert_with(|| Entry {
            conn: Arc::clone(conn),
            listeners: HashMap::new(),
        });
        if let Some(old) = entry.listeners.remove(subscription_id) {
            old.cancel.cancel();
        }
        entry.listeners.insert(
            subscription_id.to_string(),
            Listener {
                subscription_id: subscription_id.to_string(),
                filters,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    /// Remove one listener, returning whether it existed.
    pub fn unregister(&self, conn: ConnId, subscription_id: &str) -> bool {
        let Some(mut entry) = self.connections.get_mut(&conn) else {
            return false;
        };
        match entry.listeners.remove(subscription_id) {
            Some(listener) => {
                listener.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop every listener of a connection, returning how many there were.
    pub fn unregister_all(&self, conn: ConnId) -> usize {
        match self.connections.remove(&conn) {
            Some((_, entry)) => {
                for listener in entry.listeners.values() {
                    listener.cancel.cancel();
                }
                entry.listeners.len()
            }
            None => 0,
        }
    }

    /// Visit every `(connection, listener)` pair.
    ///
    /// `f` runs while shard read locks are held: it must not call back into
    /// the registry.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Connection>, &Listener)) {
        for entry in self.connections.iter() {
            for listener in entry.listeners.values() {
                f(&entry.conn, listener);
            }
        }
    }

    pub fn contains(&self, conn: ConnId, subscription_id: &str) -> bool {
        self.connections
            .get(&conn)
            .is_some_and(|entry| entry.listeners.contains_key(subscription_id))
    }

    pub fn subscription_count(&self, conn: ConnId) -> usize {
        self.connections
            .get(&conn)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Connections holding at least one registration since they opened.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

use std::{collections::HashMap, time::Duration};

use parking_lot::RwLock;
use shared::domain::UserId;
use tokio::sync::watch;

use crate::client::ConnectionHandle;

/// The online-user table.
///
/// Only the hub loop inserts and unregisters; `kick` removes directly.
/// Everything else reads. The live count is published on a watch channel so
/// shutdown can wait for it to reach zero.
pub(crate) struct Registry {
    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
    count: watch::Sender<usize>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            count: watch::Sender::new(0),
        }
    }

    pub(crate) fn get(&self, user: UserId) -> Option<ConnectionHandle> {
        self.connections.read().get(&user).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns the connection previously registered for the same user.
    pub(crate) fn insert(&self, conn: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write();
        let previous = connections.insert(conn.user(), conn);
        self.count.send_replace(connections.len());
        previous
    }

    /// Removes `conn` only if it is still the registered connection for its
    /// user; a replaced connection leaves its successor in place.
    pub(crate) fn remove_if_current(&self, conn: &ConnectionHandle) -> bool {
        let mut connections = self.connections.write();
        let current = connections
            .get(&conn.user())
            .is_some_and(|registered| registered.conn_id() == conn.conn_id());
        if current {
            connections.remove(&conn.user());
            self.count.send_replace(connections.len());
        }
        current
    }

    pub(crate) fn remove(&self, user: UserId) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write();
        let removed = connections.remove(&user);
        self.count.send_replace(connections.len());
        removed
    }

    pub(crate) fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.read().values().cloned().collect()
    }

    pub(crate) fn drain_all(&self) -> Vec<ConnectionHandle> {
        let mut connections = self.connections.write();
        let drained = connections.drain().map(|(_, conn)| conn).collect();
        self.count.send_replace(0);
        drained
    }

    /// Waits until no connection is registered. `false` on timeout.
    pub(crate) async fn wait_empty(&self, timeout: Duration) -> bool {
        let mut count = self.count.subscribe();
        tokio::time::timeout(timeout, count.wait_for(|live| *live == 0))
            .await
            .is_ok_and(|changed| changed.is_ok())
    }
}

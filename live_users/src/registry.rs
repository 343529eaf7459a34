use parking_lot::Mutex;
use std::{collections::HashMap, fmt};
use uuid::Uuid;

/// Identifier of one realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct Bindings {
    by_user: HashMap<Uuid, ConnectionId>,
    by_conn: HashMap<ConnectionId, Uuid>,
}

/// Volatile map of user identity to the connection currently tracking it.
///
/// One binding per user; a later bind supersedes an earlier one. A
/// connection resolves to at most one user.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Bindings>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user` to `conn`. Returns the connection it replaced, if any.
    pub fn bind(&self, user: Uuid, conn: ConnectionId) -> Option<ConnectionId> {
        let mut guard = self.inner.lock();
        if let Some(prev_user) = guard.by_conn.insert(conn, user) {
            if prev_user != user {
                guard.by_user.remove(&prev_user);
            }
        }
        let prev = guard.by_user.insert(user, conn);
        if let Some(old) = prev.filter(|old| *old != conn) {
            guard.by_conn.remove(&old);
            return Some(old);
        }
        None
    }

    /// Remove whatever binding `user` has.
    pub fn unbind(&self, user: &Uuid) -> Option<ConnectionId> {
        let mut guard = self.inner.lock();
        let conn = guard.by_user.remove(user)?;
        guard.by_conn.remove(&conn);
        Some(conn)
    }

    /// Remove the binding only while it still points at `conn`.
    pub fn unbind_if(&self, user: &Uuid, conn: ConnectionId) -> bool {
        let mut guard = self.inner.lock();
        if guard.by_user.get(user) != Some(&conn) {
            return false;
        }
        guard.by_user.remove(user);
        guard.by_conn.remove(&conn);
        true
    }

    pub fn find_user_by_connection(&self, conn: ConnectionId) -> Option<Uuid> {
        self.inner.lock().by_conn.get(&conn).copied()
    }

    pub fn connection_for(&self, user: &Uuid) -> Option<ConnectionId> {
        self.inner.lock().by_user.get(user).copied()
    }

    pub fn is_bound(&self, user: &Uuid, conn: ConnectionId) -> bool {
        self.inner.lock().by_user.get(user) == Some(&conn)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

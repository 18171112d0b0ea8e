//! # Sessions
//!
//! Logical groups of connections sharing a session id. A session is created
//! on first association (or explicitly with [`SessionRegistry::create`]) and
//! destroyed when its last member leaves or it is closed.
//!
//! Sessions hold [`Client`] handles only; sockets stay with their connection
//! actors. Anything addressed to members (broadcast, close) travels through
//! each member's outbound queue.
//!
//! ## Locking
//! One `RwLock` guards the session table. Member handles are cloned out of
//! the lock before any message is queued, and the lock is released before
//! touching the [`BanRegistry`], so the two registries never nest.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::client::{Client, ClientId};
use crate::error::constants::ERR_SESSION_LOCK;
use crate::error::{ProtocolError, Result};
use crate::registry::ban::{BanDuration, BanRegistry};

/// Session identifier chosen by the application
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

/// A group of member clients with a capacity limit
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    members: Vec<Client>,
    /// 0 means unlimited
    limit: usize,
    created_at: SystemTime,
}

impl Session {
    fn new(id: SessionId, limit: usize) -> Self {
        Self {
            id,
            members: Vec::new(),
            limit,
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Members in association order
    pub fn members(&self) -> &[Client] {
        &self.members
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn is_full(&self) -> bool {
        self.limit != 0 && self.members.len() >= self.limit
    }

    fn contains(&self, client: ClientId) -> bool {
        self.members.iter().any(|m| m.id() == client)
    }

    fn remove(&mut self, client: ClientId) -> Option<Client> {
        let pos = self.members.iter().position(|m| m.id() == client)?;
        Some(self.members.remove(pos))
    }
}

/// Process-wide session table
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
    default_limit: usize,
    bans: Arc<BanRegistry>,
}

impl SessionRegistry {
    /// `default_limit` applies to sessions created implicitly by `associate`.
    pub fn new(default_limit: usize, bans: Arc<BanRegistry>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            default_limit,
            bans,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<SessionId, Session>>> {
        self.sessions
            .read()
            .map_err(|_| ProtocolError::LockPoisoned(ERR_SESSION_LOCK))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<SessionId, Session>>> {
        self.sessions
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(ERR_SESSION_LOCK))
    }

    /// Create an empty session with its own limit. Returns `false` if the
    /// session already exists, in which case it is left untouched.
    pub fn create(&self, id: impl Into<SessionId>, limit: usize) -> Result<bool> {
        let id = id.into();
        let mut sessions = self.write()?;
        if sessions.contains_key(&id) {
            return Ok(false);
        }
        debug!(session = %id, limit, "Session created");
        sessions.insert(id.clone(), Session::new(id, limit));
        Ok(true)
    }

    /// Add a client to a session, creating it with the default limit if needed.
    ///
    /// Associating a client that is already a member is a no-op.
    ///
    /// # Errors
    /// `SessionFull` when the session is at its member limit.
    /// `ConnectionClosed` when the client's connection has already torn down.
    pub fn associate(&self, client: &Client, id: impl Into<SessionId>) -> Result<()> {
        let id = id.into();
        let mut sessions = self.write()?;
        // Teardown closes the queue before `remove_client` takes this lock,
        // so a client that passes here will be removed on teardown.
        if client.is_closed() {
            debug!(session = %id, client_id = %client.id(), "Refusing closed client");
            return Err(ProtocolError::ConnectionClosed);
        }
        let session = sessions
            .entry(id.clone())
            .or_insert_with(|| Session::new(id.clone(), self.default_limit));

        if session.contains(client.id()) {
            return Ok(());
        }
        if session.is_full() {
            let limit = session.limit;
            // Don't leave an implicitly created, empty session behind.
            if session.members.is_empty() {
                sessions.remove(&id);
            }
            warn!(session = %id, client_id = %client.id(), limit, "Session full");
            return Err(ProtocolError::SessionFull {
                session: id.to_string(),
                limit,
            });
        }

        session.members.push(client.clone());
        debug!(session = %id, client_id = %client.id(), members = session.members.len(), "Client joined session");
        Ok(())
    }

    /// Remove one member. The session is destroyed when it becomes empty.
    /// Returns whether the client was a member.
    pub fn leave(&self, id: &SessionId, client: ClientId) -> Result<bool> {
        let mut sessions = self.write()?;
        let Some(session) = sessions.get_mut(id) else {
            return Ok(false);
        };
        let removed = session.remove(client).is_some();
        if session.members.is_empty() {
            sessions.remove(id);
            debug!(session = %id, "Session destroyed");
        }
        Ok(removed)
    }

    /// Drop a client from every session it belongs to. Used on connection
    /// teardown; returns the sessions it left.
    pub fn remove_client(&self, client: ClientId) -> Vec<SessionId> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut left = Vec::new();
        sessions.retain(|id, session| {
            if session.remove(client).is_some() {
                left.push(id.clone());
                !session.members.is_empty()
            } else {
                true
            }
        });
        left
    }

    pub fn get_client(&self, id: &SessionId, client: ClientId) -> Option<Client> {
        let sessions = self.read().ok()?;
        sessions
            .get(id)?
            .members
            .iter()
            .find(|m| m.id() == client)
            .cloned()
    }

    /// Sessions the client is a member of
    pub fn get_sessions(&self, client: ClientId) -> Vec<SessionId> {
        let Ok(sessions) = self.read() else {
            return Vec::new();
        };
        let mut ids: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.contains(client))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of a session
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.read().ok()?.get(id).cloned()
    }

    pub fn members(&self, id: &SessionId) -> Result<Vec<Client>> {
        self.read()?
            .get(id)
            .map(|s| s.members.clone())
            .ok_or_else(|| ProtocolError::UnknownSession(id.to_string()))
    }

    /// Ban one member's address, remove it from the session and close its
    /// connection. Other members are unaffected.
    pub fn ban_client(
        &self,
        id: &SessionId,
        client: ClientId,
        duration: impl Into<BanDuration>,
    ) -> Result<Client> {
        let banned = {
            let mut sessions = self.write()?;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| ProtocolError::UnknownSession(id.to_string()))?;
            let banned = session
                .remove(client)
                .ok_or(ProtocolError::UnknownClient(client.0))?;
            if session.members.is_empty() {
                sessions.remove(id);
            }
            banned
        };

        self.bans.ban(banned.ip(), duration);
        banned.close();
        info!(session = %id, client_id = %client, peer = %banned.address(), "Session member banned");
        Ok(banned)
    }

    /// Close every member's connection and destroy the session.
    /// Returns the number of members closed.
    pub fn close(&self, id: &SessionId) -> Result<usize> {
        let session = self
            .write()?
            .remove(id)
            .ok_or_else(|| ProtocolError::UnknownSession(id.to_string()))?;

        for member in &session.members {
            member.close();
        }
        info!(session = %id, members = session.members.len(), "Session closed");
        Ok(session.members.len())
    }

    /// Queue `value` to every member. Returns how many members accepted it.
    pub fn broadcast(&self, id: &SessionId, value: Value) -> Result<usize> {
        let members = self.members(id)?;
        let delivered = members
            .iter()
            .filter(|m| m.send(value.clone()).is_ok())
            .count();
        debug!(session = %id, delivered, "Broadcast queued");
        Ok(delivered)
    }

    /// Close every member of every session and empty the table.
    /// Returns the number of sessions destroyed.
    pub fn clear(&self) -> usize {
        let drained: Vec<Session> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();

        for member in drained.iter().flat_map(|s| s.members.iter()) {
            member.close();
        }
        if !drained.is_empty() {
            debug!(sessions = drained.len(), "Sessions cleared");
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::client::Outbound;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::sync::mpsc::Receiver;

    fn client(id: u64) -> (Client, Receiver<Outbound>) {
        let addr: SocketAddr = format!("10.0.0.{id}:4000").parse().unwrap();
        Client::new(ClientId(id), addr)
    }

    fn registry(limit: usize) -> SessionRegistry {
        SessionRegistry::new(limit, Arc::new(BanRegistry::new()))
    }

    #[test]
    fn test_capacity_and_leave() {
        let sessions = registry(2);
        let (a, _ra) = client(1);
        let (b, _rb) = client(2);
        let (c, _rc) = client(3);
        let room = SessionId::from("room");

        sessions.associate(&a, "room").unwrap();
        sessions.associate(&b, "room").unwrap();
        let err = sessions.associate(&c, "room").unwrap_err();
        assert!(err.is_capacity_fault());

        assert!(sessions.leave(&room, a.id()).unwrap());
        sessions.associate(&c, "room").unwrap();
        assert_eq!(sessions.members(&room).unwrap(), vec![b, c]);
    }

    #[test]
    fn test_closed_client_cannot_take_a_slot() {
        let sessions = registry(1);
        let (gone, rx) = client(1);
        drop(rx);
        assert!(matches!(
            sessions.associate(&gone, "room"),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(sessions.is_empty());

        let (live, _rl) = client(2);
        sessions.associate(&live, "room").unwrap();
        assert_eq!(sessions.members(&"room".into()).unwrap(), vec![live]);
    }

    #[test]
    fn test_associate_is_idempotent() {
        let sessions = registry(1);
        let (a, _ra) = client(1);
        sessions.associate(&a, "solo").unwrap();
        sessions.associate(&a, "solo").unwrap();
        assert_eq!(sessions.members(&"solo".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_last_leave_destroys_session() {
        let sessions = registry(0);
        let (a, _ra) = client(1);
        sessions.associate(&a, "s").unwrap();
        sessions.leave(&"s".into(), a.id()).unwrap();
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_explicit_limit_overrides_default() {
        let sessions = registry(0);
        assert!(sessions.create("vip", 1).unwrap());
        assert!(!sessions.create("vip", 5).unwrap());

        let (a, _ra) = client(1);
        let (b, _rb) = client(2);
        sessions.associate(&a, "vip").unwrap();
        assert!(sessions.associate(&b, "vip").is_err());
    }

    #[test]
    fn test_get_sessions_and_remove_client() {
        let sessions = registry(0);
        let (a, _ra) = client(1);
        let (b, _rb) = client(2);
        sessions.associate(&a, "x").unwrap();
        sessions.associate(&a, "y").unwrap();
        sessions.associate(&b, "y").unwrap();

        assert_eq!(
            sessions.get_sessions(a.id()),
            vec![SessionId::from("x"), SessionId::from("y")]
        );

        let mut left = sessions.remove_client(a.id());
        left.sort();
        assert_eq!(left, vec![SessionId::from("x"), SessionId::from("y")]);
        assert_eq!(sessions.len(), 1);
        assert!(sessions.get_client(&"y".into(), b.id()).is_some());
        assert!(sessions.get_client(&"y".into(), a.id()).is_none());
    }

    #[test]
    fn test_ban_client_affects_only_that_member() {
        let bans = Arc::new(BanRegistry::new());
        let sessions = SessionRegistry::new(0, bans.clone());
        let (a, mut ra) = client(1);
        let (b, mut rb) = client(2);
        let id = SessionId::from("game");
        sessions.associate(&a, "game").unwrap();
        sessions.associate(&b, "game").unwrap();

        let banned = sessions.ban_client(&id, a.id(), BanDuration::Permanent).unwrap();
        assert_eq!(banned, a);
        assert!(bans.is_banned(a.ip()));
        assert!(!bans.is_banned(b.ip()));
        assert_eq!(ra.try_recv().unwrap(), Outbound::Close);
        assert!(rb.try_recv().is_err());
        assert_eq!(sessions.members(&id).unwrap(), vec![b]);
    }

    #[test]
    fn test_ban_unknown_member() {
        let sessions = registry(0);
        let (a, _ra) = client(1);
        sessions.associate(&a, "s").unwrap();
        assert!(matches!(
            sessions.ban_client(&"s".into(), ClientId(99), BanDuration::Permanent),
            Err(ProtocolError::UnknownClient(99))
        ));
        assert!(matches!(
            sessions.ban_client(&"nope".into(), a.id(), BanDuration::Permanent),
            Err(ProtocolError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_clear_closes_members() {
        let sessions = registry(0);
        let (a, mut ra) = client(1);
        let (b, mut rb) = client(2);
        sessions.associate(&a, "x").unwrap();
        sessions.associate(&b, "y").unwrap();

        assert_eq!(sessions.clear(), 2);
        assert!(sessions.is_empty());
        assert_eq!(ra.try_recv().unwrap(), Outbound::Close);
        assert_eq!(rb.try_recv().unwrap(), Outbound::Close);
        assert_eq!(sessions.clear(), 0);
    }

    #[test]
    fn test_close_and_broadcast() {
        let sessions = registry(0);
        let (a, mut ra) = client(1);
        let (b, mut rb) = client(2);
        let id = SessionId::from("chat");
        sessions.associate(&a, "chat").unwrap();
        sessions.associate(&b, "chat").unwrap();

        assert_eq!(sessions.broadcast(&id, json!({"hi": true})).unwrap(), 2);
        assert_eq!(ra.try_recv().unwrap(), Outbound::Packet(json!({"hi": true})));
        assert_eq!(rb.try_recv().unwrap(), Outbound::Packet(json!({"hi": true})));

        assert_eq!(sessions.close(&id).unwrap(), 2);
        assert_eq!(ra.try_recv().unwrap(), Outbound::Close);
        assert_eq!(rb.try_recv().unwrap(), Outbound::Close);
        assert!(sessions.close(&id).is_err());
    }
}

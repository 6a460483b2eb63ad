//! Who is in the room, under which name.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};

use serde::Serialize;
use tokio::sync::{
    Mutex, MutexGuard, Notify,
    mpsc::{self, error::TrySendError},
};
use tracing::warn;
use uuid::Uuid;

use super::msg::ServerEvent;

pub const MAX_NAME_CHARS: usize = 20;

/// Smallest outbox that holds a joiner's greeting: `nameValid` and the roster.
pub const MIN_OUTBOX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A validated display name: trimmed, 1 to 20 characters, no control
/// characters. Compared byte for byte, so `alice` and `Alice` are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DisplayName(String);

impl DisplayName {
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let name = raw.trim();
        let len = name.chars().count();
        if len == 0 {
            return Err(NameError::Empty);
        }
        if len > MAX_NAME_CHARS {
            return Err(NameError::TooLong(len));
        }
        if name.chars().any(char::is_control) {
            return Err(NameError::ControlCharacter);
        }

        Ok(Self(name.to_owned()))
    }

    /// Parses a name requested by a client. On failure the error carries
    /// [`echo`] of the input for the rejection message.
    pub fn claim(requested: &str) -> Result<Self, RegisterError> {
        Self::parse(requested).map_err(|reason| RegisterError::Invalid {
            requested: echo(requested),
            reason,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A requested name as it may be sent back or logged: trimmed and cut to
/// [`MAX_NAME_CHARS`].
pub fn echo(requested: &str) -> String {
    requested.trim().chars().take(MAX_NAME_CHARS).collect()
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name is {0} characters, at most {MAX_NAME_CHARS} allowed")]
    TooLong(usize),
    #[error("name contains control characters")]
    ControlCharacter,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("invalid name {requested:?}: {reason}")]
    Invalid { requested: String, reason: NameError },
    #[error("name {0} is already taken")]
    NameTaken(DisplayName),
    #[error("connection {0} already holds a name")]
    AlreadyRegistered(ConnId),
}

/// Sending half of a connection's outbound queue.
///
/// Delivery never waits: a full queue means the consumer is too slow, so the
/// event is dropped and the owning session is told to disconnect.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerEvent>,
    evict: Arc<Notify>,
}

impl Outbox {
    /// Capacity is raised to [`MIN_OUTBOX`] so joining never overflows.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(MIN_OUTBOX));
        let outbox = Self {
            tx,
            evict: Arc::new(Notify::new()),
        };
        (outbox, rx)
    }

    pub fn deliver(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(event = event.name(), "outbox full, evicting slow consumer");
                self.evict.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Fires once the queue has overflowed.
    pub fn eviction(&self) -> Arc<Notify> {
        self.evict.clone()
    }
}

struct Member {
    name: DisplayName,
    outbox: Outbox,
}

/// The room membership set. Only reachable through [`Registry`], so every
/// mutation happens under its lock.
#[derive(Default)]
pub struct Members {
    by_conn: HashMap<ConnId, Member>,
    by_name: HashMap<DisplayName, ConnId>,
}

impl Members {
    pub(crate) fn insert(
        &mut self,
        conn: ConnId,
        name: DisplayName,
        outbox: Outbox,
    ) -> Result<(), RegisterError> {
        if self.by_conn.contains_key(&conn) {
            return Err(RegisterError::AlreadyRegistered(conn));
        }
        if self.by_name.contains_key(&name) {
            return Err(RegisterError::NameTaken(name));
        }

        self.by_name.insert(name.clone(), conn);
        self.by_conn.insert(conn, Member { name, outbox });
        Ok(())
    }

    pub(crate) fn remove(&mut self, conn: ConnId) -> Option<DisplayName> {
        let member = self.by_conn.remove(&conn)?;
        self.by_name.remove(&member.name);
        Some(member.name)
    }

    pub fn names(&self) -> BTreeSet<DisplayName> {
        self.by_name.keys().cloned().collect()
    }

    pub fn name_of(&self, conn: ConnId) -> Option<&DisplayName> {
        self.by_conn.get(&conn).map(|m| &m.name)
    }

    pub fn outbox(&self, conn: ConnId) -> Option<&Outbox> {
        self.by_conn.get(&conn).map(|m| &m.outbox)
    }

    /// Outboxes of every member except `conn`.
    pub fn others(&self, conn: ConnId) -> impl Iterator<Item = &Outbox> {
        self.by_conn
            .iter()
            .filter(move |(id, _)| **id != conn)
            .map(|(_, m)| &m.outbox)
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }
}

#[derive(Default)]
pub struct Registry {
    members: Mutex<Members>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        conn: ConnId,
        requested: &str,
        outbox: Outbox,
    ) -> Result<DisplayName, RegisterError> {
        let (name, _members) = self.register_locked(conn, requested, outbox).await?;
        Ok(name)
    }

    pub async fn unregister(&self, conn: ConnId) -> Option<DisplayName> {
        let (name, _members) = self.unregister_locked(conn).await?;
        Some(name)
    }

    /// Claims `requested` for `conn` and hands back the lock the claim was
    /// made under, so the caller can announce it before anyone else moves.
    pub(crate) async fn register_locked(
        &self,
        conn: ConnId,
        requested: &str,
        outbox: Outbox,
    ) -> Result<(DisplayName, MutexGuard<'_, Members>), RegisterError> {
        let name = DisplayName::claim(requested)?;
        let mut members = self.members.lock().await;
        members.insert(conn, name.clone(), outbox)?;
        Ok((name, members))
    }

    /// Removes `conn`, returning its name and the still-held lock. `None`
    /// when it held no name.
    pub(crate) async fn unregister_locked(
        &self,
        conn: ConnId,
    ) -> Option<(DisplayName, MutexGuard<'_, Members>)> {
        let mut members = self.members.lock().await;
        let name = members.remove(conn)?;
        Some((name, members))
    }

    pub async fn names_snapshot(&self) -> BTreeSet<DisplayName> {
        self.members.lock().await.names()
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    /// Holds the room still so a mutation and the events describing it are
    /// published as one step.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Members> {
        self.members.lock().await
    }
}

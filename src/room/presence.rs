//! Join, leave and roster notices.
//!
//! Each notice is published while the registry lock taken for the matching
//! mutation is still held, so the room sees joins and leaves in the same
//! order the registry applied them.

use std::{collections::BTreeSet, sync::Arc};

use tracing::{debug, info};

use super::{
    msg::ServerEvent,
    registry::{ConnId, DisplayName, Members, Outbox, RegisterError, Registry},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined(DisplayName),
    Left(DisplayName),
    RosterSnapshot(BTreeSet<DisplayName>),
}

impl From<PresenceEvent> for ServerEvent {
    fn from(event: PresenceEvent) -> Self {
        match event {
            PresenceEvent::Joined(name) => ServerEvent::UserJoined(name),
            PresenceEvent::Left(name) => ServerEvent::UserLeft(name),
            PresenceEvent::RosterSnapshot(names) => ServerEvent::CurrentlyOnline(names),
        }
    }
}

/// Sends `Joined(name)` to everyone but the joiner. Returns how many
/// outboxes accepted it.
pub fn announce_join(members: &Members, joiner: ConnId, name: &DisplayName) -> usize {
    broadcast(members, joiner, PresenceEvent::Joined(name.clone()))
}

/// Sends `Left(name)` to everyone still in the room.
pub fn announce_leave(members: &Members, leaver: ConnId, name: &DisplayName) -> usize {
    broadcast(members, leaver, PresenceEvent::Left(name.clone()))
}

/// Sends the current roster to `conn` alone. The snapshot may be stale by
/// the time it is read; it is advisory.
pub fn roster_for(members: &Members, conn: ConnId) -> bool {
    let Some(outbox) = members.outbox(conn) else {
        return false;
    };
    outbox.deliver(PresenceEvent::RosterSnapshot(members.names()).into())
}

fn broadcast(members: &Members, except: ConnId, event: PresenceEvent) -> usize {
    let event = ServerEvent::from(event);
    members
        .others(except)
        .filter(|outbox| outbox.deliver(event.clone()))
        .count()
}

#[derive(Clone)]
pub struct Presence {
    registry: Arc<Registry>,
}

impl Presence {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Registers `conn` and, in the same critical section, tells it
    /// `nameValid`, hands it the roster and announces it to the room. The
    /// joiner therefore hears nothing from the room before `nameValid`.
    pub async fn join(
        &self,
        conn: ConnId,
        requested: &str,
        outbox: Outbox,
    ) -> Result<DisplayName, RegisterError> {
        let (name, members) = self
            .registry
            .register_locked(conn, requested, outbox.clone())
            .await?;

        outbox.deliver(ServerEvent::NameValid);
        roster_for(&members, conn);
        let recipients = announce_join(&members, conn, &name);

        info!(%conn, %name, online = members.len(), "joined");
        debug!(%conn, recipients, "announced join");
        Ok(name)
    }

    /// Unregisters `conn` and announces its departure. Only the call that
    /// actually removes the entry announces, so a leave goes out at most
    /// once per join.
    pub async fn leave(&self, conn: ConnId) -> Option<DisplayName> {
        let (name, members) = self.registry.unregister_locked(conn).await?;
        let recipients = announce_leave(&members, conn, &name);

        info!(%conn, %name, online = members.len(), "left");
        debug!(%conn, recipients, "announced leave");
        Some(name)
    }

    pub async fn roster_for(&self, conn: ConnId) -> bool {
        roster_for(&*self.registry.lock().await, conn)
    }
}

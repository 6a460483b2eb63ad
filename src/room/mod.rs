pub mod msg;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod session;
mod ws;

use std::{collections::BTreeSet, sync::Arc};

use axum::{Json, Router, debug_handler, extract::State, routing::get};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::AppState;

use self::{
    presence::Presence,
    registry::{DisplayName, Registry},
    relay::{Relay, RelayLimits},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::room_ws))
        .route("/online", get(currently_online))
}

/// The one room every connection joins. Cheap to clone; all clones share the
/// same registry.
#[derive(Clone)]
pub struct Room {
    registry: Arc<Registry>,
    presence: Presence,
    relay: Relay,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl Room {
    /// A room that admits at most `max_connections` open transports.
    pub fn new(limits: RelayLimits, max_connections: usize) -> Self {
        let registry = Arc::new(Registry::new());
        let max_connections = max_connections.min(Semaphore::MAX_PERMITS);
        Self {
            presence: Presence::new(registry.clone()),
            relay: Relay::new(registry.clone(), limits),
            registry,
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Open transports, named or not.
    pub fn connections(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    /// Takes a connection slot, held until the permit is dropped. `None`
    /// when the room is full.
    pub(crate) fn admit(&self) -> Option<OwnedSemaphorePermit> {
        self.slots.clone().try_acquire_owned().ok()
    }
}

#[debug_handler(state = AppState)]
async fn currently_online(State(room): State<Room>) -> Json<BTreeSet<DisplayName>> {
    Json(room.registry().names_snapshot().await)
}

//! Per-connection protocol state machine.
//!
//! `Connected` (no name) -> `Active` (registered) -> `Closed`. Only transport
//! failure closes a session; bad requests are answered and forgotten.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
    Room,
    msg::{ClientEvent, Draft, Rejection, ServerEvent},
    registry::{self, ConnId, DisplayName, Outbox, RegisterError},
    relay::RelayRejection,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Active(DisplayName),
    Closed,
}

pub struct Session {
    conn: ConnId,
    state: SessionState,
    room: Room,
    outbox: Outbox,
}

impl Session {
    pub fn new(conn: ConnId, room: Room, outbox: Outbox) -> Self {
        Self {
            conn,
            state: SessionState::Connected,
            room,
            outbox,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn awaiting_name(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::TryName(requested) => self.try_name(&requested).await,
            ClientEvent::RequestCurrentlyOnline(_) => self.request_roster().await,
            ClientEvent::SendMessage(draft) => self.send_message(draft).await,
        }
    }

    pub fn reject(&self, rejection: Rejection) {
        self.outbox.deliver(ServerEvent::RequestRejected(rejection));
    }

    async fn try_name(&mut self, requested: &str) {
        match &self.state {
            SessionState::Connected => {}
            SessionState::Active(name) => {
                let requested = registry::echo(requested);
                warn!(conn = %self.conn, %name, ?requested, "already named, ignoring tryName");
                return self.reject(Rejection::AlreadyNamed);
            }
            SessionState::Closed => return,
        }

        match self
            .room
            .presence()
            .join(self.conn, requested, self.outbox.clone())
            .await
        {
            Ok(name) => self.state = SessionState::Active(name),
            Err(RegisterError::NameTaken(name)) => {
                debug!(conn = %self.conn, %name, "name taken");
                self.outbox.deliver(ServerEvent::NameAgain(name.to_string()));
            }
            Err(RegisterError::Invalid { requested, reason }) => {
                debug!(conn = %self.conn, ?requested, %reason, "invalid name");
                self.outbox.deliver(ServerEvent::NameAgain(requested));
            }
            Err(err @ RegisterError::AlreadyRegistered(_)) => {
                warn!(conn = %self.conn, %err, "registry out of step with session");
                self.reject(Rejection::AlreadyNamed);
            }
        }
    }

    async fn request_roster(&mut self) {
        match self.state {
            SessionState::Active(_) => {
                self.room.presence().roster_for(self.conn).await;
            }
            SessionState::Connected => self.reject(Rejection::NotInRoom),
            SessionState::Closed => {}
        }
    }

    async fn send_message(&mut self, Draft { user, message }: Draft) {
        let SessionState::Active(name) = &self.state else {
            if self.state == SessionState::Connected {
                self.reject(Rejection::NotInRoom);
            }
            return;
        };
        if !user.is_empty() && user != name.as_str() {
            debug!(conn = %self.conn, %name, claimed = %user, "ignoring claimed sender");
        }

        match self.room.relay().relay(self.conn, Arc::from(message)).await {
            Ok(_) => {}
            Err(RelayRejection::Empty) => {
                debug!(conn = %self.conn, "dropped empty drawing");
            }
            Err(err @ RelayRejection::TooLarge { .. }) => {
                warn!(conn = %self.conn, %err, "rejected drawing");
                self.reject(Rejection::PayloadTooLarge);
            }
            Err(RelayRejection::NotInRoom) => self.reject(Rejection::NotInRoom),
        }
    }

    /// Transport is gone. Unregisters the connection and, if it had joined,
    /// announces the leave. Safe to call more than once.
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }

        // also covers a session that never got a name: the removal is a no-op
        if let Some(name) = self.room.presence().leave(self.conn).await {
            debug!(conn = %self.conn, %name, "session closed");
        } else {
            info!(conn = %self.conn, "closed before joining");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::mpsc::Receiver, time::timeout};

    use super::*;
    use crate::room::{msg::AuthoredMessage, registry::MAX_NAME_CHARS, relay::RelayLimits};

    fn name(s: &str) -> DisplayName {
        DisplayName::parse(s).unwrap()
    }

    fn room() -> Room {
        Room::new(RelayLimits::default(), 16)
    }

    fn connect(room: &Room) -> (Session, Receiver<ServerEvent>) {
        let (outbox, rx) = Outbox::channel(16);
        (Session::new(ConnId::new(), room.clone(), outbox), rx)
    }

    fn received(rx: &mut Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn draft(user: &str, message: &str) -> ClientEvent {
        ClientEvent::SendMessage(Draft {
            user: user.to_owned(),
            message: message.to_owned(),
        })
    }

    #[tokio::test]
    async fn alice_and_bob() {
        let room = room();

        let (mut a, mut a_rx) = connect(&room);
        a.handle(ClientEvent::TryName("Alice".into())).await;
        assert_eq!(a.state(), &SessionState::Active(name("Alice")));
        assert_eq!(
            received(&mut a_rx),
            vec![
                ServerEvent::NameValid,
                ServerEvent::CurrentlyOnline([name("Alice")].into_iter().collect()),
            ]
        );

        let (mut b, mut b_rx) = connect(&room);
        b.handle(ClientEvent::TryName("Alice".into())).await;
        assert_eq!(b.state(), &SessionState::Connected);
        assert_eq!(
            received(&mut b_rx),
            vec![ServerEvent::NameAgain("Alice".into())]
        );
        assert_eq!(
            room.registry().names_snapshot().await,
            [name("Alice")].into_iter().collect()
        );

        b.handle(ClientEvent::TryName("Bob".into())).await;
        assert_eq!(
            received(&mut b_rx),
            vec![
                ServerEvent::NameValid,
                ServerEvent::CurrentlyOnline([name("Alice"), name("Bob")].into_iter().collect()),
            ]
        );
        assert_eq!(received(&mut a_rx), vec![ServerEvent::UserJoined(name("Bob"))]);

        a.handle(draft("Alice", "img1")).await;
        assert_eq!(
            received(&mut b_rx),
            vec![ServerEvent::RecieveMessage(AuthoredMessage {
                user: name("Alice"),
                message: Arc::from("img1"),
            })]
        );
        assert!(received(&mut a_rx).is_empty());

        a.close().await;
        assert_eq!(a.state(), &SessionState::Closed);
        assert_eq!(received(&mut b_rx), vec![ServerEvent::UserLeft(name("Alice"))]);
    }

    #[tokio::test]
    async fn invalid_names_are_sent_back_to_retry() {
        let room = room();
        let (mut a, mut a_rx) = connect(&room);

        a.handle(ClientEvent::TryName(" bad\u{7}name ".into())).await;
        a.handle(ClientEvent::TryName("  ".into())).await;

        assert_eq!(a.state(), &SessionState::Connected);
        assert_eq!(
            received(&mut a_rx),
            vec![
                ServerEvent::NameAgain("bad\u{7}name".into()),
                ServerEvent::NameAgain(String::new()),
            ]
        );
        assert_eq!(room.registry().len().await, 0);
    }

    #[tokio::test]
    async fn oversized_names_are_echoed_cut_short() {
        let room = room();
        let (mut a, mut a_rx) = connect(&room);

        a.handle(ClientEvent::TryName("x".repeat(2 * 1024 * 1024))).await;

        assert_eq!(
            received(&mut a_rx),
            vec![ServerEvent::NameAgain("x".repeat(MAX_NAME_CHARS))]
        );
    }

    #[tokio::test]
    async fn tiny_outbox_still_gets_the_whole_greeting() {
        let room = room();
        let (outbox, mut rx) = Outbox::channel(1);
        let eviction = outbox.eviction();
        let mut a = Session::new(ConnId::new(), room.clone(), outbox);

        a.handle(ClientEvent::TryName("Alice".into())).await;

        assert_eq!(a.state(), &SessionState::Active(name("Alice")));
        assert_eq!(
            received(&mut rx),
            vec![
                ServerEvent::NameValid,
                ServerEvent::CurrentlyOnline([name("Alice")].into_iter().collect()),
            ]
        );
        let evicted = timeout(Duration::from_millis(50), eviction.notified()).await;
        assert!(evicted.is_err(), "joiner was evicted by its own greeting");
    }

    #[tokio::test]
    async fn renaming_while_active_is_rejected() {
        let room = room();
        let (mut a, mut a_rx) = connect(&room);
        a.handle(ClientEvent::TryName("Alice".into())).await;
        received(&mut a_rx);

        a.handle(ClientEvent::TryName("Alicia".into())).await;

        assert_eq!(a.state(), &SessionState::Active(name("Alice")));
        assert_eq!(
            received(&mut a_rx),
            vec![ServerEvent::RequestRejected(Rejection::AlreadyNamed)]
        );
        assert_eq!(
            room.registry().names_snapshot().await,
            [name("Alice")].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn unnamed_sessions_stay_out_of_the_room() {
        let room = room();
        let (mut a, mut a_rx) = connect(&room);
        let (mut b, mut b_rx) = connect(&room);
        b.handle(ClientEvent::TryName("Bob".into())).await;
        received(&mut b_rx);

        a.handle(draft("Bob", "img1")).await;
        a.handle(ClientEvent::RequestCurrentlyOnline("Bob".into())).await;

        assert_eq!(
            received(&mut a_rx),
            vec![
                ServerEvent::RequestRejected(Rejection::NotInRoom),
                ServerEvent::RequestRejected(Rejection::NotInRoom),
            ]
        );
        assert!(received(&mut b_rx).is_empty());

        // closing before joining announces nothing
        a.close().await;
        assert!(received(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn sender_name_comes_from_the_session() {
        let room = room();
        let (mut a, _a_rx) = connect(&room);
        let (mut b, mut b_rx) = connect(&room);
        a.handle(ClientEvent::TryName("Alice".into())).await;
        b.handle(ClientEvent::TryName("Bob".into())).await;
        received(&mut b_rx);

        a.handle(draft("Bob", "forged")).await;

        assert_eq!(
            received(&mut b_rx),
            vec![ServerEvent::RecieveMessage(AuthoredMessage {
                user: name("Alice"),
                message: Arc::from("forged"),
            })]
        );
    }

    #[tokio::test]
    async fn empty_and_oversized_drawings() {
        let room = Room::new(
            RelayLimits {
                max_payload_bytes: 8,
                empty_payload: Some("blank".into()),
            },
            16,
        );
        let (mut a, mut a_rx) = connect(&room);
        let (mut b, mut b_rx) = connect(&room);
        a.handle(ClientEvent::TryName("Alice".into())).await;
        b.handle(ClientEvent::TryName("Bob".into())).await;
        received(&mut a_rx);
        received(&mut b_rx);

        a.handle(draft("Alice", "blank")).await;
        a.handle(draft("Alice", "")).await;
        assert!(received(&mut a_rx).is_empty());

        a.handle(draft("Alice", "far too large")).await;
        assert_eq!(
            received(&mut a_rx),
            vec![ServerEvent::RequestRejected(Rejection::PayloadTooLarge)]
        );
        assert_eq!(a.state(), &SessionState::Active(name("Alice")));
        assert!(received(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let room = room();
        let (mut a, _a_rx) = connect(&room);
        let (mut b, mut b_rx) = connect(&room);
        a.handle(ClientEvent::TryName("Alice".into())).await;
        b.handle(ClientEvent::TryName("Bob".into())).await;
        received(&mut b_rx);

        a.close().await;
        a.close().await;
        a.handle(ClientEvent::TryName("Alice".into())).await;

        assert_eq!(received(&mut b_rx), vec![ServerEvent::UserLeft(name("Alice"))]);
        assert_eq!(
            room.registry().names_snapshot().await,
            [name("Bob")].into_iter().collect()
        );
    }
}

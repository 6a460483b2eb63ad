use std::{sync::Arc, time::Duration};

use axum::{
    debug_handler,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::OwnedSemaphorePermit,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{AppError, AppResult, AppState, Config};

use super::{
    Room,
    msg::{ClientEvent, Rejection},
    registry::{ConnId, Outbox},
    session::Session,
};

/// How long a closing connection gets to flush what is already queued.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    State(room): State<Room>,
    State(config): State<Arc<Config>>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    // the slot is taken before the handshake so a burst cannot overshoot
    let Some(slot) = room.admit() else {
        let open = room.connections();
        warn!(open, "room is full, refusing upgrade");
        return Err(AppError::RoomFull(open));
    };

    Ok(ws
        .max_message_size(config.max_frame_bytes())
        .on_upgrade(move |socket| run(socket, room, config, slot))
        .into_response())
}

async fn run(socket: WebSocket, room: Room, config: Arc<Config>, _slot: OwnedSemaphorePermit) {
    let conn = ConnId::new();
    let (outbox, mut outbound) = Outbox::channel(config.outbound_buffer);
    let evicted = outbox.eviction();
    let (mut sender, mut receiver) = socket.split();

    info!(%conn, "connected");

    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let frame = match event.to_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(%conn, event = event.name(), %err, "could not encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.close().await;
    });
    let mut writer_done = false;

    let mut session = Session::new(conn, room, outbox);
    let name_deadline = sleep(config.name_timeout.unwrap_or(Duration::ZERO));
    tokio::pin!(name_deadline);

    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => match ClientEvent::from_frame(text.as_str()) {
                    Ok(event) => session.handle(event).await,
                    Err(err) => {
                        warn!(%conn, %err, "malformed frame");
                        session.reject(Rejection::Malformed);
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    warn!(%conn, "binary frame");
                    session.reject(Rejection::Malformed);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%conn, %err, "transport error");
                    break;
                }
            },
            () = evicted.notified() => {
                warn!(%conn, "disconnecting slow consumer");
                break;
            }
            _ = &mut writer => {
                debug!(%conn, "writer stopped");
                writer_done = true;
                break;
            }
            () = &mut name_deadline, if config.name_timeout.is_some() && session.awaiting_name() => {
                info!(%conn, "no name chosen in time");
                break;
            }
        }
    }

    session.close().await;
    // dropping the last outbox lets the writer drain and close the socket
    drop(session);
    if !writer_done && timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(%conn, "disconnected");
}

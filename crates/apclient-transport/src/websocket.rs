//! WebSocket session socket.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    protocol::{decode_batch, encode_batch},
    socket::{CloseReason, ConnectionId, Outbound, SocketEvent, SocketHandle},
};

/// Open a session socket to `url`.
///
/// Returns immediately; the handle reports `is_open() == false` until the
/// I/O task emits [`SocketEvent::Opened`]. Every attempt ends with exactly
/// one [`SocketEvent::Closed`].
#[must_use]
pub fn connect(
    id: ConnectionId,
    url: String,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> SocketHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SocketHandle::connecting(id, tx);

    let task_handle = handle.clone();
    tokio::spawn(async move {
        let reason = run_socket(&task_handle, &url, rx, &events).await;
        task_handle.mark_closed();
        let _ = events.send(SocketEvent::Closed(id, reason));
    });

    handle
}

async fn run_socket(
    handle: &SocketHandle,
    url: &str,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: &mpsc::UnboundedSender<SocketEvent>,
) -> CloseReason {
    let id = handle.id();
    let ws = match connect_async(url).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            tracing::warn!(url, "Session socket connect failed: {e}");
            return CloseReason::Error(e.to_string());
        }
    };
    tracing::info!(url, id, "Session socket open");

    let (mut sender, mut receiver) = ws.split();

    // Requests queued while connecting are discarded, like a socket that
    // was not yet in the open state. A queued close still applies.
    while let Ok(request) = outbound.try_recv() {
        if request == Outbound::Close {
            let _ = sender.send(Message::Close(None)).await;
            return CloseReason::Normal;
        }
    }
    if !handle.mark_open() || events.send(SocketEvent::Opened(id)).is_err() {
        let _ = sender.send(Message::Close(None)).await;
        return CloseReason::Normal;
    }

    loop {
        tokio::select! {
            request = outbound.recv() => match request {
                Some(Outbound::Batch(commands)) => {
                    let frame = match encode_batch(&commands) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::error!("Failed to serialize commands: {e}");
                            continue;
                        }
                    };
                    tracing::debug!(id, %frame, "-> server");
                    if let Err(e) = sender.send(Message::Text(frame)).await {
                        tracing::error!("Session socket send error: {e}");
                        return CloseReason::Error(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sender.send(Message::Close(None)).await;
                    return CloseReason::Normal;
                }
            },
            incoming = receiver.next() => {
                let frame = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(s) => s,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => return CloseReason::Normal,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("Session socket error: {e}");
                        return CloseReason::Error(e.to_string());
                    }
                };
                tracing::debug!(id, %frame, "<- server");
                match decode_batch(&frame) {
                    Ok(commands) => {
                        if events.send(SocketEvent::Batch(id, commands)).is_err() {
                            return CloseReason::Normal;
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring invalid frame: {e}"),
                }
            }
        }
    }
}

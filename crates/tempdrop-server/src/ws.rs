//! WebSocket observer channel
//!
//! Each observer gets the live set as `initialFiles` on connect and then
//! every registry event as JSON text frames. An observer that falls
//! behind the event buffer is sent a fresh `initialFiles` snapshot instead
//! of the events it missed.

use crate::server::SharedState;
use crate::types::{file_views, WireEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use ephemeral_registry::{Registry, RegistryEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// `GET /ws`
pub async fn observe(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| serve_observer(socket, state))
}

async fn serve_observer(mut socket: WebSocket, state: SharedState) {
    let registry = &state.registry;
    let (snapshot, mut rx) = registry.subscribe().await;
    info!(
        observers = registry.observer_count(),
        live = snapshot.len(),
        "Observer connected"
    );

    if send(&mut socket, &WireEvent::InitialFiles(file_views(&snapshot)))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(frames) = to_frames(registry, &mut rx, received).await else {
                    break;
                };
                if let Err(e) = send_all(&mut socket, &frames).await {
                    debug!(error = %e, "Observer send failed");
                    break;
                }
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Observer connection error");
                    break;
                }
            }
        }
    }

    info!("Observer disconnected");
}

/// Turn a broadcast result into the next frames for an observer. A lagged
/// receiver is replaced and answered with a fresh snapshot; `None` means the
/// channel is closed.
async fn to_frames(
    registry: &Registry,
    rx: &mut broadcast::Receiver<RegistryEvent>,
    received: Result<RegistryEvent, RecvError>,
) -> Option<Vec<WireEvent>> {
    match received {
        Ok(event) => Some(WireEvent::from_registry(&event)),
        Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "Observer lagged, resynchronizing");
            let (snapshot, fresh) = registry.subscribe().await;
            *rx = fresh;
            Some(vec![WireEvent::InitialFiles(file_views(&snapshot))])
        }
        Err(RecvError::Closed) => None,
    }
}

async fn send_all(socket: &mut WebSocket, frames: &[WireEvent]) -> Result<(), axum::Error> {
    for frame in frames {
        send(socket, frame).await?;
    }
    Ok(())
}

async fn send(socket: &mut WebSocket, message: &WireEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}

//! Per-connection runtime: one reader task and one writer task around a
//! split WebSocket, bridged to the hub by a bounded outbound queue.
//!
//! The writer owns the sink, so the socket close has a single structural
//! owner; the reader signals shutdown through the cancellation token, which
//! racing producers may also fire.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ws::envelope::{Envelope, Payload, ProtocolError};
use crate::ws::hub::{ClientHandle, Hub};

/// The peer must show signs of life within this window or the connection is
/// presumed dead.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence: 9/10 of [`PONG_WAIT`], so a ping always lands before the
/// idle-read deadline expires.
pub const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

/// Deadline for any single write to the socket.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Outbound queue bound. A client that falls this far behind is evicted.
pub const OUTBOUND_BUFFER: usize = 256;

/// Drive one authenticated connection to completion: register with the hub,
/// run both pumps, and unregister when either side gives up.
pub async fn run_connection(socket: WebSocket, hub: Arc<Hub>, user_id: Uuid) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let session = Uuid::new_v4();
    let cancel = CancellationToken::new();

    hub.register(ClientHandle::new(user_id, session, tx, cancel.clone()));
    tracing::info!(%user_id, %session, "connection pumps started");

    let writer = tokio::spawn(write_pump(sink, rx, cancel.clone()));

    read_pump(stream, &hub, user_id).await;

    // Reader is done for whatever reason. Unregistration is unconditional;
    // the hub ignores it if this session was already displaced.
    hub.unregister(user_id, session);
    cancel.cancel();
    let _ = writer.await;
    tracing::info!(%user_id, %session, "connection pumps stopped");
}

/// Inbound loop. Each awaited receive carries the idle-read deadline; any
/// frame from the peer (pongs included) resets it.
async fn read_pump(mut stream: SplitStream<WebSocket>, hub: &Hub, user_id: Uuid) {
    loop {
        let received = match timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                tracing::warn!(%user_id, "read deadline expired, connection presumed dead");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(%user_id, error = %e, "transport receive error");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match received {
            Message::Text(text) => match dispatch(hub, user_id, text.as_str()).await {
                Ok(()) => {}
                Err(ProtocolError::Malformed(e)) => {
                    tracing::warn!(%user_id, error = %e, "dropping undecodable envelope");
                }
                Err(e @ ProtocolError::Oversized(_)) => {
                    tracing::warn!(%user_id, error = %e, "protocol violation, closing connection");
                    return;
                }
            },
            Message::Binary(_) => {
                tracing::debug!(%user_id, "ignoring binary frame on a text protocol");
            }
            // Liveness traffic; handled by the deadline reset above
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                tracing::debug!(%user_id, "peer initiated close");
                return;
            }
        }
    }
}

/// Decode one inbound frame, stamp the sender identity and receive time over
/// whatever the wire claimed, and route by kind. `Malformed` means the frame
/// is dropped; `Oversized` means the connection must close.
pub async fn dispatch(hub: &Hub, sender: Uuid, frame: &str) -> Result<(), ProtocolError> {
    let mut envelope = Envelope::decode(frame)?;
    envelope.stamp(sender);
    let outgoing = envelope.encode()?;

    match &envelope.payload {
        Payload::Chat(p) | Payload::Typing(p) => {
            hub.send_to_chat_members(p.chat_id, &outgoing, sender).await;
        }
        Payload::CallOffer(p)
        | Payload::CallAnswer(p)
        | Payload::CallReject(p)
        | Payload::CallEnd(p)
        | Payload::MessageRead(p) => {
            hub.send_to_user(p.target_user_id, &outgoing).await;
        }
        Payload::NewContact(_) => {
            tracing::debug!(%sender, "ignoring inbound new_contact, a server-to-client kind");
        }
        other => {
            tracing::debug!(%sender, kind = other.kind(), "ignoring inbound server-only envelope");
        }
    }
    Ok(())
}

/// Outbound loop: drains the queue, coalescing the backlog present at wake
/// time into one newline-joined write, and pings on a timer.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut ping = interval(PING_PERIOD);
    // Skip the immediate first tick
    ping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                return;
            }
            received = outbound.recv() => {
                let Some(mut frame) = received else {
                    // Queue closed: graceful shutdown
                    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                    return;
                };
                for _ in 0..outbound.len() {
                    match outbound.try_recv() {
                        Ok(next) => {
                            frame.push('\n');
                            frame.push_str(&next);
                        }
                        Err(_) => break,
                    }
                }
                if !matches!(
                    timeout(WRITE_WAIT, sink.send(Message::Text(frame.into()))).await,
                    Ok(Ok(()))
                ) {
                    return;
                }
            }
            _ = ping.tick() => {
                if !matches!(
                    timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new().into()))).await,
                    Ok(Ok(()))
                ) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_fits_inside_the_liveness_window() {
        assert_eq!(PING_PERIOD, PONG_WAIT * 9 / 10);
        assert!(PING_PERIOD < PONG_WAIT);
    }
}

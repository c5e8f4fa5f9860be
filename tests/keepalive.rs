//! A connected client that goes completely silent must be evicted once the
//! idle-read deadline passes, even though the socket itself stays open.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use messenger_server::auth::JwtAuthenticator;
use messenger_server::routes::build_router;
use messenger_server::state::AppState;
use messenger_server::store::{ChatMembership, MemoryChatDirectory, MemoryPresence, PresenceStore};
use messenger_server::ws::client::PONG_WAIT;
use messenger_server::ws::hub::Hub;

async fn wait_registered(hub: &Hub, user_id: Uuid, online: bool) {
    for _ in 0..200 {
        if hub.is_online(user_id).await == online {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("user {user_id} never became online={online}");
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_evicted_after_idle_deadline() {
    let auth = Arc::new(JwtAuthenticator::new(b"test-secret-test-secret-test-sec"));
    let hub = Hub::new(
        Arc::new(MemoryPresence::new()) as Arc<dyn PresenceStore>,
        Arc::new(MemoryChatDirectory::new()) as Arc<dyn ChatMembership>,
    );
    let state = AppState {
        hub: Arc::clone(&hub),
        auth: Arc::clone(&auth) as _,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    let user_id = Uuid::new_v4();
    let token = auth.issue_token(user_id, "anna", 3600).unwrap();

    // Raw upgrade handshake; after it we send nothing at all, not even pongs.
    let connected_at = Instant::now();
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /ws?token={token} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         \r\n"
    );
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut response = [0u8; 512];
    let n = socket.read(&mut response).await.unwrap();
    let status = std::str::from_utf8(&response[..n]).unwrap();
    assert!(status.starts_with("HTTP/1.1 101"), "unexpected response: {status}");

    wait_registered(&hub, user_id, true).await;

    // The reader's deadline fires as the paused clock sails past PONG_WAIT
    for _ in 0..100 {
        if !hub.is_online(user_id).await {
            break;
        }
        sleep(Duration::from_secs(5)).await;
    }
    assert!(!hub.is_online(user_id).await, "idle client was never evicted");
    let idle_for = connected_at.elapsed();
    assert!(
        idle_for >= PONG_WAIT,
        "client evicted before the idle deadline ({idle_for:?})"
    );
    assert!(
        idle_for <= PONG_WAIT + Duration::from_secs(15),
        "eviction took far longer than the idle deadline ({idle_for:?})"
    );

    drop(socket);
}

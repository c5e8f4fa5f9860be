//! End-to-end routing: inbound frames through the dispatch path, out to the
//! recipients' queues, with server-side stamping along the way.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use messenger_server::store::{ChatMembership, MemoryChatDirectory, MemoryPresence, PresenceStore};
use messenger_server::ws::client::{dispatch, OUTBOUND_BUFFER};
use messenger_server::ws::envelope::{Envelope, Payload, ProtocolError, MAX_FRAME_SIZE};
use messenger_server::ws::hub::{ClientHandle, Hub};

struct Peer {
    user_id: Uuid,
    rx: mpsc::Receiver<String>,
}

async fn connect(hub: &Hub, user_id: Uuid) -> Peer {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    hub.register(ClientHandle::new(
        user_id,
        Uuid::new_v4(),
        tx,
        CancellationToken::new(),
    ));
    for _ in 0..200 {
        if hub.is_online(user_id).await {
            return Peer { user_id, rx };
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("registration for {user_id} never completed");
}

async fn next_envelope(peer: &mut Peer) -> Envelope {
    let frame = timeout(Duration::from_secs(1), peer.rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("queue closed");
    Envelope::decode(&frame).expect("undecodable frame")
}

fn new_hub() -> (Arc<Hub>, Arc<MemoryChatDirectory>) {
    let directory = Arc::new(MemoryChatDirectory::new());
    let hub = Hub::new(
        Arc::new(MemoryPresence::new()) as Arc<dyn PresenceStore>,
        Arc::clone(&directory) as Arc<dyn ChatMembership>,
    );
    (hub, directory)
}

/// Registered members of a chat receive an inbound chat envelope; the sender
/// and non-members never do, and the envelope arrives stamped with the
/// sender's identity regardless of what the wire claimed.
#[tokio::test]
async fn chat_envelope_reaches_members_with_stamped_sender() {
    let (hub, directory) = new_hub();
    let chat = Uuid::new_v4();

    let mut a = connect(&hub, Uuid::new_v4()).await;
    let mut b = connect(&hub, Uuid::new_v4()).await;
    let mut c = connect(&hub, Uuid::new_v4()).await;
    let mut d = connect(&hub, Uuid::new_v4()).await;
    for user in [a.user_id, b.user_id, c.user_id] {
        directory.add_member(chat, user);
    }
    // Swallow the presence chatter: a sees 3 registrations, b sees 2, c sees 1
    for _ in 0..3 {
        next_envelope(&mut a).await;
    }
    for _ in 0..2 {
        next_envelope(&mut b).await;
    }
    next_envelope(&mut c).await;

    // Spoofed user_id on the wire must be overwritten
    let frame = format!(
        r#"{{"type":"chat","data":{{"chat_id":"{chat}","content":"privet"}},"user_id":"{}"}}"#,
        Uuid::new_v4()
    );
    dispatch(&hub, a.user_id, &frame).await.unwrap();

    for member in [&mut b, &mut c] {
        let envelope = next_envelope(member).await;
        assert_eq!(envelope.user_id, a.user_id);
        assert!(envelope.timestamp > 0);
        match envelope.payload {
            Payload::Chat(p) => {
                assert_eq!(p.chat_id, chat);
                assert_eq!(p.rest["content"], "privet");
            }
            other => panic!("expected chat, got {}", other.kind()),
        }
    }
    assert!(a.rx.try_recv().is_err(), "sender received its own envelope");
    assert!(d.rx.try_recv().is_err(), "non-member received the envelope");
}

/// Call signaling goes only to the target user named in the payload.
#[tokio::test]
async fn call_offer_reaches_target_only() {
    let (hub, _) = new_hub();

    let mut caller = connect(&hub, Uuid::new_v4()).await;
    let mut callee = connect(&hub, Uuid::new_v4()).await;
    let mut bystander = connect(&hub, Uuid::new_v4()).await;
    // caller saw two registrations, callee one
    for _ in 0..2 {
        next_envelope(&mut caller).await;
    }
    next_envelope(&mut callee).await;

    let frame = format!(
        r#"{{"type":"call_offer","data":{{"target_user_id":"{}","sdp":"v=0"}}}}"#,
        callee.user_id
    );
    dispatch(&hub, caller.user_id, &frame).await.unwrap();

    let envelope = next_envelope(&mut callee).await;
    assert_eq!(envelope.user_id, caller.user_id);
    match envelope.payload {
        Payload::CallOffer(p) => assert_eq!(p.target_user_id, callee.user_id),
        other => panic!("expected call_offer, got {}", other.kind()),
    }
    assert!(bystander.rx.try_recv().is_err());
}

/// Read receipts are targeted, not broadcast.
#[tokio::test]
async fn message_read_reaches_target_only() {
    let (hub, _) = new_hub();

    let mut reader = connect(&hub, Uuid::new_v4()).await;
    let mut author = connect(&hub, Uuid::new_v4()).await;
    next_envelope(&mut reader).await; // author came online

    let frame = format!(
        r#"{{"type":"message_read","data":{{"target_user_id":"{}","message_id":"{}"}}}}"#,
        author.user_id,
        Uuid::new_v4()
    );
    dispatch(&hub, reader.user_id, &frame).await.unwrap();

    let envelope = next_envelope(&mut author).await;
    assert_eq!(envelope.user_id, reader.user_id);
    assert!(matches!(envelope.payload, Payload::MessageRead(_)));
    assert!(reader.rx.try_recv().is_err());
}

/// A client sending a server-to-client kind inbound is ignored without error.
#[tokio::test]
async fn inbound_server_only_kinds_are_ignored() {
    let (hub, _) = new_hub();
    let mut sender = connect(&hub, Uuid::new_v4()).await;
    let mut other = connect(&hub, Uuid::new_v4()).await;
    next_envelope(&mut sender).await; // other came online

    let contact_frame = format!(
        r#"{{"type":"new_contact","data":{{"contact_id":"{0}","contact":{{"id":"{0}","username":"x"}}}}}}"#,
        Uuid::new_v4()
    );
    dispatch(&hub, sender.user_id, &contact_frame).await.unwrap();

    let status_frame = format!(
        r#"{{"type":"user_status","data":{{"user_id":"{}","status":"online"}}}}"#,
        sender.user_id
    );
    dispatch(&hub, sender.user_id, &status_frame).await.unwrap();

    assert!(other.rx.try_recv().is_err());
    assert!(sender.rx.try_recv().is_err());
}

/// Malformed frames drop without routing; oversized frames are fatal.
#[tokio::test]
async fn protocol_violations_route_nothing() {
    let (hub, directory) = new_hub();
    let chat = Uuid::new_v4();
    let mut sender = connect(&hub, Uuid::new_v4()).await;
    let mut member = connect(&hub, Uuid::new_v4()).await;
    directory.add_member(chat, member.user_id);
    next_envelope(&mut sender).await; // member came online

    assert!(matches!(
        dispatch(&hub, sender.user_id, "{broken").await,
        Err(ProtocolError::Malformed(_))
    ));

    let oversized = format!(
        r#"{{"type":"chat","data":{{"chat_id":"{chat}","content":"{}"}}}}"#,
        "x".repeat(MAX_FRAME_SIZE)
    );
    assert!(matches!(
        dispatch(&hub, sender.user_id, &oversized).await,
        Err(ProtocolError::Oversized(_))
    ));

    assert!(member.rx.try_recv().is_err());
}

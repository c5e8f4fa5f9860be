//! The process-wide connection registry and router.
//!
//! All registry mutation is serialized through a single control-loop task fed
//! by a command channel (register / unregister / broadcast), the actor
//! pattern the original hub uses. Low-latency reads — direct sends, online
//! checks — go through a shared read lock on the same map.
//!
//! Delivery is best-effort fire-and-forget everywhere: an offline recipient
//! is a no-op, and a recipient whose outbound queue is full is treated as
//! unresponsive and evicted on the spot.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::{ChatMembership, PresenceStore};
use crate::ws::envelope::{ContactPayload, ContactSummary, Envelope, Payload, UserStatus};

/// Registry entry for one live connection.
///
/// `session` distinguishes this connection instance from any later connection
/// by the same user: an unregister only takes effect if the registry still
/// holds the same session. Cancelling `cancel` is the close signal for the
/// connection's writer loop and is idempotent, so racing producers may all
/// fire it.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    user_id: Uuid,
    session: Uuid,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl ClientHandle {
    pub fn new(
        user_id: Uuid,
        session: Uuid,
        outbound: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            user_id,
            session,
            outbound,
            cancel,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn session(&self) -> Uuid {
        self.session
    }
}

enum HubCommand {
    Register(ClientHandle),
    Unregister { user_id: Uuid, session: Uuid },
    Broadcast { frame: String, exclude: Option<Uuid> },
}

/// Connection registry and envelope router. One per process.
pub struct Hub {
    clients: RwLock<HashMap<Uuid, ClientHandle>>,
    commands: mpsc::UnboundedSender<HubCommand>,
    presence: Arc<dyn PresenceStore>,
    membership: Arc<dyn ChatMembership>,
}

impl Hub {
    /// Create the hub and spawn its control loop. The loop runs for the
    /// process lifetime.
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        membership: Arc<dyn ChatMembership>,
    ) -> Arc<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            commands,
            presence,
            membership,
        });
        tokio::spawn(Arc::clone(&hub).run(rx));
        hub
    }

    /// Control loop: the sole serialization point for registry writes.
    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register(handle) => self.admit(handle).await,
                HubCommand::Unregister { user_id, session } => {
                    self.discard(user_id, session).await;
                }
                HubCommand::Broadcast { frame, exclude } => {
                    self.deliver_broadcast(&frame, exclude).await;
                }
            }
        }
    }

    /// Queue a client for admission. Called once per accepted connection.
    pub fn register(&self, handle: ClientHandle) {
        let _ = self.commands.send(HubCommand::Register(handle));
    }

    /// Queue removal of a client. No-op if `session` no longer matches the
    /// registry entry (the connection was already displaced by a reconnect).
    pub fn unregister(&self, user_id: Uuid, session: Uuid) {
        let _ = self.commands.send(HubCommand::Unregister { user_id, session });
    }

    /// Queue a frame for delivery to every connected client.
    pub fn broadcast(&self, frame: String) {
        let _ = self.commands.send(HubCommand::Broadcast {
            frame,
            exclude: None,
        });
    }

    async fn admit(&self, handle: ClientHandle) {
        let user_id = handle.user_id;
        let displaced = {
            let mut clients = self.clients.write().await;
            clients.insert(user_id, handle)
        };
        if let Some(old) = displaced {
            // Reconnect: last writer wins, force the old session closed
            tracing::info!(%user_id, old_session = %old.session, "displacing previous session");
            old.cancel.cancel();
        }

        let presence = Arc::clone(&self.presence);
        tokio::spawn(async move {
            if let Err(e) = presence.set_online(user_id).await {
                tracing::warn!(%user_id, error = %e, "failed to persist online status");
            }
        });

        match Envelope::user_status(user_id, UserStatus::Online).encode() {
            Ok(frame) => self.deliver_broadcast(&frame, Some(user_id)).await,
            Err(e) => tracing::error!(%user_id, error = %e, "failed to encode status envelope"),
        }

        tracing::info!(%user_id, "client connected");
    }

    async fn discard(&self, user_id: Uuid, session: Uuid) {
        let removed = {
            let mut clients = self.clients.write().await;
            match clients.get(&user_id) {
                Some(current) if current.session == session => clients.remove(&user_id),
                _ => None,
            }
        };
        let Some(old) = removed else {
            // The registrant changed under us: a displaced session reporting
            // its own shutdown. Its successor must stay.
            tracing::debug!(%user_id, %session, "stale unregister ignored");
            return;
        };
        old.cancel.cancel();

        let presence = Arc::clone(&self.presence);
        tokio::spawn(async move {
            if let Err(e) = presence.set_offline(user_id).await {
                tracing::warn!(%user_id, error = %e, "failed to persist offline status");
            }
        });

        match Envelope::user_status(user_id, UserStatus::Offline).encode() {
            Ok(frame) => self.deliver_broadcast(&frame, Some(user_id)).await,
            Err(e) => tracing::error!(%user_id, error = %e, "failed to encode status envelope"),
        }

        tracing::info!(%user_id, "client disconnected");
    }

    /// Deliver a frame to every registered client except `exclude`, evicting
    /// any client whose queue is full. Eviction happens under the same write
    /// lock as the iteration so it cannot race other registry mutation.
    async fn deliver_broadcast(&self, frame: &str, exclude: Option<Uuid>) {
        let mut clients = self.clients.write().await;
        clients.retain(|user_id, handle| {
            if Some(*user_id) == exclude {
                return true;
            }
            match handle.outbound.try_send(frame.to_owned()) {
                Ok(()) => true,
                Err(_) => {
                    tracing::warn!(%user_id, "outbound queue full during broadcast, evicting");
                    handle.cancel.cancel();
                    false
                }
            }
        });
    }

    /// Best-effort delivery of one frame to one user. Offline recipient is a
    /// no-op; a full queue evicts the recipient.
    pub async fn send_to_user(&self, user_id: Uuid, frame: &str) {
        let stalled = {
            let clients = self.clients.read().await;
            match clients.get(&user_id) {
                None => return,
                Some(handle) => match handle.outbound.try_send(frame.to_owned()) {
                    Ok(()) => return,
                    Err(_) => handle.session,
                },
            }
        };

        // Recipient unresponsive: evict, but only if the registry still
        // holds the session we failed to deliver to.
        tracing::warn!(%user_id, "outbound queue full, evicting");
        let mut clients = self.clients.write().await;
        if let Some(handle) = clients.get(&user_id) {
            if handle.session == stalled {
                handle.cancel.cancel();
                clients.remove(&user_id);
            }
        }
    }

    /// Deliver one frame to every current member of a chat except the sender.
    pub async fn send_to_chat_members(&self, chat_id: Uuid, frame: &str, exclude: Uuid) {
        let members = match self.membership.members_of(chat_id).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(%chat_id, error = %e, "membership lookup failed, dropping envelope");
                return;
            }
        };
        for member in members {
            if member != exclude {
                self.send_to_user(member, frame).await;
            }
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.clients.read().await.contains_key(&user_id)
    }

    pub async fn list_online(&self) -> Vec<Uuid> {
        self.clients.read().await.keys().copied().collect()
    }

    /// Push a live `new_contact` notification. Called by the
    /// contact-management subsystem when a contact is added for a user who is
    /// currently connected.
    pub async fn send_new_contact_notification(
        &self,
        user_id: Uuid,
        contact: ContactSummary,
        nickname: &str,
    ) {
        let envelope = Envelope::server(
            Payload::NewContact(ContactPayload {
                contact_id: contact.id,
                contact,
                nickname: nickname.to_owned(),
            }),
            user_id,
        );
        match envelope.encode() {
            Ok(frame) => self.send_to_user(user_id, &frame).await,
            Err(e) => tracing::error!(%user_id, error = %e, "failed to encode contact notification"),
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use hush_types::events::GatewayEvent;

/// Routes targeted events to connected users.
///
/// Every hush event concerns exactly one user, so there is no broadcast
/// channel: each live connection owns one unbounded queue, keyed by user.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// user_id -> (conn_id, sender). A newer connection replaces an older one.
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-user channel. Returns (conn_id, receiver).
    pub async fn register_user_channel(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self
            .inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        if replaced.is_some() {
            debug!("User {} reconnected, replacing previous gateway connection", user_id);
        }
        (conn_id, rx)
    }

    /// Unregister a per-user channel, but only if conn_id still owns it.
    pub async fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if channels.get(&user_id).is_some_and(|(cid, _)| *cid == conn_id) {
            channels.remove(&user_id);
        }
    }

    /// Queue an event for one user. Returns whether it was delivered to a
    /// live connection; offline users simply miss it and catch up over HTTP.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        let channels = self.inner.user_channels.read().await;
        match channels.get(&user_id) {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => {
                debug!("User {} offline, dropping gateway event", user_id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(conversation_id: Uuid) -> GatewayEvent {
        GatewayEvent::ConversationClosed { conversation_id }
    }

    fn closed_id(event: GatewayEvent) -> Uuid {
        match event {
            GatewayEvent::ConversationClosed { conversation_id } => conversation_id,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn delivers_only_to_the_target() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (_, mut alice_rx) = dispatcher.register_user_channel(alice).await;
        let (_, mut bob_rx) = dispatcher.register_user_channel(bob).await;

        let conversation = Uuid::new_v4();
        assert!(dispatcher.send_to_user(bob, closed(conversation)).await);

        assert_eq!(closed_id(bob_rx.recv().await.unwrap()), conversation);
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_users_miss_events() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.send_to_user(Uuid::new_v4(), closed(Uuid::new_v4())).await);
    }

    #[tokio::test]
    async fn stale_connection_does_not_unregister_newer_one() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (old_conn, _old_rx) = dispatcher.register_user_channel(user).await;
        let (_new_conn, mut new_rx) = dispatcher.register_user_channel(user).await;

        dispatcher.unregister_user_channel(user, old_conn).await;
        assert!(dispatcher.send_to_user(user, closed(Uuid::new_v4())).await);
        assert!(new_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_, mut rx) = dispatcher.register_user_channel(user).await;

        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            dispatcher.send_to_user(user, closed(*id)).await;
        }
        for id in &ids {
            assert_eq!(closed_id(rx.recv().await.unwrap()), *id);
        }
    }
}

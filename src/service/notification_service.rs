// service/notification_service.rs
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    db::{NotificationExt, Store},
    models::notificationmodel::{Notification, NotificationCategory},
    service::error::ServiceError,
};

/// Somewhere a stored notification can be pushed to.
#[async_trait]
pub trait NotificationSink: Send + Sync + Debug {
    async fn deliver(&self, notification: &Notification) -> Result<(), ServiceError>;
}

/// Live websocket channels per user. A user may hold several connections;
/// channel ids are unique across users.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    channel_owners: DashMap<Uuid, Uuid>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel id used to unregister later.
    pub fn register(&self, user_id: Uuid, sender: mpsc::UnboundedSender<String>) -> Uuid {
        let channel_id = Uuid::new_v4();
        self.connections
            .entry(user_id)
            .or_default()
            .insert(channel_id, sender);
        self.channel_owners.insert(channel_id, user_id);
        tracing::debug!("user {} connected on channel {}", user_id, channel_id);
        channel_id
    }

    pub fn unregister(&self, channel_id: Uuid) {
        let Some((_, user_id)) = self.channel_owners.remove(&channel_id) else {
            return;
        };
        let now_empty = match self.connections.get_mut(&user_id) {
            Some(mut channels) => {
                channels.remove(&channel_id);
                channels.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.connections.remove_if(&user_id, |_, channels| channels.is_empty());
        }
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connections
            .get(&user_id)
            .map(|channels| !channels.is_empty())
            .unwrap_or(false)
    }

    /// Sends `payload` to every open channel of `user_id` and drops closed ones.
    /// Returns how many channels received it.
    pub fn send_to(&self, user_id: Uuid, payload: &str) -> usize {
        let Some(mut channels) = self.connections.get_mut(&user_id) else {
            return 0;
        };
        channels.retain(|channel_id, sender| {
            let open = sender.send(payload.to_string()).is_ok();
            if !open {
                self.channel_owners.remove(channel_id);
            }
            open
        });
        channels.len()
    }
}

/// Pushes notifications to connected websocket clients.
#[derive(Debug, Clone)]
pub struct RealtimeSink {
    registry: Arc<ConnectionRegistry>,
}

impl RealtimeSink {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl NotificationSink for RealtimeSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), ServiceError> {
        let payload = serde_json::json!({
            "event": "notification",
            "data": notification,
        })
        .to_string();

        let delivered = self.registry.send_to(notification.user_id, &payload);
        if delivered == 0 {
            tracing::debug!("user {} is offline, notification stored only", notification.user_id);
        }
        Ok(())
    }
}

/// Fire-and-forget notification queue. Callers enqueue after their write has
/// committed; a background worker persists each notification and fans it out
/// to the sinks. Failures are logged and never reach the caller.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::UnboundedSender<Notification>,
}

impl NotificationDispatcher {
    pub fn start(store: Arc<dyn Store>, sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Notification>();

        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                if let Err(e) = store.store_notification(&notification).await {
                    tracing::warn!(
                        "failed to store notification for {}: {}",
                        notification.user_id,
                        e
                    );
                }
                for sink in &sinks {
                    if let Err(e) = sink.deliver(&notification).await {
                        tracing::warn!(
                            "failed to deliver notification to {}: {}",
                            notification.user_id,
                            e
                        );
                    }
                }
            }
            tracing::info!("notification dispatcher stopped");
        });

        Self { sender }
    }

    pub fn notify(
        &self,
        user_id: Uuid,
        message: impl Into<String>,
        category: NotificationCategory,
        link: Option<String>,
    ) {
        let notification = Notification::new(user_id, message, category, link);
        if self.sender.send(notification).is_err() {
            tracing::warn!("notification queue closed, dropping message for {}", user_id);
        }
    }

    pub fn notify_booking(&self, user_id: Uuid, booking_id: Uuid, message: impl Into<String>) {
        self.notify(
            user_id,
            message,
            NotificationCategory::Booking,
            Some(format!("/booking/{}", booking_id)),
        );
    }
}

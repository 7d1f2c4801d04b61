// models/notificationmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "notification_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Booking,
    Payment,
    Dispute,
    Review,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub message: String,
    pub category: NotificationCategory,
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: Uuid,
        message: impl Into<String>,
        category: NotificationCategory,
        link: Option<String>,
    ) -> Self {
        Notification {
            id: Uuid::new_v4(),
            user_id,
            message: message.into(),
            category,
            link,
            is_read: false,
            created_at: Utc::now(),
        }
    }
}

// db/notificationdb.rs
use async_trait::async_trait;
use uuid::Uuid;

use super::db::DBClient;
use crate::models::notificationmodel::Notification;
use crate::service::error::ServiceError;

#[async_trait]
pub trait NotificationExt {
    async fn store_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, ServiceError>;

    async fn list_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Notification>, ServiceError>;

    async fn count_unread(&self, user_id: Uuid) -> Result<i64, ServiceError>;

    /// Returns how many notifications changed.
    async fn mark_all_read(&self, user_id: Uuid) -> Result<u64, ServiceError>;
}

#[async_trait]
impl NotificationExt for DBClient {
    async fn store_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, ServiceError> {
        let saved = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (id, user_id, message, category, link, is_read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, user_id, message, category, link, is_read, created_at
            "#,
        )
        .bind(notification.id)
        .bind(notification.user_id)
        .bind(&notification.message)
        .bind(notification.category)
        .bind(&notification.link)
        .bind(notification.is_read)
        .bind(notification.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(saved)
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Notification>, ServiceError> {
        let rows = sqlx::query_as::<_, Notification>(
            r#"
            SELECT id, user_id, message, category, link, is_read, created_at
            FROM notifications
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_unread(&self, user_id: Uuid) -> Result<i64, ServiceError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM notifications
            WHERE user_id = $1 AND is_read = FALSE
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn mark_all_read(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET is_read = TRUE
            WHERE user_id = $1 AND is_read = FALSE
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

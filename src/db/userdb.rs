// db/userdb.rs
use async_trait::async_trait;
use uuid::Uuid;

use super::db::DBClient;
use crate::models::usermodel::User;
use crate::service::error::ServiceError;

#[async_trait]
pub trait UserExt {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError>;

    /// First available worker offering `service`. No ranking.
    async fn find_available_worker(&self, service: &str) -> Result<Option<User>, ServiceError>;

    async fn add_completed_booking(
        &self,
        worker_id: Uuid,
        booking_id: Uuid,
    ) -> Result<(), ServiceError>;
}

#[async_trait]
impl UserExt for DBClient {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, role, services, is_available, device_token, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_available_worker(&self, service: &str) -> Result<Option<User>, ServiceError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, role, services, is_available, device_token, created_at
            FROM users
            WHERE role = 'worker'
              AND is_available = TRUE
              AND EXISTS (SELECT 1 FROM unnest(services) s WHERE LOWER(s) = LOWER($1))
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn add_completed_booking(
        &self,
        worker_id: Uuid,
        booking_id: Uuid,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO worker_completed_bookings (worker_id, booking_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(worker_id)
        .bind(booking_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// db/bookingdb.rs
use async_trait::async_trait;
use uuid::Uuid;

use super::db::{unique_violation, DBClient};
use crate::models::bookingmodel::*;
use crate::service::error::ServiceError;

#[async_trait]
pub trait BookingExt {
    async fn create_booking(&self, booking: &Booking) -> Result<Booking, ServiceError>;

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, ServiceError>;

    /// Writes `booking` only if the stored status is still `expected`.
    /// A lost race is `InvalidState`.
    async fn update_booking(
        &self,
        booking: &Booking,
        expected: BookingStatus,
    ) -> Result<Booking, ServiceError>;

    async fn delete_booking(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
    ) -> Result<(), ServiceError>;

    async fn list_bookings(
        &self,
        filter: &BookingFilter,
    ) -> Result<(Vec<Booking>, i64), ServiceError>;

    /// Stores the review and links it to the booking, once.
    async fn create_review(&self, review: &Review) -> Result<Review, ServiceError>;
}

pub(crate) fn lost_race(booking_id: Uuid, expected: BookingStatus) -> ServiceError {
    ServiceError::invalid_state(format!(
        "Booking {} is no longer {}",
        booking_id,
        expected.to_str()
    ))
}

#[async_trait]
impl BookingExt for DBClient {
    async fn create_booking(&self, booking: &Booking) -> Result<Booking, ServiceError> {
        let saved = sqlx::query_as::<_, Booking>(
            r#"
            INSERT INTO bookings
            (id, service, scheduled_date, scheduled_time, location_address, longitude, latitude,
             notes, client_id, worker_id, assignment_type, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(booking.id)
        .bind(&booking.service)
        .bind(booking.scheduled_date)
        .bind(&booking.scheduled_time)
        .bind(&booking.location_address)
        .bind(booking.longitude)
        .bind(booking.latitude)
        .bind(&booking.notes)
        .bind(booking.client_id)
        .bind(booking.worker_id)
        .bind(booking.assignment_type)
        .bind(booking.status)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(saved)
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, ServiceError> {
        let booking = sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = $1")
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(booking)
    }

    async fn update_booking(
        &self,
        booking: &Booking,
        expected: BookingStatus,
    ) -> Result<Booking, ServiceError> {
        let saved = sqlx::query_as::<_, Booking>(
            r#"
            UPDATE bookings
            SET worker_id = $3,
                status = $4,
                amount = $5,
                review_id = $6,
                dispute_raised_by = $7,
                dispute_reason = $8,
                dispute_details = $9,
                dispute_raised_at = $10,
                dispute_resolved_at = $11,
                start_time = $12,
                end_time = $13,
                service_time = $14,
                updated_at = $15
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(booking.id)
        .bind(expected)
        .bind(booking.worker_id)
        .bind(booking.status)
        .bind(booking.amount)
        .bind(booking.review_id)
        .bind(booking.dispute_raised_by)
        .bind(&booking.dispute_reason)
        .bind(&booking.dispute_details)
        .bind(booking.dispute_raised_at)
        .bind(booking.dispute_resolved_at)
        .bind(booking.start_time)
        .bind(booking.end_time)
        .bind(booking.service_time)
        .bind(booking.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        saved.ok_or_else(|| lost_race(booking.id, expected))
    }

    async fn delete_booking(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query("DELETE FROM bookings WHERE id = $1 AND status = $2")
            .bind(booking_id)
            .bind(expected)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(lost_race(booking_id, expected));
        }
        Ok(())
    }

    async fn list_bookings(
        &self,
        filter: &BookingFilter,
    ) -> Result<(Vec<Booking>, i64), ServiceError> {
        let search = filter.search.as_ref().map(|s| format!("%{}%", s));

        let bookings = sqlx::query_as::<_, Booking>(
            r#"
            SELECT * FROM bookings
            WHERE ($1::booking_status IS NULL OR status = $1)
              AND ($2::text IS NULL OR service ILIKE $2)
              AND ($3::date IS NULL OR scheduled_date >= $3)
              AND ($4::date IS NULL OR scheduled_date <= $4)
              AND ($5::text IS NULL OR service ILIKE $5 OR location_address ILIKE $5 OR notes ILIKE $5)
            ORDER BY created_at DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(filter.status)
        .bind(&filter.service)
        .bind(filter.date_from)
        .bind(filter.date_to)
        .bind(&search)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM bookings
            WHERE ($1::booking_status IS NULL OR status = $1)
              AND ($2::text IS NULL OR service ILIKE $2)
              AND ($3::date IS NULL OR scheduled_date >= $3)
              AND ($4::date IS NULL OR scheduled_date <= $4)
              AND ($5::text IS NULL OR service ILIKE $5 OR location_address ILIKE $5 OR notes ILIKE $5)
            "#,
        )
        .bind(filter.status)
        .bind(&filter.service)
        .bind(filter.date_from)
        .bind(filter.date_to)
        .bind(&search)
        .fetch_one(&self.pool)
        .await?;

        Ok((bookings, total))
    }

    async fn create_review(&self, review: &Review) -> Result<Review, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let linked = sqlx::query(
            r#"
            UPDATE bookings
            SET review_id = $2, updated_at = NOW()
            WHERE id = $1 AND review_id IS NULL AND status = 'closed'
            "#,
        )
        .bind(review.booking_id)
        .bind(review.id)
        .execute(&mut *tx)
        .await?;

        if linked.rows_affected() == 0 {
            return Err(ServiceError::already_processed(
                "Booking has already been reviewed",
            ));
        }

        let saved = sqlx::query_as::<_, Review>(
            r#"
            INSERT INTO reviews (id, booking_id, client_id, worker_id, rating, review, images, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(review.id)
        .bind(review.booking_id)
        .bind(review.client_id)
        .bind(review.worker_id)
        .bind(review.rating)
        .bind(&review.review)
        .bind(&review.images)
        .bind(review.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, "Booking has already been reviewed"))?;

        tx.commit().await?;
        Ok(saved)
    }
}

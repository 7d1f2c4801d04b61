// models/bookingmodel.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::usermodel::{Principal, UserRole};
use crate::service::error::ServiceError;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "booking_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmation,
    InProgress,
    Completed,
    Closed,
    Disputed,
    Resolved,
    Cancelled,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "assignment_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    ClientAssigned,
    SystemAssigned,
}

/// Everything that can move a booking between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingEvent {
    BudgetConfirmed { funded: bool },
    Started,
    MarkedComplete,
    Closed,
    Disputed,
    DisputeResolved,
    Cancelled,
}

impl BookingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BookingEvent::BudgetConfirmed { .. } => "confirm budget",
            BookingEvent::Started => "start",
            BookingEvent::MarkedComplete => "mark complete",
            BookingEvent::Closed => "close",
            BookingEvent::Disputed => "dispute",
            BookingEvent::DisputeResolved => "resolve",
            BookingEvent::Cancelled => "cancel",
        }
    }
}

impl BookingStatus {
    pub fn to_str(&self) -> &str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmation => "confirmation",
            BookingStatus::InProgress => "inprogress",
            BookingStatus::Completed => "completed",
            BookingStatus::Closed => "closed",
            BookingStatus::Disputed => "disputed",
            BookingStatus::Resolved => "resolved",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// The transition table. `None` means the pair is illegal.
    pub fn next(&self, event: BookingEvent) -> Option<BookingStatus> {
        use BookingEvent as E;
        use BookingStatus as S;

        match (self, event) {
            (S::Pending, E::BudgetConfirmed { funded: true }) => Some(S::InProgress),
            (S::Pending, E::BudgetConfirmed { funded: false }) => Some(S::Confirmation),
            (S::Confirmation, E::Started) => Some(S::InProgress),
            (S::InProgress, E::MarkedComplete) => Some(S::Completed),
            (S::Completed, E::Closed) => Some(S::Closed),
            (S::Completed, E::Disputed) => Some(S::Disputed),
            (S::Disputed, E::DisputeResolved) => Some(S::Resolved),
            (S::Pending | S::Confirmation | S::InProgress, E::Cancelled) => Some(S::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub address: String,
    /// `[longitude, latitude]`
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeDetails {
    pub raised_by: Uuid,
    pub reason: String,
    pub details: Option<String>,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: Uuid,
    pub service: String,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: String,
    pub location_address: String,
    pub longitude: f64,
    pub latitude: f64,
    pub notes: Option<String>,
    pub client_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub assignment_type: AssignmentType,
    pub status: BookingStatus,
    pub amount: Option<i64>,
    pub review_id: Option<Uuid>,
    pub dispute_raised_by: Option<Uuid>,
    pub dispute_reason: Option<String>,
    pub dispute_details: Option<String>,
    pub dispute_raised_at: Option<DateTime<Utc>>,
    pub dispute_resolved_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub service_time: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whole minutes between two instants, rounded up.
pub fn service_time_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i32 {
    let millis = (end - start).num_milliseconds().max(0);
    ((millis + 59_999) / 60_000) as i32
}

impl Booking {
    pub fn location(&self) -> Location {
        Location {
            address: self.location_address.clone(),
            coordinates: [self.longitude, self.latitude],
        }
    }

    pub fn dispute(&self) -> Option<DisputeDetails> {
        match (self.dispute_raised_by, &self.dispute_reason, self.dispute_raised_at) {
            (Some(raised_by), Some(reason), Some(raised_at)) => Some(DisputeDetails {
                raised_by,
                reason: reason.clone(),
                details: self.dispute_details.clone(),
                raised_at,
                resolved: self.dispute_resolved_at.is_some(),
                resolved_at: self.dispute_resolved_at,
            }),
            _ => None,
        }
    }

    pub fn is_client(&self, principal: &Principal) -> bool {
        principal.role == UserRole::Client && self.client_id == principal.id
    }

    pub fn is_worker(&self, principal: &Principal) -> bool {
        self.worker_id == Some(principal.id)
    }

    pub fn is_party(&self, principal: &Principal) -> bool {
        self.client_id == principal.id || self.is_worker(principal)
    }

    /// Assigned worker, or `InvalidState` when none is set.
    pub fn require_worker(&self) -> Result<Uuid, ServiceError> {
        self.worker_id
            .ok_or_else(|| ServiceError::invalid_state("No worker assigned to this booking"))
    }

    /// Checks the actor first, then the status table. Returns the target status.
    pub fn authorize(
        &self,
        principal: &Principal,
        event: BookingEvent,
    ) -> Result<BookingStatus, ServiceError> {
        let allowed = match event {
            BookingEvent::BudgetConfirmed { .. } | BookingEvent::MarkedComplete => {
                self.require_worker()?;
                self.is_worker(principal)
            }
            BookingEvent::Started | BookingEvent::Closed => self.is_client(principal),
            BookingEvent::Disputed | BookingEvent::Cancelled => self.is_party(principal),
            BookingEvent::DisputeResolved => principal.is_admin(),
        };
        if !allowed {
            return Err(ServiceError::forbidden(format!(
                "You are not allowed to {} this booking",
                event.name()
            )));
        }

        self.status.next(event).ok_or_else(|| {
            ServiceError::invalid_state(format!(
                "Cannot {} a booking that is {}",
                event.name(),
                self.status.to_str()
            ))
        })
    }

    /// Applies an already-authorized event to the in-memory copy.
    pub fn apply(&mut self, event: BookingEvent, to: BookingStatus, now: DateTime<Utc>) {
        match event {
            BookingEvent::BudgetConfirmed { funded: true } | BookingEvent::Started => {
                self.start_time = Some(now);
            }
            BookingEvent::Closed => {
                self.end_time = Some(now);
                let start = self.start_time.unwrap_or(now);
                self.service_time = Some(service_time_minutes(start, now));
            }
            BookingEvent::Cancelled => {
                self.end_time = Some(now);
            }
            BookingEvent::DisputeResolved => {
                self.dispute_resolved_at = Some(now);
            }
            _ => {}
        }
        self.status = to;
        self.updated_at = now;
    }

    pub fn ensure_deletable(&self, principal: &Principal) -> Result<(), ServiceError> {
        if self.client_id != principal.id {
            return Err(ServiceError::forbidden("Only the booking owner can delete it"));
        }
        if self.status != BookingStatus::Closed {
            return Err(ServiceError::invalid_state("Only closed bookings can be deleted"));
        }
        Ok(())
    }

    pub fn ensure_reviewable(&self, principal: &Principal) -> Result<(), ServiceError> {
        if !self.is_client(principal) {
            return Err(ServiceError::forbidden("Only the booking owner can leave a review"));
        }
        if self.status != BookingStatus::Closed {
            return Err(ServiceError::invalid_state("Only closed bookings can be reviewed"));
        }
        if self.review_id.is_some() {
            return Err(ServiceError::already_processed("Booking has already been reviewed"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Review {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub client_id: Uuid,
    pub worker_id: Uuid,
    pub rating: i16,
    pub review: String,
    pub images: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Filters for the admin booking listing.
#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub service: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub search: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        if let Some(status) = self.status {
            if booking.status != status {
                return false;
            }
        }
        if let Some(service) = &self.service {
            if !booking.service.eq_ignore_ascii_case(service) {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if booking.scheduled_date < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if booking.scheduled_date > to {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let haystack = [
                Some(booking.service.as_str()),
                Some(booking.location_address.as_str()),
                booking.notes.as_deref(),
            ];
            if !haystack
                .iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(&needle))
            {
                return false;
            }
        }
        true
    }
}

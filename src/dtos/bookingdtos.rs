// dtos/bookingdtos.rs
use std::borrow::Cow;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    models::{
        bookingmodel::*,
        escrowmodels::{DisputeResolution, EscrowDeposit},
    },
    service::settlement_service::{BookingSettlement, ConfirmBudgetOutcome, NewBooking},
};

fn validate_coordinates(coordinates: &[f64; 2]) -> Result<(), ValidationError> {
    let [longitude, latitude] = *coordinates;
    if !(-180.0..=180.0).contains(&longitude) || !(-90.0..=90.0).contains(&latitude) {
        let mut error = ValidationError::new("invalid_coordinates");
        error.message = Some(Cow::from("Coordinates must be [longitude, latitude]"));
        return Err(error);
    }
    Ok(())
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct LocationDto {
    #[validate(length(min = 1, max = 255, message = "Address is required"))]
    pub address: String,
    #[validate(custom = "validate_coordinates")]
    pub coordinates: [f64; 2],
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct CreateBookingDto {
    #[validate(length(min = 1, max = 100, message = "Service is required"))]
    pub service: String,
    pub scheduled_date: NaiveDate,
    #[validate(length(min = 1, max = 20, message = "Scheduled time is required"))]
    pub scheduled_time: String,
    #[validate]
    pub location: LocationDto,
    #[validate(length(max = 1000, message = "Notes must be at most 1000 characters"))]
    pub notes: Option<String>,
    /// Set for a client-assigned booking.
    pub worker_id: Option<Uuid>,
}

impl From<CreateBookingDto> for NewBooking {
    fn from(dto: CreateBookingDto) -> Self {
        NewBooking {
            service: dto.service.trim().to_string(),
            scheduled_date: dto.scheduled_date,
            scheduled_time: dto.scheduled_time,
            location: Location {
                address: dto.location.address,
                coordinates: dto.location.coordinates,
            },
            notes: dto.notes,
            worker_id: dto.worker_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingIdDto {
    pub booking_id: Uuid,
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmBudgetDto {
    pub booking_id: Uuid,
    #[validate(range(min = 1, max = 1000000000000, message = "Budget must be between 1 and 1000000000000"))]
    pub amount: i64,
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct RaiseDisputeDto {
    pub booking_id: Uuid,
    #[validate(length(min = 1, max = 255, message = "A dispute reason is required"))]
    pub reason: String,
    #[validate(length(max = 2000, message = "Details must be at most 2000 characters"))]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveDisputeDto {
    pub booking_id: Uuid,
    pub resolution: Option<DisputeResolution>,
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDto {
    #[validate(range(min = 1, max = 5, message = "Rating must be between 1 and 5"))]
    pub rating: i16,
    #[validate(length(min = 1, max = 2000, message = "Review text is required"))]
    pub review: String,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Validate, Debug, Default, Clone, Serialize, Deserialize)]
pub struct BookingQueryDto {
    pub status: Option<BookingStatus>,
    pub service: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    #[validate(length(max = 100))]
    pub search: Option<String>,
    #[validate(range(min = 1))]
    pub page: Option<i64>,
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<i64>,
}

impl BookingQueryDto {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(20)
    }

    pub fn to_filter(&self) -> BookingFilter {
        BookingFilter {
            status: self.status,
            service: self.service.clone().filter(|s| !s.trim().is_empty()),
            date_from: self.date_from,
            date_to: self.date_to,
            search: self.search.clone().filter(|s| !s.trim().is_empty()),
            limit: self.limit(),
            offset: (self.page() - 1) * self.limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterBookingDto {
    pub id: Uuid,
    pub service: String,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: String,
    pub location: Location,
    pub notes: Option<String>,
    pub client_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub assignment_type: AssignmentType,
    pub status: BookingStatus,
    pub amount: Option<i64>,
    pub review_id: Option<Uuid>,
    pub dispute: Option<DisputeDetails>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Minutes.
    pub service_time: Option<i32>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl FilterBookingDto {
    pub fn filter_booking(booking: &Booking) -> Self {
        FilterBookingDto {
            id: booking.id,
            service: booking.service.to_owned(),
            scheduled_date: booking.scheduled_date,
            scheduled_time: booking.scheduled_time.to_owned(),
            location: booking.location(),
            notes: booking.notes.clone(),
            client_id: booking.client_id,
            worker_id: booking.worker_id,
            assignment_type: booking.assignment_type,
            status: booking.status,
            amount: booking.amount,
            review_id: booking.review_id,
            dispute: booking.dispute(),
            start_time: booking.start_time,
            end_time: booking.end_time,
            service_time: booking.service_time,
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        }
    }

    pub fn filter_bookings(bookings: &[Booking]) -> Vec<FilterBookingDto> {
        bookings.iter().map(FilterBookingDto::filter_booking).collect()
    }
}

#[derive(Debug, Serialize)]
pub struct BookingSettlementDto {
    pub booking: FilterBookingDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow: Option<EscrowDeposit>,
}

impl From<BookingSettlement> for BookingSettlementDto {
    fn from(settlement: BookingSettlement) -> Self {
        BookingSettlementDto {
            booking: FilterBookingDto::filter_booking(&settlement.booking),
            escrow: settlement.escrow,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfirmBudgetResponseDto {
    pub booking: FilterBookingDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow: Option<EscrowDeposit>,
    /// Amount the client still has to top up before the booking can start.
    pub shortfall: i64,
}

impl From<ConfirmBudgetOutcome> for ConfirmBudgetResponseDto {
    fn from(outcome: ConfirmBudgetOutcome) -> Self {
        match outcome {
            ConfirmBudgetOutcome::Funded { booking, escrow } => ConfirmBudgetResponseDto {
                booking: FilterBookingDto::filter_booking(&booking),
                escrow: Some(escrow),
                shortfall: 0,
            },
            ConfirmBudgetOutcome::TopUpRequired { booking, shortfall } => {
                ConfirmBudgetResponseDto {
                    booking: FilterBookingDto::filter_booking(&booking),
                    escrow: None,
                    shortfall,
                }
            }
        }
    }
}

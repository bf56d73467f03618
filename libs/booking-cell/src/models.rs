use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use shared_database::{ConflictKind, StoreError};
use shared_gateways::BookingNotice;
use staff_cell::models::{ScheduleError, Specialty};

// ==============================================================================
// BOOKING CORE TYPES
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    PendingClinicConfirm,
    Confirmed,
    Assigned,
    OnTheWay,
    InProgress,
    Completed,
    Cancelled,
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::PendingClinicConfirm => "PENDING_CLINIC_CONFIRM",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Assigned => "ASSIGNED",
            BookingStatus::OnTheWay => "ON_THE_WAY",
            BookingStatus::InProgress => "IN_PROGRESS",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", name)
    }
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// A booking still holding its slots and blocking the pet from another
    /// active booking.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, target: BookingStatus) -> bool {
        use BookingStatus::*;
        match (self, target) {
            (Pending, Confirmed) => true,
            (Pending, Cancelled) => true,
            (PendingClinicConfirm, Confirmed) => true,
            (PendingClinicConfirm, Cancelled) => true,
            (Confirmed, Assigned) => true,
            (Confirmed, Cancelled) => true,
            (Assigned, OnTheWay) => true,
            (Assigned, InProgress) => true,
            (OnTheWay, InProgress) => true,
            (InProgress, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingType {
    InClinic,
    HomeVisit,
    Sos,
}

impl fmt::Display for BookingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BookingType::InClinic => "IN_CLINIC",
            BookingType::HomeVisit => "HOME_VISIT",
            BookingType::Sos => "SOS",
        };
        write!(f, "{}", name)
    }
}

impl BookingType {
    /// Types where staff physically travel to the animal.
    pub fn is_mobile(&self) -> bool {
        matches!(self, BookingType::HomeVisit | BookingType::Sos)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub booking_code: String,
    pub owner_id: Uuid,
    pub pet_id: Uuid,
    pub clinic_id: Option<Uuid>,
    pub staff_id: Option<Uuid>,
    pub booking_type: BookingType,
    pub status: BookingStatus,
    /// Sum of the service snapshot prices; 0 until an SOS booking is priced.
    pub total_price: f64,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Clinic-to-home distance, recorded once an SOS clinic accepts.
    pub distance_km: Option<f64>,
    pub symptoms: Option<String>,
    pub notes: Option<String>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn notice(&self) -> BookingNotice {
        BookingNotice {
            booking_id: self.id,
            booking_code: self.booking_code.clone(),
            clinic_id: self.clinic_id,
            owner_id: self.owner_id,
            pet_id: self.pet_id,
        }
    }
}

/// Immutable snapshot of a service at booking time. Catalog edits after the
/// fact must not change what was sold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingServiceItem {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub service_id: Uuid,
    pub name: String,
    pub price: f64,
    pub duration_minutes: i64,
}

/// A row from the service catalog as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCatalogItem {
    pub id: Uuid,
    pub name: String,
    pub price: f64,
    pub duration_minutes: i64,
    pub specialty: Specialty,
}

// ==============================================================================
// REQUESTS & RESPONSES
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBookingRequest {
    pub owner_id: Uuid,
    pub pet_id: Uuid,
    pub clinic_id: Uuid,
    pub booking_type: BookingType,
    pub service_ids: Vec<Uuid>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// Pin the booking to one staff member instead of taking the best ranked.
    pub staff_id: Option<Uuid>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
}

/// Emergency booking input. No clinic, no schedule: the dispatch flow fills
/// those in once a clinic accepts.
#[derive(Debug, Clone, Deserialize)]
pub struct SosBookingRequest {
    pub owner_id: Uuid,
    pub pet_id: Uuid,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub symptoms: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelBookingRequest {
    pub reason: String,
    /// "owner" or "clinic"; recorded verbatim on the booking.
    pub cancelled_by: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignStaffRequest {
    pub staff_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaffActionRequest {
    pub staff_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnWayRequest {
    pub staff_id: Uuid,
    /// Current position of the traveling staff member, for the ETA estimate.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingWithServices {
    pub booking: Booking,
    pub services: Vec<BookingServiceItem>,
}

// ==============================================================================
// ERRORS
// ==============================================================================

#[derive(Error, Debug)]
pub enum BookingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{action} requires booking status {required}, current status is {actual}")]
    State {
        action: &'static str,
        required: String,
        actual: BookingStatus,
    },

    #[error("Not authorized: {0}")]
    Security(String),

    #[error("Conflict: {0}")]
    Conflict(ConflictKind),

    #[error("No staff available for the requested time")]
    NoAvailability,

    #[error("Could not allocate a unique booking code")]
    CodeAllocationFailed,

    #[error("Database error: {0}")]
    Database(String),
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(kind) => BookingError::Conflict(kind),
            other => BookingError::Database(other.to_string()),
        }
    }
}

impl From<ScheduleError> for BookingError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::Validation(msg) => BookingError::Validation(msg),
            ScheduleError::NotFound(what) => BookingError::NotFound(what),
            other => BookingError::Database(other.to_string()),
        }
    }
}

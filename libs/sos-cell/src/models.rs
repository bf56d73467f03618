use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use booking_cell::models::{Booking, BookingError, BookingStatus};
use shared_database::StoreError;

// ==============================================================================
// SOS MATCHING TYPES
// ==============================================================================

/// Clinic row with the coordinates and flags SOS ranking reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clinic {
    pub id: Uuid,
    pub name: String,
    pub address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub is_active: bool,
    pub accepts_sos: bool,
}

/// An owner's emergency request as it arrives from the app.
#[derive(Debug, Clone, Deserialize)]
pub struct SosMatchRequest {
    pub owner_id: Uuid,
    pub pet_id: Uuid,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub symptoms: Option<String>,
}

/// A clinic manager's answer to an emergency offer. `staff_id` lets the
/// clinic commit a specific vet at acceptance time.
#[derive(Debug, Clone, Deserialize)]
pub struct ClinicResponseRequest {
    pub clinic_id: Uuid,
    pub manager_id: Uuid,
    pub accept: bool,
    pub staff_id: Option<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelMatchRequest {
    pub owner_id: Uuid,
}

/// Matching state carried between escalation steps, keyed by booking id in
/// the session store. The booking row itself never records which clinic is
/// currently being asked.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSession {
    /// Candidate clinics, nearest first.
    pub clinic_ids: Vec<Uuid>,
    /// Position of the clinic currently holding the offer.
    pub index: usize,
    pub created_at: DateTime<Utc>,
    /// When the current clinic was offered the booking. Timeouts count
    /// from here, so every escalation resets the clock.
    pub notified_at: DateTime<Utc>,
}

impl MatchSession {
    pub fn current_clinic(&self) -> Option<Uuid> {
        self.clinic_ids.get(self.index).copied()
    }
}

/// What a clinic response, owner cancel or timeout step did once the
/// booking lease settled.
#[derive(Debug)]
pub enum MatchOutcome {
    /// The clinic took the booking.
    Confirmed(Booking),
    /// The current clinic passed; the next one now holds the offer.
    Escalated { clinic_id: Uuid },
    /// Nobody took the booking, or the owner withdrew it.
    Cancelled(Booking),
    /// Another worker held the lease; nothing changed here.
    AlreadyHandled,
}

/// Owner-facing snapshot of where matching stands. Terminal bookings get
/// the same snapshot on every call.
#[derive(Debug, Serialize)]
pub struct MatchStatus {
    pub booking: Booking,
    /// Clinic currently being asked, while matching is still running.
    pub clinic_id: Option<Uuid>,
    /// 1-based position of that clinic in the candidate list.
    pub position: Option<usize>,
    pub candidates: Option<usize>,
}

/// Returned by `start_matching`. `candidates` counts the clinics that
/// entered the escalation list; zero means the booking was cancelled on
/// the spot.
#[derive(Debug, Serialize)]
pub struct SosMatchResponse {
    pub booking: Booking,
    pub candidates: usize,
    pub message: String,
}

/// Status event pushed over the broadcast channels. The camelCase field
/// names are part of the client contract.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SosStatusEvent {
    pub booking_id: Uuid,
    pub status: BookingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinic_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinic_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Counters from one timeout sweep, for the interval log line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub examined: usize,
    pub escalated: usize,
    pub cancelled: usize,
    pub raced: usize,
}

// ==============================================================================
// SOS ERRORS
// ==============================================================================

#[derive(Error, Debug)]
pub enum SosError {
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
    Conflict(String),

    #[error("Session store error: {0}")]
    Session(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<BookingError> for SosError {
    fn from(e: BookingError) -> Self {
        match e {
            BookingError::Validation(msg) => SosError::Validation(msg),
            BookingError::NotFound(what) => SosError::NotFound(what),
            BookingError::State {
                action,
                required,
                actual,
            } => SosError::State {
                action,
                required,
                actual,
            },
            BookingError::Security(msg) => SosError::Security(msg),
            BookingError::Conflict(kind) => SosError::Conflict(kind.to_string()),
            BookingError::NoAvailability | BookingError::CodeAllocationFailed => {
                SosError::Conflict(e.to_string())
            }
            BookingError::Database(msg) => SosError::Database(msg),
        }
    }
}

impl From<StoreError> for SosError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(kind) => SosError::Conflict(kind.to_string()),
            other => SosError::Database(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for SosError {
    fn from(e: redis::RedisError) -> Self {
        SosError::Session(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for SosError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        SosError::Session(e.to_string())
    }
}

impl From<serde_json::Error> for SosError {
    fn from(e: serde_json::Error) -> Self {
        SosError::Session(format!("Bad session payload: {}", e))
    }
}

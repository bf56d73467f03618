use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use shared_database::StoreError;

// ==============================================================================
// STAFF & SPECIALTIES
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Specialty {
    VetGeneral,
    VetSurgery,
    VetDentistry,
    VetDermatology,
    VetCardiology,
    Groomer,
}

impl fmt::Display for Specialty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Specialty::VetGeneral => "VET_GENERAL",
            Specialty::VetSurgery => "VET_SURGERY",
            Specialty::VetDentistry => "VET_DENTISTRY",
            Specialty::VetDermatology => "VET_DERMATOLOGY",
            Specialty::VetCardiology => "VET_CARDIOLOGY",
            Specialty::Groomer => "GROOMER",
        };
        write!(f, "{}", name)
    }
}

/// Which specialties may serve a request. One table, consulted everywhere a
/// candidate pool gets built.
#[derive(Debug, Clone, Copy)]
pub struct SpecialtyCompatibility {
    pub exact: Specialty,
    pub fallbacks: &'static [Specialty],
}

/// Generalist vets cover every clinical specialty; grooming is non-clinical
/// and gets no fallback.
pub fn compatibility_for(requested: Specialty) -> SpecialtyCompatibility {
    match requested {
        Specialty::Groomer => SpecialtyCompatibility {
            exact: Specialty::Groomer,
            fallbacks: &[],
        },
        Specialty::VetGeneral => SpecialtyCompatibility {
            exact: Specialty::VetGeneral,
            fallbacks: &[],
        },
        exact => SpecialtyCompatibility {
            exact,
            fallbacks: &[Specialty::VetGeneral],
        },
    }
}

impl SpecialtyCompatibility {
    pub fn accepted(&self) -> Vec<Specialty> {
        let mut accepted = vec![self.exact];
        accepted.extend_from_slice(self.fallbacks);
        accepted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Staff {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub specialty: Specialty,
    pub is_active: bool,
}

impl Staff {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

// ==============================================================================
// SHIFTS & SLOTS
// ==============================================================================

pub const SLOT_MINUTES: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shift {
    pub id: Uuid,
    pub staff_id: Uuid,
    pub clinic_id: Uuid,
    pub work_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub break_start: Option<NaiveTime>,
    pub break_end: Option<NaiveTime>,
    pub is_overnight: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Available,
    Booked,
    Blocked,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotStatus::Available => "AVAILABLE",
            SlotStatus::Booked => "BOOKED",
            SlotStatus::Blocked => "BLOCKED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub id: Uuid,
    pub shift_id: Uuid,
    pub staff_id: Uuid,
    pub clinic_id: Uuid,
    pub work_date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SlotStatus,
}

/// A not-yet-persisted slot interval produced by the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// ==============================================================================
// REQUESTS & RESPONSES
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateShiftRequest {
    pub staff_id: Uuid,
    pub clinic_id: Uuid,
    pub work_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub break_start: Option<NaiveTime>,
    pub break_end: Option<NaiveTime>,
    #[serde(default)]
    pub is_overnight: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShiftWithSlots {
    pub shift: Shift,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityRequest {
    pub clinic_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub specialty: Specialty,
    pub slots_needed: usize,
    pub exclude_staff_id: Option<Uuid>,
}

/// One service item's slot requirement inside a multi-service confirmation.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSlotRequirement {
    pub service_id: Uuid,
    pub slots_needed: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCoverageRequest {
    pub clinic_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub specialty: Specialty,
    pub services: Vec<ServiceSlotRequirement>,
    pub exclude_staff_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaffCandidate {
    pub staff: Staff,
    pub available: bool,
    /// Human-readable explanation when `available` is false.
    pub reason: Option<String>,
    /// Slots the candidate would occupy, in order, when available.
    pub slot_ids: Vec<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Slots already booked for this staff member that day; used for ranking.
    pub booked_slots: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceCoverage {
    pub staff: Staff,
    pub services_covered: Vec<Uuid>,
    pub services_missed: Vec<Uuid>,
    pub booked_slots: usize,
}

impl ServiceCoverage {
    pub fn covered_count(&self) -> usize {
        self.services_covered.len()
    }
}

// ==============================================================================
// ERRORS
// ==============================================================================

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Shift overlaps an existing shift for this staff member on {0}")]
    ShiftOverlap(NaiveDate),

    #[error("{action} requires slot status {required}, current status is {actual}")]
    InvalidSlotState {
        action: &'static str,
        required: &'static str,
        actual: SlotStatus,
    },

    #[error("Shift still has booked slots")]
    ShiftHasBookedSlots,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<StoreError> for ScheduleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(kind) => ScheduleError::Conflict(kind.to_string()),
            other => ScheduleError::Database(other.to_string()),
        }
    }
}

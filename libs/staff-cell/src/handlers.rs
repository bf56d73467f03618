use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::error::AppError;

use crate::models::{AvailabilityRequest, ScheduleError, ServiceCoverageRequest, CreateShiftRequest};
use crate::services::{availability::AvailabilityService, shifts::ShiftScheduleService};

#[derive(Debug, Deserialize)]
pub struct ScheduleDayQuery {
    pub date: NaiveDate,
}

// ==============================================================================
// SHIFT HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_shift(
    State(state): State<Arc<AppConfig>>,
    Json(request): Json<CreateShiftRequest>,
) -> Result<Json<Value>, AppError> {
    let schedule_service = ShiftScheduleService::new(&state);

    let created = schedule_service.create_shift(request).await
        .map_err(|e| match e {
            ScheduleError::Validation(msg) => AppError::ValidationError(msg),
            ScheduleError::ShiftOverlap(date) => {
                AppError::Conflict(format!("Shift overlaps an existing shift on {}", date))
            },
            ScheduleError::Conflict(msg) => AppError::Conflict(msg),
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!({
        "success": true,
        "shift": created.shift,
        "slots": created.slots,
        "message": format!("Shift created with {} bookable slots", created.slots.len())
    })))
}

#[axum::debug_handler]
pub async fn delete_shift(
    State(state): State<Arc<AppConfig>>,
    Path(shift_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let schedule_service = ShiftScheduleService::new(&state);

    schedule_service.delete_shift(shift_id).await
        .map_err(|e| match e {
            ScheduleError::NotFound(what) => AppError::NotFound(format!("{} not found", what)),
            ScheduleError::ShiftHasBookedSlots => {
                AppError::State("Shift has booked slots and cannot be deleted".to_string())
            },
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!({
        "success": true,
        "message": "Shift and its open slots deleted"
    })))
}

#[axum::debug_handler]
pub async fn get_clinic_shifts(
    State(state): State<Arc<AppConfig>>,
    Path(clinic_id): Path<Uuid>,
    Query(query): Query<ScheduleDayQuery>,
) -> Result<Json<Value>, AppError> {
    let schedule_service = ShiftScheduleService::new(&state);

    let shifts = schedule_service.list_clinic_shifts(clinic_id, query.date).await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "shifts": shifts,
        "total": shifts.len()
    })))
}

#[axum::debug_handler]
pub async fn get_staff_slots(
    State(state): State<Arc<AppConfig>>,
    Path(staff_id): Path<Uuid>,
    Query(query): Query<ScheduleDayQuery>,
) -> Result<Json<Value>, AppError> {
    let schedule_service = ShiftScheduleService::new(&state);

    let slots = schedule_service.list_staff_slots(staff_id, query.date).await
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "slots": slots,
        "total": slots.len()
    })))
}

// ==============================================================================
// SLOT STATE HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn block_slot(
    State(state): State<Arc<AppConfig>>,
    Path(slot_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let schedule_service = ShiftScheduleService::new(&state);

    let slot = schedule_service.block_slot(slot_id).await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": slot
    })))
}

#[axum::debug_handler]
pub async fn unblock_slot(
    State(state): State<Arc<AppConfig>>,
    Path(slot_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let schedule_service = ShiftScheduleService::new(&state);

    let slot = schedule_service.unblock_slot(slot_id).await
        .map_err(map_slot_error)?;

    Ok(Json(json!({
        "success": true,
        "slot": slot
    })))
}

fn map_slot_error(e: ScheduleError) -> AppError {
    match e {
        ScheduleError::NotFound(what) => AppError::NotFound(format!("{} not found", what)),
        ScheduleError::InvalidSlotState { .. } => AppError::State(e.to_string()),
        ScheduleError::Conflict(msg) => AppError::Conflict(msg),
        _ => AppError::Internal(e.to_string()),
    }
}

// ==============================================================================
// AVAILABILITY HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn search_availability(
    State(state): State<Arc<AppConfig>>,
    Json(request): Json<AvailabilityRequest>,
) -> Result<Json<Value>, AppError> {
    let availability_service = AvailabilityService::new(&state);

    let candidates = availability_service.find_available_staff(&request).await
        .map_err(|e| match e {
            ScheduleError::Validation(msg) => AppError::ValidationError(msg),
            _ => AppError::Internal(e.to_string()),
        })?;

    let available = candidates.iter().filter(|c| c.available).count();

    Ok(Json(json!({
        "candidates": candidates,
        "available": available,
        "total": candidates.len()
    })))
}

#[axum::debug_handler]
pub async fn check_service_coverage(
    State(state): State<Arc<AppConfig>>,
    Json(request): Json<ServiceCoverageRequest>,
) -> Result<Json<Value>, AppError> {
    let availability_service = AvailabilityService::new(&state);

    let coverage = availability_service.check_service_coverage(&request).await
        .map_err(|e| match e {
            ScheduleError::Validation(msg) => AppError::ValidationError(msg),
            _ => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(json!({
        "coverage": coverage,
        "total": coverage.len()
    })))
}

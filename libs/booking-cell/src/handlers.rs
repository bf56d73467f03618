use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::error::AppError;

use crate::models::{
    AssignStaffRequest, BookingError, CancelBookingRequest, CreateBookingRequest, OnWayRequest,
    StaffActionRequest,
};
use crate::services::{BookingLifecycleService, BookingService};

// ==============================================================================
// BOOKING HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_booking(
    State(state): State<Arc<AppConfig>>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<Json<Value>, AppError> {
    let booking_service = BookingService::new(&state);

    let created = booking_service.create_booking(request).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": created.booking,
        "services": created.services,
        "message": format!("Booking {} created", created.booking.booking_code)
    })))
}

#[axum::debug_handler]
pub async fn get_booking(
    State(state): State<Arc<AppConfig>>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let booking_service = BookingService::new(&state);

    let found = booking_service.get_booking_with_services(booking_id).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "booking": found.booking,
        "services": found.services
    })))
}

#[axum::debug_handler]
pub async fn get_booking_by_code(
    State(state): State<Arc<AppConfig>>,
    Path(booking_code): Path<String>,
) -> Result<Json<Value>, AppError> {
    let booking_service = BookingService::new(&state);

    let booking = booking_service.get_booking_by_code(&booking_code).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "booking": booking
    })))
}

#[axum::debug_handler]
pub async fn get_owner_bookings(
    State(state): State<Arc<AppConfig>>,
    Path(owner_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let booking_service = BookingService::new(&state);

    let bookings = booking_service.list_owner_bookings(owner_id).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "bookings": bookings,
        "total": bookings.len()
    })))
}

#[axum::debug_handler]
pub async fn cancel_booking(
    State(state): State<Arc<AppConfig>>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<CancelBookingRequest>,
) -> Result<Json<Value>, AppError> {
    let booking_service = BookingService::new(&state);

    let cancelled = booking_service.cancel_booking(booking_id, request).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": cancelled,
        "message": "Booking cancelled"
    })))
}

// ==============================================================================
// LIFECYCLE HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn confirm_booking(
    State(state): State<Arc<AppConfig>>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service = BookingLifecycleService::new(&state);

    let booking = lifecycle_service.confirm(booking_id).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": booking
    })))
}

#[axum::debug_handler]
pub async fn assign_staff(
    State(state): State<Arc<AppConfig>>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<AssignStaffRequest>,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service = BookingLifecycleService::new(&state);

    let booking = lifecycle_service.assign_staff(booking_id, request.staff_id).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": booking
    })))
}

#[axum::debug_handler]
pub async fn check_in(
    State(state): State<Arc<AppConfig>>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<StaffActionRequest>,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service = BookingLifecycleService::new(&state);

    let booking = lifecycle_service.check_in(booking_id, request).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": booking,
        "message": "Appointment started"
    })))
}

#[axum::debug_handler]
pub async fn complete_booking(
    State(state): State<Arc<AppConfig>>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<StaffActionRequest>,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service = BookingLifecycleService::new(&state);

    let booking = lifecycle_service.complete(booking_id, request).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": booking,
        "message": "Appointment completed"
    })))
}

#[axum::debug_handler]
pub async fn notify_on_way(
    State(state): State<Arc<AppConfig>>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<OnWayRequest>,
) -> Result<Json<Value>, AppError> {
    let lifecycle_service = BookingLifecycleService::new(&state);

    let eta_minutes = lifecycle_service.notify_on_way(booking_id, request).await
        .map_err(map_booking_error)?;

    Ok(Json(json!({
        "success": true,
        "eta_minutes": eta_minutes,
        "message": "Owner notified"
    })))
}

fn map_booking_error(e: BookingError) -> AppError {
    match e {
        BookingError::Validation(msg) => AppError::ValidationError(msg),
        BookingError::NotFound(what) => AppError::NotFound(format!("{} not found", what)),
        BookingError::State { .. } => AppError::State(e.to_string()),
        BookingError::Security(msg) => AppError::Security(msg),
        BookingError::Conflict(kind) => AppError::Conflict(kind.to_string()),
        BookingError::NoAvailability => AppError::NotFound(e.to_string()),
        BookingError::CodeAllocationFailed => AppError::Conflict(e.to_string()),
        BookingError::Database(msg) => AppError::Internal(msg),
    }
}

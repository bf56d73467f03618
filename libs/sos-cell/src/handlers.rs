use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use shared_models::error::AppError;

use crate::models::{CancelMatchRequest, ClinicResponseRequest, MatchOutcome, SosError, SosMatchRequest};
use crate::state::SosCellState;

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner_id: Uuid,
}

// ==============================================================================
// SOS MATCHING HANDLERS
// ==============================================================================

/// Kick off emergency matching for an owner
#[axum::debug_handler]
pub async fn start_sos_matching(
    State(state): State<Arc<SosCellState>>,
    Json(request): Json<SosMatchRequest>,
) -> Result<Json<Value>, AppError> {
    info!("SOS request from owner {}", request.owner_id);

    let response = state
        .matching
        .start_matching(request)
        .await
        .map_err(map_sos_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": response.booking,
        "candidates": response.candidates,
        "message": response.message,
    })))
}

/// A clinic accepts or declines the offer it currently holds
#[axum::debug_handler]
pub async fn respond_to_sos_offer(
    State(state): State<Arc<SosCellState>>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<ClinicResponseRequest>,
) -> Result<Json<Value>, AppError> {
    info!(
        "Clinic {} answered booking {} (accept: {})",
        request.clinic_id, booking_id, request.accept
    );

    let outcome = state
        .matching
        .process_confirmation(booking_id, request)
        .await
        .map_err(map_sos_error)?;

    let body = match outcome {
        MatchOutcome::Confirmed(booking) => json!({
            "success": true,
            "booking": booking,
            "message": "Emergency booking assigned to your clinic",
        }),
        MatchOutcome::Escalated { clinic_id } => json!({
            "success": true,
            "escalated_to": clinic_id,
            "message": "Offer passed to the next clinic",
        }),
        MatchOutcome::Cancelled(booking) => json!({
            "success": true,
            "booking": booking,
            "message": "No clinics remain, the emergency booking was cancelled",
        }),
        // A racing response or sweep already moved this booking on.
        MatchOutcome::AlreadyHandled => json!({
            "success": true,
            "message": "This booking was already being updated, nothing changed",
        }),
    };
    Ok(Json(body))
}

/// Owner-facing matching progress
#[axum::debug_handler]
pub async fn get_sos_status(
    State(state): State<Arc<SosCellState>>,
    Path(booking_id): Path<Uuid>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Value>, AppError> {
    let status = state
        .matching
        .get_matching_status(booking_id, query.owner_id)
        .await
        .map_err(map_sos_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": status.booking,
        "clinic_id": status.clinic_id,
        "position": status.position,
        "candidates": status.candidates,
    })))
}

/// Owner withdraws a request that no clinic has taken yet
#[axum::debug_handler]
pub async fn cancel_sos_matching(
    State(state): State<Arc<SosCellState>>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<CancelMatchRequest>,
) -> Result<Json<Value>, AppError> {
    info!(
        "Owner {} cancelling SOS booking {}",
        request.owner_id, booking_id
    );

    let outcome = state
        .matching
        .cancel_matching(booking_id, request.owner_id)
        .await
        .map_err(map_sos_error)?;

    match outcome {
        MatchOutcome::Cancelled(booking) => Ok(Json(json!({
            "success": true,
            "booking": booking,
            "message": "Emergency request cancelled",
        }))),
        // Unlike a clinic's decline, the owner needs to know their cancel
        // did not land.
        MatchOutcome::AlreadyHandled => Err(AppError::Conflict(
            "The booking is being updated, try again in a moment".to_string(),
        )),
        _ => Err(AppError::Internal("Operation failed".to_string())),
    }
}

/// The owner's one in-flight emergency booking, if any
#[axum::debug_handler]
pub async fn get_active_sos(
    State(state): State<Arc<SosCellState>>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Value>, AppError> {
    let booking = state
        .matching
        .get_active_sos_booking(query.owner_id)
        .await
        .map_err(map_sos_error)?;

    Ok(Json(json!({
        "success": true,
        "booking": booking,
    })))
}

fn map_sos_error(e: SosError) -> AppError {
    match e {
        SosError::Validation(msg) => AppError::ValidationError(msg),
        SosError::NotFound(what) => AppError::NotFound(format!("{} not found", what)),
        SosError::State { .. } => AppError::State(e.to_string()),
        SosError::Security(msg) => AppError::Security(msg),
        SosError::Conflict(msg) => AppError::Conflict(msg),
        SosError::Session(_) | SosError::Database(_) => {
            error!("SOS infrastructure error: {}", e);
            AppError::Internal("Operation failed".to_string())
        }
    }
}

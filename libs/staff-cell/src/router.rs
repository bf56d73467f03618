use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};

use shared_config::AppConfig;

use crate::handlers;

pub fn staff_routes(state: Arc<AppConfig>) -> Router {
    Router::new()
        // Shift and slot management
        .route("/shifts", post(handlers::create_shift))
        .route("/shifts/{shift_id}", delete(handlers::delete_shift))
        .route("/clinics/{clinic_id}/shifts", get(handlers::get_clinic_shifts))
        .route("/{staff_id}/slots", get(handlers::get_staff_slots))
        .route("/slots/{slot_id}/block", post(handlers::block_slot))
        .route("/slots/{slot_id}/unblock", post(handlers::unblock_slot))
        // Candidate search
        .route("/availability/search", post(handlers::search_availability))
        .route("/availability/coverage", post(handlers::check_service_coverage))
        .with_state(state)
}

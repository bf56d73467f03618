use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use shared_config::AppConfig;

use crate::handlers;

pub fn booking_routes(state: Arc<AppConfig>) -> Router {
    Router::new()
        // Booking creation and lookup
        .route("/", post(handlers::create_booking))
        .route("/{booking_id}", get(handlers::get_booking))
        .route("/code/{booking_code}", get(handlers::get_booking_by_code))
        .route("/owners/{owner_id}", get(handlers::get_owner_bookings))
        // Lifecycle transitions
        .route("/{booking_id}/cancel", post(handlers::cancel_booking))
        .route("/{booking_id}/confirm", post(handlers::confirm_booking))
        .route("/{booking_id}/assign", post(handlers::assign_staff))
        .route("/{booking_id}/check-in", post(handlers::check_in))
        .route("/{booking_id}/complete", post(handlers::complete_booking))
        .route("/{booking_id}/notify-on-way", post(handlers::notify_on_way))
        .with_state(state)
}

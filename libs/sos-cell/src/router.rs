use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{
    cancel_sos_matching, get_active_sos, get_sos_status, respond_to_sos_offer, start_sos_matching,
};
use crate::state::SosCellState;

pub fn sos_routes(state: Arc<SosCellState>) -> Router {
    Router::new()
        .route("/", post(start_sos_matching))
        .route("/active", get(get_active_sos))
        .route("/{booking_id}/status", get(get_sos_status))
        .route("/{booking_id}/respond", post(respond_to_sos_offer))
        .route("/{booking_id}/cancel", post(cancel_sos_matching))
        .with_state(state)
}

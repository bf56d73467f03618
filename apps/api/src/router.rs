use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use booking_cell::router::booking_routes;
use shared_config::AppConfig;
use sos_cell::SosCellState;
use sos_cell::router::sos_routes;
use staff_cell::router::staff_routes;

pub fn create_router(state: Arc<AppConfig>, sos_state: Arc<SosCellState>) -> Router {
    Router::new()
        .route("/", get(|| async { "VetLink API is running!" }))
        .nest("/staff", staff_routes(state.clone()))
        .nest("/bookings", booking_routes(state.clone()))
        .nest("/sos", sos_routes(sos_state))
}

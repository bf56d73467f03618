pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

// Re-export models and services for external use
pub use models::*;
pub use services::{BookingCodeAllocator, BookingLifecycleService, BookingService};

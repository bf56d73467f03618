pub mod booking;
pub mod codes;
pub mod lifecycle;

pub use booking::{BookingService, MAX_CODE_ATTEMPTS};
pub use codes::BookingCodeAllocator;
pub use lifecycle::BookingLifecycleService;

use reqwest::header::{HeaderMap, HeaderValue};

/// PostgREST writes return no body unless asked; every mutation here wants
/// the stored row back.
pub(crate) fn representation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Prefer", HeaderValue::from_static("return=representation"));
    headers
}

pub mod distance;
pub mod notify;

pub use distance::{DistanceProvider, HaversineDistanceProvider};
pub use notify::{BookingNotice, NotificationGateway, StoreNotificationGateway};

pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod state;

pub use models::*;
pub use services::events::SosEventChannel;
pub use services::lease::{BookingLease, InProcessLease, RedisBookingLease};
pub use services::matching::{MatchSettings, SosMatchService};
pub use services::session::{
    create_redis_pool, InMemorySessionRepository, RedisSessionRepository, SosSessionRepository,
};
pub use services::sweeper::SosTimeoutSweeper;
pub use state::SosCellState;

pub mod events;
pub mod lease;
pub mod matching;
pub mod session;
pub mod sweeper;

pub mod postgrest;

pub use postgrest::{ConflictKind, StoreClient, StoreError};

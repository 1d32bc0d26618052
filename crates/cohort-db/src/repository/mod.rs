//! SurrealDB repository implementations.

mod group;
mod user;

pub use group::SurrealGroupRepository;
pub use user::SurrealUserRepository;

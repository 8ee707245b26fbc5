//! Roster core types and utilities

pub mod error;
pub mod tracing;
pub mod users;

#[cfg(any(test, feature = "tests"))]
pub mod tests;

pub use error::{CoreError, CoreResult};
pub use users::{
    ListQuery, MemoryUserStore, NewUser, StoreError, StoreResult, User, UserStore, UserUpdate,
};

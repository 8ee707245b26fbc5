//! PostgreSQL persistence for Roster
//!
//! [`PgUserStore`] implements the core `UserStore` trait. Every statement it
//! runs is announced through [`sql_log`] so the log shows executable SQL.

pub mod sql_log;
mod users;

pub use users::PgUserStore;

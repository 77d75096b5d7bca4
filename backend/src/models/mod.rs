//! Data models shared across storage backends and API handlers.

pub mod login_attempt;
pub mod session;
pub mod user;

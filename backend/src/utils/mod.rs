pub mod client;
pub mod cookies;
pub mod jwt;
pub mod password;

pub use client::ClientContext;
pub use jwt::*;
pub use password::*;

pub mod credentials;
pub mod login_guard;
pub mod refresh_store;
pub mod rotation;
pub mod session;
pub mod sweeper;

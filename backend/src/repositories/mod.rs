//! Postgres query functions used by the relational store backends.

pub mod login_attempt;
pub mod refresh_family;
pub mod user;

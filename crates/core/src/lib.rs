//! Shared domain types for the Fintrack backend.
//!
//! This crate has no internal dependencies so that the database layer, the
//! delivery engine and the API server can all build on it.

pub mod channels;
pub mod error;
pub mod notification;
pub mod roles;
pub mod types;

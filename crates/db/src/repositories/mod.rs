//! Stateless repositories; each method takes the pool explicitly.

pub mod notification_repo;

pub use notification_repo::NotificationRepo;

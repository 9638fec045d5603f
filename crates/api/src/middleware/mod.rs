//! Authentication and authorization middleware extractors.
//!
//! - [`auth::AuthUser`] -- Extracts the authenticated user from a JWT Bearer token.
//! - [`rbac::RequirePublisher`] -- Requires the `admin` or `service` role.

pub mod auth;
pub mod rbac;

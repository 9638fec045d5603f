//! Well-known role name constants carried in the JWT `role` claim.

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";
/// Internal producers (feed scraper, goal tracker) that publish notifications.
pub const ROLE_SERVICE: &str = "service";

// =============================================================================
// Control API — thin HTTP dispatch onto the session manager
// =============================================================================

pub mod auth;
pub mod rest;

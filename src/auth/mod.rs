//! Authentication and authorisation subsystem.
//!
//! Provides validation of IndieAuth bearer tokens against the site's token
//! endpoint (with a KeyDB-backed cache), the request gate for the Microsub
//! API, and WebSub delivery signature checks.

pub mod cache;
pub mod http_validator;
pub mod middleware;
pub mod token;
pub mod webhook;

//! HTTP layer of the feed server.
//!
//! Serves the WebSub subscriber callback, the token-gated Microsub entry
//! point and the operational endpoints.

pub mod handler;
pub mod incoming;

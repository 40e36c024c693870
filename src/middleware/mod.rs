//! Middleware for observability.
//!
//! Request logging with latency tracking, wrapping every dashboard route.

pub mod logging;

pub use logging::{request_logging, request_logging_simple};

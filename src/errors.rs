//! Error taxonomy: plain `anyhow`, no `thiserror` enum hierarchy, just
//! small marker structs that callers classify via `downcast_ref`/`is`.

use std::fmt;

/// No order exists on the exchange; reservations and trigger claims
/// are safe to roll back.
#[derive(Debug)]
pub struct PriceTooHigh {
    pub price: f64,
    pub max_price: f64,
}

impl fmt::Display for PriceTooHigh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "price {} exceeds max_price {}",
            self.price, self.max_price
        )
    }
}
impl std::error::Error for PriceTooHigh {}

#[derive(Debug)]
pub struct InsufficientBalance {
    pub requested: f64,
    pub available: f64,
}

impl fmt::Display for InsufficientBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "insufficient balance: requested {}, available {}",
            self.requested, self.available
        )
    }
}
impl std::error::Error for InsufficientBalance {}

#[derive(Debug)]
pub struct ValidationError(pub String);

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation error: {}", self.0)
    }
}
impl std::error::Error for ValidationError {}

/// An order *may* exist on the exchange (exception after call, or
/// network error after the send). Reservation and trigger are kept;
/// reconciliation resolves it.
#[derive(Debug)]
pub struct SubmissionAmbiguous(pub String);

impl fmt::Display for SubmissionAmbiguous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "submission ambiguous: {}", self.0)
    }
}
impl std::error::Error for SubmissionAmbiguous {}

/// Timeouts and 5xx. Retried with backoff up to a configured max
/// before surfacing as SubmissionAmbiguous or a query failure.
#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}
impl std::error::Error for TransportError {}

#[derive(Debug)]
pub struct RateLimited {
    pub retry_after_ms: u64,
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate limited, retry after {}ms", self.retry_after_ms)
    }
}
impl std::error::Error for RateLimited {}

/// Is `err` a pre-submit validation failure (safe to roll back
/// reservations/trigger claims for)?
pub fn is_pre_submit_validation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<PriceTooHigh>().is_some()
        || err.downcast_ref::<InsufficientBalance>().is_some()
        || err.downcast_ref::<ValidationError>().is_some()
}

pub fn is_submission_ambiguous(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SubmissionAmbiguous>().is_some()
}

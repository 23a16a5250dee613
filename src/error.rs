// src/error.rs
use std::fmt;

/// Crate-wide error taxonomy.
///
/// Store-level outcomes (`PreconditionFailed`, `TransactionAborted`,
/// `IdempotencyConflict`, `StoreUnavailable`) are produced by `ItemStore`
/// implementations; the reservation layer translates `PreconditionFailed`
/// into `ReservationConflict` before it reaches a caller. Point lookups
/// that find nothing return `Ok(None)`, never `NotFound`; the variant
/// exists for the HTTP boundary mapping only.
#[derive(Debug)]
pub enum Error {
    /// A single-item write precondition did not hold at commit time.
    PreconditionFailed,
    /// At least one precondition in a multi-item transaction failed; no
    /// item was mutated.
    TransactionAborted,
    /// An idempotency token was reused with a different operation set.
    IdempotencyConflict,
    /// Single-item reservation lost the race (or the ticket never existed;
    /// the conditional-write primitive cannot tell the two apart).
    ReservationConflict,
    NotFound,
    /// Backend fault (network, pool, I/O). The only class a caller may
    /// reasonably retry with backoff; the core never retries it.
    StoreUnavailable(String),
    Serialize(String),
    Deserialize(String),
    InvalidRequest(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PreconditionFailed => write!(f, "Write precondition failed"),
            Error::TransactionAborted => write!(f, "Transaction aborted, no items were written"),
            Error::IdempotencyConflict => {
                write!(f, "Idempotency token reused with a different operation set")
            }
            Error::ReservationConflict => write!(f, "Ticket is not available for reservation"),
            Error::NotFound => write!(f, "Not found"),
            Error::StoreUnavailable(msg) => write!(f, "Store unavailable: {}", msg),
            Error::Serialize(msg) => write!(f, "Serialization error: {}", msg),
            Error::Deserialize(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// The closed error-to-HTTP-status mapping. Every variant is listed;
    /// adding a variant without a status is a compile error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::ReservationConflict => 409,
            Error::TransactionAborted => 409,
            Error::PreconditionFailed => 409,
            Error::NotFound => 404,
            Error::IdempotencyConflict => 400,
            Error::InvalidRequest(_) => 400,
            Error::StoreUnavailable(_) => 503,
            Error::Serialize(_) => 500,
            Error::Deserialize(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_outcomes_map_to_409() {
        assert_eq!(Error::ReservationConflict.http_status(), 409);
        assert_eq!(Error::TransactionAborted.http_status(), 409);
        assert_eq!(Error::PreconditionFailed.http_status(), 409);
    }

    #[test]
    fn not_found_maps_to_404() {
        assert_eq!(Error::NotFound.http_status(), 404);
    }

    #[test]
    fn client_defects_map_to_400() {
        assert_eq!(Error::IdempotencyConflict.http_status(), 400);
        assert_eq!(Error::InvalidRequest("empty batch".into()).http_status(), 400);
    }

    #[test]
    fn backend_faults_map_to_503() {
        assert_eq!(Error::StoreUnavailable("timeout".into()).http_status(), 503);
    }

    #[test]
    fn codec_failures_map_to_500() {
        assert_eq!(Error::Serialize("x".into()).http_status(), 500);
        assert_eq!(Error::Deserialize("x".into()).http_status(), 500);
    }
}

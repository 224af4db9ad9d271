use thiserror::Error;

/// Internal error taxonomy (§4.11). Unifies control flow across the router,
/// the ingest pipeline, and the back-pressure policy. Never serialized
/// verbatim to a client — [`RelayError::reason_code`] maps each variant to
/// the frozen wire vocabulary in [`relay_protocol::reason_codes`].
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unknown path")]
    UnknownPath,
    #[error("capacity reached, no evictable connection")]
    CapacityReached,
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },
    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },
    #[error("slow consumer")]
    SlowConsumer,
    #[error("connection closed")]
    Closed,
}

impl RelayError {
    pub fn reason_code(&self) -> &'static str {
        use relay_protocol::reason_codes as rc;
        match self {
            RelayError::UnknownPath => rc::UNKNOWN_PATH,
            RelayError::CapacityReached => rc::CAPACITY_REACHED_NO_EVICTABLE,
            RelayError::ProtocolViolation { .. } => rc::PROTOCOL_ERROR,
            RelayError::ValidationFailed { .. } => rc::VALIDATION_FAILED,
            RelayError::SlowConsumer => rc::SLOW_CONSUMER,
            RelayError::Closed => rc::PROTOCOL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_match_the_frozen_wire_vocabulary() {
        assert_eq!(RelayError::UnknownPath.reason_code(), "unknown_path");
        assert_eq!(
            RelayError::CapacityReached.reason_code(),
            "capacity_reached_no_evictable"
        );
        assert_eq!(
            RelayError::ValidationFailed {
                reason: "bad orientation".to_owned()
            }
            .reason_code(),
            "validation_failed"
        );
        assert_eq!(RelayError::SlowConsumer.reason_code(), "slow_consumer");
    }
}

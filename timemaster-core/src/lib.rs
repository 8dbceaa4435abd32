//! # Timemaster Core
//!
//! Shared building blocks for electing one active participant in a fleet and
//! having it stamp a heartbeat record with synchronized time.
//!
//! ## Components
//!
//! - **Types**: `MasterId`, `ActiveRecord`, `ElectionRole`, `ElectionPhase`
//! - **Codec**: the `masterId;timestamp` payload format
//! - **Coordination**: the `CoordinationService` trait the election runs on,
//!   with its `OpOutcome` results and `CoordinationEvent` notifications
//! - **Time**: the `TimeSource` trait and the host wall clock
//! - **Error Handling**: `TimeMasterError` and the `Result` alias

pub mod codec;
pub mod coordination;
pub mod error;
pub mod time;
pub mod types;

pub use coordination::{CoordinationEvent, CoordinationService, OpOutcome};
pub use error::*;
pub use time::{SystemClock, TimeSource};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        let error = TimeMasterError::Timeout {
            operation: "write /tm".to_string(),
        };
        assert!(error.is_retryable());
        assert!(!error.is_fatal());

        let error = TimeMasterError::ConnectionLost {
            reason: "session expired".to_string(),
        };
        assert!(!error.is_retryable());
        assert!(error.is_fatal());
    }

    #[test]
    fn test_record_through_codec() {
        let record = ActiveRecord::new(MasterId::new("m1"), 1000);
        let payload = codec::encode(&record).unwrap();
        let decoded = codec::decode(&payload).unwrap();
        assert!(decoded.is_owned_by(&MasterId::new("m1")));
        assert_eq!(decoded.timestamp, 1000);
    }
}

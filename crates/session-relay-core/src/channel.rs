//! Broker channel naming.
//!
//! These names are the entire wire contract with the broker.

use crate::traits::SessionId;

/// Channel a session relay listens on for follow-up requests.
#[must_use]
pub fn requests_channel(session_id: &SessionId) -> String {
    format!("requests:{session_id}")
}

/// Channel carrying the response to a single follow-up request.
#[must_use]
pub fn responses_channel(session_id: &SessionId, request_id: &str) -> String {
    format!("responses:{session_id}:{request_id}")
}

use serde::{Deserialize, Serialize};

use crate::correlation::{CorrelationId, SubscriptionId};
use crate::envelope::Payload;

/// Whether a unary call is a read or a state-changing operation.
///
/// Both kinds travel the same request/response path; the distinction is
/// carried for handlers and logging, not enforced by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Query,
    Mutation,
}

/// One unary call, caller → handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: CorrelationId,
    pub path: String,
    pub payload: Payload,
    pub kind: CallKind,
}

/// The single reply to a [`CallRequest`], handler → caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    pub id: CorrelationId,
    pub outcome: CallOutcome,
}

/// Terminal outcome of a unary call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Success { payload: Payload },
    Failure { description: String },
}

/// Advisory cancellation for an in-flight call, caller → handler.
///
/// May race with the response; a no-op if the id is no longer registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelNotice {
    pub id: CorrelationId,
}

/// Open a subscription, caller → handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStart {
    pub id: SubscriptionId,
    pub path: String,
    pub payload: Payload,
}

/// Close a subscription, caller → handler. Idempotent; safe to send more
/// than once or after natural completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStop {
    pub id: SubscriptionId,
}

/// One subscription event, handler → caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub id: SubscriptionId,
    pub kind: EventKind,
}

/// Event kinds carried by [`SubscriptionEvent`].
///
/// After an `Error` or `Complete` event for an id, no further events for
/// that id are produced or consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Data { payload: Payload },
    Error { description: String },
    Complete,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_request_round_trip_keeps_absence() {
        // ---
        let req = CallRequest {
            id: CorrelationId::generate(),
            path: "getUser".into(),
            payload: Payload::absent(),
            kind: CallKind::Query,
        };

        let wire = serde_json::to_vec(&req).unwrap();
        let back: CallRequest = serde_json::from_slice(&wire).unwrap();

        assert_eq!(back.id, req.id);
        assert!(!back.payload.is_present());
    }

    #[test]
    fn test_outcome_wire_tags() {
        // ---
        let failure = CallOutcome::Failure {
            description: "boom".into(),
        };
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"status\":\"failure\""));

        let complete = serde_json::to_string(&EventKind::Complete).unwrap();
        assert!(complete.contains("\"event\":\"complete\""));
    }
}

//! Builders for outbound messages and accessors for inbound envelopes.

use std::collections::HashMap;

use chrono::Utc;
use fleet_proto::control::v1::{
    agent_message, AgentMessage, BaseEnvelope, Heartbeat, Metrics, Response, ResponseCode,
    ResponseEnvelope,
};
use uuid::Uuid;

use crate::host::CapabilitySnapshot;
use crate::identity::AgentId;

/// Fresh envelope with a new message ID and the current time.
pub fn base(agent_id: &AgentId) -> BaseEnvelope {
    let now = Utc::now();
    BaseEnvelope {
        message_id: Uuid::new_v4().to_string(),
        timestamp: Some(prost_types::Timestamp {
            seconds: now.timestamp(),
            nanos: now.timestamp_subsec_nanos() as i32,
        }),
        agent_id: agent_id.to_string(),
    }
}

/// Response envelope echoing `message_id` of the request it answers.
pub fn response_envelope(
    agent_id: &AgentId,
    message_id: &str,
    code: ResponseCode,
    message: impl Into<String>,
) -> ResponseEnvelope {
    ResponseEnvelope {
        message_id: message_id.to_string(),
        agent_id: agent_id.to_string(),
        response_code: code.into(),
        message: message.into(),
    }
}

/// Response to a server request.
pub fn response(
    agent_id: &AgentId,
    message_id: &str,
    kind: &str,
    code: ResponseCode,
    message: impl Into<String>,
    result: Vec<u8>,
) -> AgentMessage {
    AgentMessage {
        payload: Some(agent_message::Payload::Response(Response {
            envelope: Some(response_envelope(agent_id, message_id, code, message)),
            kind: kind.to_string(),
            result,
        })),
    }
}

/// Heartbeat. The first heartbeat of a stream carries the capability snapshot.
pub fn heartbeat(agent_id: &AgentId, snapshot: Option<CapabilitySnapshot>) -> AgentMessage {
    let snapshot = snapshot.unwrap_or_default();
    AgentMessage {
        payload: Some(agent_message::Payload::Heartbeat(Heartbeat {
            base: Some(base(agent_id)),
            capabilities: snapshot.capabilities,
            features: snapshot.features,
        })),
    }
}

pub fn metrics(agent_id: &AgentId, values: HashMap<String, f64>) -> AgentMessage {
    AgentMessage {
        payload: Some(agent_message::Payload::Metrics(Metrics {
            base: Some(base(agent_id)),
            values,
        })),
    }
}

/// Agent ID an inbound message is addressed to. Empty when absent.
pub fn target(base: Option<&BaseEnvelope>) -> &str {
    base.map(|b| b.agent_id.as_str()).unwrap_or_default()
}

/// Message ID of an inbound message. Empty when absent.
pub fn message_id(base: Option<&BaseEnvelope>) -> &str {
    base.map(|b| b.message_id.as_str()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn agent() -> AgentId {
        "node-1".parse().unwrap()
    }

    #[test]
    fn test_message_ids_are_unique() {
        let ids: HashSet<String> = (0..256).map(|_| base(&agent()).message_id).collect();
        assert_eq!(ids.len(), 256);
    }

    #[test]
    fn test_response_echoes_request_id() {
        let msg = response(&agent(), "req-7", "Deploy", ResponseCode::TooManyRequests, "busy", vec![]);
        let Some(agent_message::Payload::Response(resp)) = msg.payload else {
            panic!("expected response payload");
        };
        let envelope = resp.envelope.unwrap();
        assert_eq!(envelope.message_id, "req-7");
        assert_eq!(envelope.agent_id, "node-1");
        assert_eq!(envelope.response_code(), ResponseCode::TooManyRequests);
        assert_eq!(resp.kind, "Deploy");
    }

    #[test]
    fn test_target_defaults_to_empty() {
        assert_eq!(target(None), "");
        let envelope = base(&agent());
        assert_eq!(target(Some(&envelope)), "node-1");
        assert_eq!(message_id(Some(&envelope)), envelope.message_id);
    }
}

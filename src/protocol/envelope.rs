//! Message envelope built fresh for every exchange

use crate::agent::AgentRequest;
use crate::log::CommunicationLogEntry;
use crate::types::CorrelationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Header carrying the per-attempt deadline in milliseconds
pub const HEADER_TIMEOUT_MS: &str = "timeout_ms";
/// Header carrying the request's operation name
pub const HEADER_REQUEST_TYPE: &str = "request_type";
/// Header carrying the response type expected by the caller
pub const HEADER_RESPONSE_TYPE: &str = "response_type";

/// Envelope around one request. Never persisted as-is; see [`MessageEnvelope::to_log_entry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Correlation id of the exchange
    pub correlation_id: CorrelationId,
    /// Sending agent
    pub source: String,
    /// Receiving agent
    pub target: String,
    /// Request payload
    pub payload: AgentRequest,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Header map
    pub headers: HashMap<String, String>,
}

impl MessageEnvelope {
    /// Build an envelope for a request
    pub fn new(
        correlation_id: CorrelationId,
        source: impl Into<String>,
        target: impl Into<String>,
        payload: AgentRequest,
        timeout: Duration,
        response_type: &str,
    ) -> Self {
        let mut headers = HashMap::new();
        headers.insert(HEADER_TIMEOUT_MS.to_string(), timeout.as_millis().to_string());
        headers.insert(
            HEADER_REQUEST_TYPE.to_string(),
            payload.operation.name().to_string(),
        );
        headers.insert(HEADER_RESPONSE_TYPE.to_string(), response_type.to_string());

        Self {
            correlation_id,
            source: source.into(),
            target: target.into(),
            payload,
            created_at: Utc::now(),
            headers,
        }
    }

    /// Header value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Operation name of the payload
    pub fn message_type(&self) -> &'static str {
        self.payload.operation.name()
    }

    /// Project the envelope and its outcome into a log entry
    pub fn to_log_entry(
        &self,
        success: bool,
        elapsed: Duration,
        error_message: Option<String>,
        mut metadata: serde_json::Map<String, serde_json::Value>,
    ) -> CommunicationLogEntry {
        metadata.insert("request_id".to_string(), self.payload.id.to_string().into());
        for (name, value) in &self.headers {
            metadata.insert(name.clone(), value.clone().into());
        }

        CommunicationLogEntry {
            id: Uuid::new_v4(),
            correlation_id: self.correlation_id,
            source_agent: self.source.clone(),
            target_agent: self.target.clone(),
            message_type: self.message_type().to_string(),
            success,
            execution_time_ms: elapsed.as_millis() as u64,
            error_message,
            created_at: Utc::now(),
            metadata: serde_json::Value::Object(metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::notify_request;

    #[test]
    fn test_envelope_headers_and_projection() {
        let correlation = CorrelationId::new();
        let envelope = MessageEnvelope::new(
            correlation,
            "orchestrator",
            "sql_generation",
            notify_request(),
            Duration::from_secs(30),
            "serde_json::value::Value",
        );

        assert_eq!(envelope.header(HEADER_TIMEOUT_MS), Some("30000"));
        assert_eq!(envelope.header(HEADER_REQUEST_TYPE), Some("notify"));

        let entry = envelope.to_log_entry(
            false,
            Duration::from_millis(42),
            Some("boom".into()),
            serde_json::Map::new(),
        );
        assert_eq!(entry.correlation_id, correlation);
        assert_eq!(entry.source_agent, "orchestrator");
        assert_eq!(entry.target_agent, "sql_generation");
        assert_eq!(entry.message_type, "notify");
        assert_eq!(entry.execution_time_ms, 42);
        assert_eq!(entry.metadata["timeout_ms"], "30000");
        assert_eq!(entry.metadata["request_id"], envelope.payload.id.to_string());
    }
}

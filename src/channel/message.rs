//! Typed wire messages exchanged between the orchestrator and workers.
//!
//! The wire format is UTF-8 JSON, one message per `\n`-terminated line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Closed set of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Orchestrator hands a worker its instructions and workspace.
    TaskAssignment,
    /// Worker signals success.
    TaskCompleted,
    /// Worker signals failure.
    TaskFailed,
    /// Worker asks a reviewer to look at its output.
    ReviewRequest,
    /// Reviewer approves with feedback.
    ReviewApproved,
    /// Reviewer rejects with feedback and issues.
    ReviewRejected,
    /// Out-of-band help request.
    Escalation,
    /// Liveness signal with no protocol effect.
    Heartbeat,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAssignment => "task-assignment",
            Self::TaskCompleted => "task-completed",
            Self::TaskFailed => "task-failed",
            Self::ReviewRequest => "review-request",
            Self::ReviewApproved => "review-approved",
            Self::ReviewRejected => "review-rejected",
            Self::Escalation => "escalation",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    pub to: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl WireMessage {
    pub fn new(
        kind: MessageKind,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            from: from.into(),
            to: to.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line of the wire format.
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }

    pub fn heartbeat(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(MessageKind::Heartbeat, from, to, Value::Null)
    }

    pub fn task_assignment(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: &TaskAssignmentPayload,
    ) -> Result<Self> {
        Ok(Self::new(
            MessageKind::TaskAssignment,
            from,
            to,
            serde_json::to_value(payload)?,
        ))
    }

    pub fn task_completed(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: &TaskCompletedPayload,
    ) -> Result<Self> {
        Ok(Self::new(
            MessageKind::TaskCompleted,
            from,
            to,
            serde_json::to_value(payload)?,
        ))
    }

    pub fn task_failed(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: &TaskFailedPayload,
    ) -> Result<Self> {
        Ok(Self::new(
            MessageKind::TaskFailed,
            from,
            to,
            serde_json::to_value(payload)?,
        ))
    }

    pub fn review_request(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: &ReviewRequestPayload,
    ) -> Result<Self> {
        Ok(Self::new(
            MessageKind::ReviewRequest,
            from,
            to,
            serde_json::to_value(payload)?,
        ))
    }

    pub fn escalation(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: &EscalationPayload,
    ) -> Result<Self> {
        Ok(Self::new(
            MessageKind::Escalation,
            from,
            to,
            serde_json::to_value(payload)?,
        ))
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignmentPayload {
    pub task_id: String,
    pub instructions: String,
    pub workspace_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedPayload {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailedPayload {
    pub task_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequestPayload {
    pub review_id: String,
    pub task_id: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewApprovedPayload {
    pub task_id: String,
    pub review_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRejectedPayload {
    pub task_id: String,
    pub review_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationPayload {
    pub task_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageKind::TaskAssignment).unwrap(),
            "\"task-assignment\""
        );
        assert_eq!(
            serde_json::to_string(&MessageKind::ReviewApproved).unwrap(),
            "\"review-approved\""
        );
    }

    #[test]
    fn test_line_round_trip() {
        let msg = WireMessage::task_completed(
            "worker-1",
            "orchestrator",
            &TaskCompletedPayload {
                task_id: "t-1".into(),
                result: Some("done".into()),
                modified_files: vec!["src/lib.rs".into()],
            },
        )
        .unwrap()
        .with_correlation("corr-1");

        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(!line.trim_end().contains('\n'));

        let parsed = WireMessage::from_line(&line).unwrap();
        assert_eq!(parsed, msg);

        // Byte-stable after a second round trip.
        assert_eq!(parsed.to_line().unwrap(), line);
    }

    #[test]
    fn test_wire_field_names() {
        let msg = WireMessage::heartbeat("a", "b").with_correlation("c-1");
        let json: serde_json::Value = serde_json::from_str(msg.to_line().unwrap().trim()).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["correlationId"], "c-1");
        assert!(json.get("correlation_id").is_none());
    }

    #[test]
    fn test_correlation_omitted_when_absent() {
        let msg = WireMessage::heartbeat("a", "b");
        let json: serde_json::Value = serde_json::from_str(msg.to_line().unwrap().trim()).unwrap();
        assert!(json.get("correlationId").is_none());
    }

    #[test]
    fn test_payload_decoding() {
        let msg = WireMessage::task_assignment(
            "orchestrator",
            "worker-1",
            &TaskAssignmentPayload {
                task_id: "t-1".into(),
                instructions: "do the thing".into(),
                workspace_path: "/work/t-1".into(),
                worker_type: None,
            },
        )
        .unwrap();

        let payload: TaskAssignmentPayload = msg.payload_as().unwrap();
        assert_eq!(payload.task_id, "t-1");
        assert_eq!(payload.workspace_path, "/work/t-1");
    }
}

//! The mail record exchanged between nodes.
//!
//! Mail is immutable once it reaches a terminal status. The on-disk form is
//! UTF-8 JSON with camelCase keys; unknown keys are captured and re-emitted
//! so third-party fields survive a trip through the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ids::NodeId;

/// Origin classification for a mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailType {
    Human,
    Agent,
    System,
    Cron,
    External,
    Bounce,
}

/// Delivery priority. Advisory only; the router does not reorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Mail lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailStatus {
    Queued,
    Routed,
    Delivered,
    Bounced,
    Failed,
}

impl MailStatus {
    /// Terminal statuses freeze the record: no further field changes.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Bounced | Self::Failed)
    }
}

/// Mail metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailMetadata {
    #[serde(rename = "type")]
    pub mail_type: MailType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<Uuid>,
    /// Unknown metadata keys, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MailMetadata {
    pub fn new(mail_type: MailType) -> Self {
        Self {
            mail_type,
            priority: Priority::Normal,
            in_reply_to: None,
            extra: Map::new(),
        }
    }
}

/// Reference to an attachment blob held by the shared file store.
///
/// Mail never embeds attachment bytes; cross-agent hops share the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

/// A single mail message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mail {
    /// Globally unique message identifier.
    pub id: Uuid,
    pub from: NodeId,
    pub to: NodeId,
    pub subject: String,
    pub body: String,
    /// RFC 3339 UTC creation time.
    pub timestamp: DateTime<Utc>,
    pub metadata: MailMetadata,
    pub status: MailStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<AttachmentRef>>,
    /// Set only when `status == Bounced`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_reason: Option<String>,
    /// Unknown top-level keys, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Mail {
    pub fn new(
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        subject: impl Into<String>,
        body: impl Into<String>,
        mail_type: MailType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            timestamp: Utc::now(),
            metadata: MailMetadata::new(mail_type),
            status: MailStatus::Queued,
            attachments: None,
            bounce_reason: None,
            extra: Map::new(),
        }
    }

    /// Copy with a new status. Refuses to thaw a terminal record.
    pub fn with_status(mut self, status: MailStatus) -> Self {
        debug_assert!(
            !self.status.is_terminal() || self.status == status,
            "terminal mail must not change status"
        );
        self.status = status;
        self
    }

    /// Build the bounce notice for this mail.
    pub fn bounce(&self, reason: impl Into<String>) -> Mail {
        let reason = reason.into();
        let mut metadata = MailMetadata::new(MailType::Bounce);
        metadata.in_reply_to = Some(self.id);
        Mail {
            id: Uuid::new_v4(),
            from: NodeId::system(),
            to: self.from.clone(),
            subject: format!("Bounced: {}", self.subject),
            body: reason.clone(),
            timestamp: Utc::now(),
            metadata,
            status: MailStatus::Queued,
            attachments: None,
            bounce_reason: Some(reason),
            extra: Map::new(),
        }
    }

    pub fn is_bounce(&self) -> bool {
        self.metadata.mail_type == MailType::Bounce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mail_json_roundtrip() {
        let mail = Mail::new("bee-1", "bee-2", "hi", "body", MailType::Agent);
        let json = serde_json::to_string(&mail).unwrap();
        let parsed: Mail = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, mail);
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let mut mail = Mail::new("human", "bee-1", "s", "b", MailType::Human);
        mail.metadata.in_reply_to = Some(Uuid::nil());
        mail.bounce_reason = Some("nope".to_string());
        let value = serde_json::to_value(&mail).unwrap();
        assert!(value.get("bounceReason").is_some());
        assert_eq!(value["metadata"]["type"], "human");
        assert!(value["metadata"].get("inReplyTo").is_some());
    }

    #[test]
    fn test_priority_defaults_to_normal() {
        let parsed: Mail = serde_json::from_value(json!({
            "id": Uuid::nil(),
            "from": "bee-1",
            "to": "human",
            "subject": "s",
            "body": "b",
            "timestamp": "2026-01-01T00:00:00Z",
            "metadata": {"type": "agent"},
            "status": "queued",
        }))
        .unwrap();
        assert_eq!(parsed.metadata.priority, Priority::Normal);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let input = json!({
            "id": Uuid::nil(),
            "from": "bee-1",
            "to": "human",
            "subject": "s",
            "body": "b",
            "timestamp": "2026-01-01T00:00:00Z",
            "metadata": {"type": "agent", "traceId": "abc-123"},
            "status": "queued",
            "xVendor": {"k": 1},
        });
        let parsed: Mail = serde_json::from_value(input).unwrap();
        let out = serde_json::to_value(&parsed).unwrap();
        assert_eq!(out["xVendor"]["k"], 1);
        assert_eq!(out["metadata"]["traceId"], "abc-123");
    }

    #[test]
    fn test_bounce_shape() {
        let mail = Mail::new("bee-1", "bee-2", "report", "x", MailType::Agent);
        let bounce = mail.bounce("no route from bee-1 to bee-2");
        assert_eq!(bounce.from, NodeId::system());
        assert_eq!(bounce.to, NodeId::from("bee-1"));
        assert_eq!(bounce.subject, "Bounced: report");
        assert_eq!(bounce.metadata.mail_type, MailType::Bounce);
        assert_eq!(bounce.metadata.in_reply_to, Some(mail.id));
        assert!(bounce.bounce_reason.is_some());
        assert!(bounce.is_bounce());
    }

    #[test]
    fn test_terminal_status() {
        assert!(MailStatus::Delivered.is_terminal());
        assert!(MailStatus::Bounced.is_terminal());
        assert!(MailStatus::Failed.is_terminal());
        assert!(!MailStatus::Queued.is_terminal());
        assert!(!MailStatus::Routed.is_terminal());
    }
}

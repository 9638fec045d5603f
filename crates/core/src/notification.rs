//! Notification lifecycle and wire payload types.
//!
//! [`NotificationStatus`] is the store-level state machine:
//!
//! ```text
//! pending --deliver--> delivered --ack--> read
//! pending --ttl------> expired
//! ```
//!
//! [`NotificationContent`] is the projection that travels over the bus, sits
//! in the offline queue and is written to the client stream, one JSON object
//! per frame.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Status state machine
// ---------------------------------------------------------------------------

/// Delivery status of a stored notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Read,
    Expired,
}

impl NotificationStatus {
    /// The value stored in the `notifications.status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Expired => "expired",
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Delivered)
                | (Self::Delivered, Self::Read)
                | (Self::Pending, Self::Expired)
        )
    }

    /// Statuses from which `target` may be reached in one step.
    ///
    /// Used to build guarded `UPDATE ... WHERE status = ANY(..)` statements so
    /// the database enforces the same invariant as [`can_transition_to`].
    ///
    /// [`can_transition_to`]: NotificationStatus::can_transition_to
    pub fn allowed_sources(target: Self) -> &'static [Self] {
        match target {
            Self::Pending => &[],
            Self::Delivered => &[Self::Pending],
            Self::Read => &[Self::Delivered],
            Self::Expired => &[Self::Pending],
        }
    }

    /// `read` and `expired` have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Expired)
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "expired" => Ok(Self::Expired),
            other => Err(CoreError::Validation(format!(
                "Unknown notification status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire payload
// ---------------------------------------------------------------------------

/// Presentation hints attached to a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMeta {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The payload delivered to clients.
///
/// `notification_id` is `None` for ephemeral events that were never
/// persisted; once the dispatcher falls back to durable delivery it always
/// carries the store id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub notification_id: Option<DbId>,
    pub message: String,
    #[serde(default)]
    pub meta: NotificationMeta,
}

impl NotificationContent {
    /// Create an ephemeral payload with no store id and empty meta.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            notification_id: None,
            message: message.into(),
            meta: NotificationMeta::default(),
        }
    }

    /// Attach the store id.
    pub fn with_id(mut self, notification_id: DbId) -> Self {
        self.notification_id = Some(notification_id);
        self
    }

    /// Replace the presentation meta.
    pub fn with_meta(mut self, meta: NotificationMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Serialize to the JSON text frame used on the bus and the client stream.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON text frame.
    pub fn from_wire(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn forward_transitions_are_allowed() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Pending.can_transition_to(Expired));
    }

    #[test]
    fn backward_and_terminal_transitions_are_rejected() {
        use NotificationStatus::*;
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Read.can_transition_to(Pending));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Expired.can_transition_to(Pending));
        assert!(!Expired.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Expired));
        assert!(!Pending.can_transition_to(Read));
        assert!(Read.is_terminal());
        assert!(Expired.is_terminal());
        assert!(!Pending.is_terminal());
    }

    #[test]
    fn allowed_sources_agree_with_state_machine() {
        use NotificationStatus::*;
        let all = [Pending, Delivered, Read, Expired];
        for target in all {
            for source in all {
                let listed = NotificationStatus::allowed_sources(target).contains(&source);
                assert_eq!(
                    listed,
                    source.can_transition_to(target),
                    "{source} -> {target}"
                );
            }
        }
    }

    #[test]
    fn status_parses_column_values() {
        assert_eq!(
            "delivered".parse::<NotificationStatus>().unwrap(),
            NotificationStatus::Delivered
        );
        assert_matches!(
            "archived".parse::<NotificationStatus>(),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn wire_format_uses_snake_case_fields() {
        let content = NotificationContent::new("Goal met")
            .with_id(7)
            .with_meta(NotificationMeta {
                url: Some("/goals/3".into()),
                image_url: Some("https://cdn.example/goal.png".into()),
                tags: vec!["goal".into()],
            });

        let value: serde_json::Value =
            serde_json::from_str(&content.to_wire().unwrap()).unwrap();
        assert_eq!(value["notification_id"], 7);
        assert_eq!(value["message"], "Goal met");
        assert_eq!(value["meta"]["url"], "/goals/3");
        assert_eq!(value["meta"]["image_url"], "https://cdn.example/goal.png");
        assert_eq!(value["meta"]["tags"][0], "goal");
    }

    #[test]
    fn wire_round_trip_preserves_every_field() {
        let content = NotificationContent::new("Budget exceeded")
            .with_id(11)
            .with_meta(NotificationMeta {
                url: Some("/budgets/1".into()),
                image_url: None,
                tags: vec!["budget".into(), "alert".into()],
            });

        let decoded = NotificationContent::from_wire(&content.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn missing_meta_decodes_to_default() {
        let decoded =
            NotificationContent::from_wire(r#"{"notification_id":null,"message":"hi"}"#).unwrap();
        assert_eq!(decoded.notification_id, None);
        assert_eq!(decoded.meta, NotificationMeta::default());
    }
}

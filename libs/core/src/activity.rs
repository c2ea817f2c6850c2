use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Activity kinds understood by the session client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityType {
    Message,
    Typing,
    ConversationUpdate,
    Event,
    ContactRelationUpdate,
    DeleteUserData,
    EndOfConversation,
    #[serde(other)]
    Unknown,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Message => "message",
            ActivityType::Typing => "typing",
            ActivityType::ConversationUpdate => "conversationUpdate",
            ActivityType::Event => "event",
            ActivityType::ContactRelationUpdate => "contactRelationUpdate",
            ActivityType::DeleteUserData => "deleteUserData",
            ActivityType::EndOfConversation => "endOfConversation",
            ActivityType::Unknown => "unknown",
        }
    }
}

/// Bot Framework activity as exchanged with the remote agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub r#type: ActivityType,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_actions: Option<SuggestedActions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

impl Activity {
    /// Creates an activity of the given type with an empty payload.
    pub fn new(r#type: ActivityType) -> Self {
        Self {
            id: String::new(),
            r#type,
            timestamp: None,
            from: None,
            text: None,
            attachments: Vec::new(),
            suggested_actions: None,
            channel_data: None,
            entities: Vec::new(),
            name: None,
            value: None,
            locale: None,
            reply_to_id: None,
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        let mut activity = Self::new(ActivityType::Message);
        activity.text = Some(text.into());
        activity
    }

    pub fn event(name: impl Into<String>, value: Option<Value>) -> Self {
        let mut activity = Self::new(ActivityType::Event);
        activity.name = Some(name.into());
        activity.value = value;
        activity
    }

    pub fn with_from(mut self, id: impl Into<String>) -> Self {
        self.from = Some(ChannelAccount {
            id: id.into(),
            name: None,
            role: None,
        });
        self
    }

    pub fn with_channel_data(mut self, channel_data: Value) -> Self {
        self.channel_data = Some(channel_data);
        self
    }

    /// Fills the id and timestamp when the sender left them blank.
    pub fn ensure_defaults(&mut self) {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(OffsetDateTime::now_utc());
        }
    }

    pub fn from_id(&self) -> Option<&str> {
        self.from.as_ref().map(|from| from.id.as_str())
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    /// True when `channelData.<key>` is the boolean `true`.
    pub fn channel_flag(&self, key: &str) -> bool {
        self.channel_data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn channel_str(&self, key: &str) -> Option<&str> {
        self.channel_data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn has_suggested_actions(&self) -> bool {
        self.suggested_actions
            .as_ref()
            .map(|suggested| !suggested.actions.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedActions {
    #[serde(default)]
    pub actions: Vec<CardAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardAction {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_wire_activity() {
        let activity: Activity = serde_json::from_value(json!({
            "type": "message",
            "id": "a-1",
            "timestamp": "2024-04-02T12:00:00Z",
            "from": {"id": "bot", "name": "Agent"},
            "text": "hello",
            "channelData": {"streaming": true, "streamId": "s-1"},
            "suggestedActions": {"actions": [{"type": "imBack", "title": "Yes", "value": "yes"}]}
        }))
        .unwrap();

        assert_eq!(activity.r#type, ActivityType::Message);
        assert_eq!(activity.from_id(), Some("bot"));
        assert!(activity.channel_flag("streaming"));
        assert!(!activity.channel_flag("streamingEnd"));
        assert_eq!(activity.channel_str("streamId"), Some("s-1"));
        assert!(activity.has_suggested_actions());
        assert!(activity.timestamp.is_some());
    }

    #[test]
    fn unknown_types_do_not_fail_decoding() {
        let activity: Activity =
            serde_json::from_value(json!({"type": "invoke", "name": "x"})).unwrap();
        assert_eq!(activity.r#type, ActivityType::Unknown);
    }

    #[test]
    fn outbound_activity_omits_empty_fields() {
        let activity = Activity::message("hi").with_from("user-1");
        let value = serde_json::to_value(&activity).unwrap();
        assert_eq!(
            value,
            json!({"type": "message", "from": {"id": "user-1"}, "text": "hi"})
        );
    }
}

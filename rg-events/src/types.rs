use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(GroupId);
id_newtype!(SenderId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Private,
    Group,
}

/// Identity used for admission and concurrency decisions. Two messages share
/// a `ConversationKey` iff they come from the same sender in the same chat
/// context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn derive(chat_type: ChatType, group_id: Option<&GroupId>, sender_id: &SenderId) -> Self {
        match (chat_type, group_id) {
            (ChatType::Group, Some(group)) => {
                Self(format!("group:{}:sender:{}", group.as_str(), sender_id))
            }
            _ => Self(format!("private:{sender_id}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConversationKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group-wide identity, coarser than [`ConversationKey`]. Used for group
/// fatigue and burst-merge windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn derive(group_id: &GroupId) -> Self {
        Self(format!("group:{}", group_id.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Marks an event that was synthesized by the proactive engine rather than
/// received from a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProactiveOrigin {
    /// True when no proactive message has gone out since the user last spoke.
    /// Downstream tone selection keys off this.
    pub is_first_after_user: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub message_id: MessageId,
    pub chat_type: ChatType,
    pub group_id: Option<GroupId>,
    pub sender_id: SenderId,
    pub sender_name: String,
    pub is_explicit_mention: bool,
    pub is_name_mention: bool,
    pub text: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub proactive: Option<ProactiveOrigin>,
}

impl InboundEvent {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::derive(self.chat_type, self.group_id.as_ref(), &self.sender_id)
    }

    pub fn group_key(&self) -> Option<GroupKey> {
        match (self.chat_type, self.group_id.as_ref()) {
            (ChatType::Group, Some(group)) => Some(GroupKey::derive(group)),
            _ => None,
        }
    }

    pub fn is_proactive(&self) -> bool {
        self.proactive.is_some()
    }

    /// Explicit mentions carry through fatigue and gate denials.
    pub fn is_important(&self) -> bool {
        self.is_explicit_mention
    }
}

/// One sender's contribution to a merged burst.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderEntry {
    pub sender_id: SenderId,
    pub sender_name: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Several near-simultaneous messages from distinct senders in one group,
/// coalesced into a single generation request. Entries are in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedMessage {
    pub group_id: GroupId,
    pub entries: Vec<SenderEntry>,
    pub merged_at: DateTime<Utc>,
}

/// What the reply generator consumes: either a plain inbound event or a
/// burst-merged bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationRequest {
    Single(InboundEvent),
    Merged(MergedMessage),
}

impl GenerationRequest {
    pub fn primary_text(&self) -> &str {
        match self {
            Self::Single(event) => &event.text,
            Self::Merged(merged) => merged
                .entries
                .first()
                .map(|e| e.text.as_str())
                .unwrap_or(""),
        }
    }
}

/// Output of the external reply generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedReply {
    pub text: String,
    #[serde(default)]
    pub resource_refs: Vec<String>,
    /// True when producing this reply ran a tool with externally visible
    /// effects; such replies are never eligible for dedup shortcuts.
    #[serde(default)]
    pub has_tool_side_effect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_event(group: &str, sender: &str) -> InboundEvent {
        InboundEvent {
            message_id: MessageId::new("m1"),
            chat_type: ChatType::Group,
            group_id: Some(GroupId::new(group)),
            sender_id: SenderId::new(sender),
            sender_name: sender.to_string(),
            is_explicit_mention: false,
            is_name_mention: false,
            text: "hello".to_string(),
            received_at: Utc::now(),
            proactive: None,
        }
    }

    #[test]
    fn conversation_key_separates_senders_within_a_group() {
        let a = group_event("g1", "alice").conversation_key();
        let b = group_event("g1", "bob").conversation_key();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "group:g1:sender:alice");
    }

    #[test]
    fn private_key_ignores_group_id() {
        let mut event = group_event("g1", "alice");
        event.chat_type = ChatType::Private;
        assert_eq!(event.conversation_key().as_str(), "private:alice");
        assert!(event.group_key().is_none());
    }

    #[test]
    fn group_key_is_coarser_than_conversation_key() {
        let a = group_event("g1", "alice");
        let b = group_event("g1", "bob");
        assert_eq!(a.group_key(), b.group_key());
        assert_eq!(a.group_key().expect("group key").as_str(), "group:g1");
    }
}

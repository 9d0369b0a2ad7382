use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{GroupId, UserId, SYSTEM_USER},
    error::ProtocolError,
};

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Message kind, encoded as a small integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Chat = 1,
    Broadcast = 2,
    Ack = 3,
    System = 4,
    UpdateBlockList = 5,
    Apply = 6,
}

impl MessageType {
    /// User-originated kinds; the sender receives an Ack once the pipeline ran.
    pub fn requires_ack(self) -> bool {
        matches!(self, MessageType::Chat | MessageType::Broadcast)
    }

    /// Kinds that fall back to the offline store when the recipient is away.
    pub fn is_cacheable(self) -> bool {
        !matches!(self, MessageType::Ack)
    }

    /// Kinds tracked in the pending-ack set after a live delivery.
    pub fn is_tracked(self) -> bool {
        !matches!(self, MessageType::Ack)
    }

    /// Kinds whose `to` names a group rather than a user.
    pub fn is_fanout(self) -> bool {
        matches!(self, MessageType::Broadcast | MessageType::Apply)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Chat),
            2 => Ok(MessageType::Broadcast),
            3 => Ok(MessageType::Ack),
            4 => Ok(MessageType::System),
            5 => Ok(MessageType::UpdateBlockList),
            6 => Ok(MessageType::Apply),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// Type-specific payload attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Extra {
    #[default]
    None,
    /// Explicit fan-out list; skips the group membership lookup.
    Recipients(Vec<UserId>),
    /// Set on each per-recipient copy of a fan-out message.
    Group(GroupId),
    /// Block-list notification: `true` when the recipient was blocked.
    Blocked(bool),
}

impl Extra {
    pub fn is_none(&self) -> bool {
        matches!(self, Extra::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub from: UserId,
    #[serde(default)]
    pub to: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default, skip_serializing_if = "Extra::is_none")]
    pub extra: Extra,
}

impl Message {
    pub fn new(kind: MessageType, from: UserId, to: i64, body: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind,
            from,
            to,
            body: body.into(),
            time: 0,
            extra: Extra::None,
        }
    }

    pub fn with_extra(mut self, extra: Extra) -> Self {
        self.extra = extra;
        self
    }

    /// Assigns an id and a timestamp when the producer left them empty.
    pub fn ensure_identity(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.time == 0 {
            self.time = now_millis();
        }
    }

    pub fn recipient(&self) -> UserId {
        UserId(self.to)
    }

    pub fn target_group(&self) -> GroupId {
        GroupId(self.to)
    }

    /// The confirmation sent back to the sender of this message.
    pub fn ack(&self) -> Message {
        Message {
            id: self.id.clone(),
            kind: MessageType::Ack,
            from: SYSTEM_USER,
            to: self.from.0,
            body: String::new(),
            time: self.time,
            extra: Extra::None,
        }
    }

    /// Copy handed to one recipient of a fan-out; `extra` names the group the
    /// message was addressed to.
    pub fn fanout_copy(&self) -> Message {
        let mut copy = self.clone();
        if self.kind.is_fanout() {
            copy.extra = Extra::Group(self.target_group());
        }
        copy
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let body = match self.kind {
            MessageType::Ack => serde_json::to_value(AckBody::from(self))?,
            _ => serde_json::to_value(self)?,
        };
        Ok(Envelope {
            kind: self.kind,
            body,
        })
    }

    /// Serializes the message into its wire frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope()?)
    }
}

/// Body of an Ack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    #[serde(default)]
    pub to: UserId,
    #[serde(default)]
    pub time: i64,
}

impl From<&Message> for AckBody {
    fn from(message: &Message) -> Self {
        Self {
            kind: MessageType::Ack,
            id: message.id.clone(),
            to: UserId(message.to),
            time: message.time,
        }
    }
}

/// Wire envelope: `{type, body}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    body: serde_json::Value,
}

/// A frame a client is allowed to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Chat(Message),
    Broadcast(Message),
    Ack(AckBody),
}

impl ClientFrame {
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: RawEnvelope = serde_json::from_slice(raw)?;
        let kind = MessageType::try_from(envelope.kind)?;
        match kind {
            MessageType::Chat | MessageType::Broadcast => {
                let mut message: Message = serde_json::from_value(envelope.body)?;
                message.kind = kind;
                Ok(if kind == MessageType::Chat {
                    ClientFrame::Chat(message)
                } else {
                    ClientFrame::Broadcast(message)
                })
            }
            MessageType::Ack => Ok(ClientFrame::Ack(serde_json::from_value(envelope.body)?)),
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }
}

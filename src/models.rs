use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = Uuid;
pub type ChatId = Uuid;
pub type MessageId = Uuid;

/// Credential pair for the lifetime of a login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub auth_token: String,
}

impl Session {
    pub fn new(user_id: UserId, auth_token: impl Into<String>) -> Self {
        Session {
            user_id,
            auth_token: auth_token.into(),
        }
    }

    pub fn has_credential(&self) -> bool {
        !self.auth_token.trim().is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Channel,
}

impl ChatKind {
    pub fn label(self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Channel => "channel",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(alias = "display_name", default)]
    pub display_name: String,
    #[serde(alias = "last_message", default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(alias = "chat_id")]
    pub chat_id: ChatId,
    #[serde(alias = "sender_id")]
    pub sender_id: UserId,
    #[serde(alias = "sender_name", default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(alias = "created_at")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// One-line preview used by the chat list.
    pub fn preview(&self) -> String {
        match &self.sender_name {
            Some(name) => format!("{}: {}", name, self.content),
            None => self.content.clone(),
        }
    }
}

/// Ordered from least to most privileged.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
    Owner,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: UserId,
    pub name: String,
    pub role: Role,
}

/// Entry of the user directory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Request body for creating a group or channel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub members: Vec<UserId>,
    pub admins: Vec<UserId>,
}

impl NewGroup {
    pub fn new(name: impl Into<String>, kind: ChatKind) -> Self {
        NewGroup {
            name: name.into(),
            kind,
            description: None,
            members: Vec::new(),
            admins: Vec::new(),
        }
    }

    /// Toggles membership; deselecting a user also drops their admin flag.
    pub fn toggle_member(&mut self, user_id: UserId) {
        if let Some(pos) = self.members.iter().position(|id| *id == user_id) {
            self.members.remove(pos);
            self.admins.retain(|id| *id != user_id);
        } else {
            self.members.push(user_id);
        }
    }

    /// Only selected members can be flagged as admins.
    pub fn toggle_admin(&mut self, user_id: UserId) {
        if let Some(pos) = self.admins.iter().position(|id| *id == user_id) {
            self.admins.remove(pos);
        } else if self.members.contains(&user_id) {
            self.admins.push(user_id);
        }
    }
}

use std::collections::HashMap;

use crate::models::{ChatId, UserId};

/// Who is typing in the active chat. Cleared whenever the active chat changes.
#[derive(Debug, Default, Clone)]
pub struct TypingTracker {
    chat_id: Option<ChatId>,
    users: HashMap<UserId, bool>,
}

impl TypingTracker {
    pub fn new(chat_id: Option<ChatId>) -> Self {
        TypingTracker {
            chat_id,
            users: HashMap::new(),
        }
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.chat_id
    }

    pub fn switch_chat(&mut self, chat_id: Option<ChatId>) {
        if self.chat_id != chat_id {
            self.chat_id = chat_id;
            self.users.clear();
        }
    }

    /// Returns false when the event belongs to another chat.
    pub fn on_typing(&mut self, user_id: UserId, chat_id: ChatId) -> bool {
        self.set(user_id, chat_id, true)
    }

    pub fn on_stop_typing(&mut self, user_id: UserId, chat_id: ChatId) -> bool {
        self.set(user_id, chat_id, false)
    }

    pub fn is_typing(&self, user_id: &UserId) -> bool {
        self.users.get(user_id).copied().unwrap_or(false)
    }

    pub fn anyone_typing(&self) -> bool {
        self.users.values().any(|typing| *typing)
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .users
            .iter()
            .filter(|(_, typing)| **typing)
            .map(|(id, _)| *id)
            .collect();
        users.sort();
        users
    }

    fn set(&mut self, user_id: UserId, chat_id: ChatId, typing: bool) -> bool {
        if self.chat_id != Some(chat_id) {
            return false;
        }
        self.users.insert(user_id, typing);
        true
    }
}

use std::collections::HashSet;

use log::debug;

use crate::models::{Chat, ChatId, Message};

/// Ordered chats plus the current selection.
#[derive(Debug, Default, Clone)]
pub struct ChatList {
    chats: Vec<Chat>,
    selected: Option<ChatId>,
}

impl ChatList {
    pub fn new() -> Self {
        ChatList::default()
    }

    /// Reconciles with an authoritative list. Returns true when the selection moved.
    pub fn replace(&mut self, fetched: Vec<Chat>) -> bool {
        let mut seen = HashSet::new();
        let mut next = Vec::with_capacity(fetched.len());
        for mut chat in fetched {
            if !seen.insert(chat.id) {
                continue;
            }
            if let Some(known) = self.get(&chat.id) {
                chat.last_message = newer(chat.last_message.take(), known.last_message.clone());
            }
            next.push(chat);
        }
        self.chats = next;
        debug!("Chat list replaced with {} chats", self.chats.len());
        self.reconcile_selection()
    }

    /// Records `message` as the chat's last message when it is the newest seen.
    pub fn apply_message(&mut self, message: &Message) -> bool {
        let Some(chat) = self.chats.iter_mut().find(|c| c.id == message.chat_id) else {
            return false;
        };
        let replace = match &chat.last_message {
            Some(current) => message.created_at >= current.created_at,
            None => true,
        };
        if replace {
            chat.last_message = Some(message.clone());
        }
        replace
    }

    pub fn select(&mut self, chat_id: ChatId) -> bool {
        if self.get(&chat_id).is_none() {
            return false;
        }
        self.selected = Some(chat_id);
        true
    }

    /// Adds a chat, or refreshes it in place if already known. A refresh keeps
    /// the newer of the two last messages.
    pub fn insert(&mut self, mut chat: Chat) {
        match self.chats.iter_mut().find(|c| c.id == chat.id) {
            Some(existing) => {
                chat.last_message = newer(chat.last_message.take(), existing.last_message.take());
                *existing = chat;
            }
            None => self.chats.push(chat),
        }
    }

    /// Drops a chat. Returns true when the selection moved.
    pub fn remove(&mut self, chat_id: &ChatId) -> bool {
        self.chats.retain(|c| c.id != *chat_id);
        self.reconcile_selection()
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == *chat_id)
    }

    pub fn selected(&self) -> Option<ChatId> {
        self.selected
    }

    pub fn selected_chat(&self) -> Option<&Chat> {
        self.selected.and_then(|id| self.get(&id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chat> {
        self.chats.iter()
    }

    pub fn ids(&self) -> Vec<ChatId> {
        self.chats.iter().map(|c| c.id).collect()
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    /// Chats whose display name contains `query`, ignoring case.
    pub fn filter(&self, query: &str) -> Vec<&Chat> {
        let needle = query.trim().to_lowercase();
        self.chats
            .iter()
            .filter(|c| c.display_name.to_lowercase().contains(&needle))
            .collect()
    }

    fn reconcile_selection(&mut self) -> bool {
        let previous = self.selected;
        let still_present = previous.map_or(false, |id| self.get(&id).is_some());
        if !still_present {
            self.selected = self.chats.first().map(|c| c.id);
        }
        self.selected != previous
    }
}

fn newer(a: Option<Message>, b: Option<Message>) -> Option<Message> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.created_at > a.created_at { b } else { a }),
        (a, b) => a.or(b),
    }
}

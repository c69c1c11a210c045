use std::collections::HashSet;

use crate::models::{ChatId, Message, MessageId};

/// Appends `incoming` unless a message with the same id is already present.
pub fn apply(mut messages: Vec<Message>, incoming: Message) -> Vec<Message> {
    if !messages.iter().any(|m| m.id == incoming.id) {
        messages.push(incoming);
    }
    messages
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Appended,
    Duplicate,
    OtherChat,
}

/// Messages of the active chat, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct Thread {
    chat_id: Option<ChatId>,
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
}

impl Thread {
    pub fn new(chat_id: Option<ChatId>) -> Self {
        Thread {
            chat_id,
            ..Thread::default()
        }
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.chat_id
    }

    pub fn apply(&mut self, incoming: Message) -> Applied {
        if self.chat_id != Some(incoming.chat_id) {
            return Applied::OtherChat;
        }
        if !self.seen.insert(incoming.id) {
            return Applied::Duplicate;
        }
        self.messages.push(incoming);
        Applied::Appended
    }

    /// Replaces the thread with fetched history. Messages already received
    /// live but missing from the history stay at the end.
    pub fn load(&mut self, history: Vec<Message>) {
        let live = std::mem::take(&mut self.messages);
        self.seen.clear();
        for message in history.into_iter().chain(live) {
            if self.chat_id == Some(message.chat_id) && self.seen.insert(message.id) {
                self.messages.push(message);
            }
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

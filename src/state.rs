//! Event-driven client state.
//!
//! Every transition is a method call made from the single event loop. Methods
//! that need follow-up I/O return [`Effect`]s instead of performing it.

use log::{debug, info, warn};

use crate::chat_list::ChatList;
use crate::connection::ConnectionEvent;
use crate::error::ClientError;
use crate::membership::{MemberMutation, MembershipView, Roster};
use crate::models::{Chat, ChatId, ChatKind, Member, Message, UserId};
use crate::realtime::{ClientEvent, RoomSubscriptions, ServerEvent};
use crate::thread::{Applied, Thread};
use crate::typing::TypingTracker;

/// Follow-up work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Emit(ClientEvent),
    LoadThread(FetchTicket),
}

/// Identifies the selection a pending fetch was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    generation: u64,
}

impl FetchTicket {
    pub fn wants_members(&self) -> bool {
        self.kind != ChatKind::Private
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

/// The one overlay that may be open at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UiMode {
    #[default]
    Browsing,
    NewChat,
    PickUser,
    CreateGroup(ChatKind),
    AddMembers,
    ConfirmDelete,
    ConfirmLeave,
}

/// Message ready to be posted to the active chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub chat_id: ChatId,
    pub content: String,
}

pub struct ChatState {
    user_id: UserId,
    chats: ChatList,
    thread: Thread,
    typing: TypingTracker,
    roster: Roster,
    rooms: RoomSubscriptions,
    mode: UiMode,
    notices: Vec<Notice>,
    generation: u64,
    status: String,
}

impl ChatState {
    pub fn new(user_id: UserId) -> Self {
        ChatState {
            user_id,
            chats: ChatList::new(),
            thread: Thread::default(),
            typing: TypingTracker::default(),
            roster: Roster::default(),
            rooms: RoomSubscriptions::default(),
            mode: UiMode::Browsing,
            notices: Vec::new(),
            generation: 0,
            status: "Disconnected".to_string(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn chats(&self) -> &ChatList {
        &self.chats
    }

    pub fn active_chat(&self) -> Option<&Chat> {
        self.chats.selected_chat()
    }

    pub fn messages(&self) -> &[Message] {
        self.thread.messages()
    }

    pub fn members(&self) -> &Roster {
        &self.roster
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn rooms(&self) -> &RoomSubscriptions {
        &self.rooms
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Permissions in the active chat, if any.
    pub fn permissions(&self) -> Option<MembershipView> {
        let chat = self.active_chat()?;
        Some(MembershipView::new(chat.kind, self.user_id, &self.roster))
    }

    pub fn member(&self, id: &UserId) -> Option<&Member> {
        self.roster.get(id)
    }

    // ---- chat list ----

    pub fn chats_loaded(&mut self, result: Result<Vec<Chat>, ClientError>) -> Vec<Effect> {
        let chats = match result {
            Ok(chats) => chats,
            Err(e) => {
                warn!("Chat list refresh failed: {}", e);
                self.notify(NoticeLevel::Error, "Failed to load chats");
                return Vec::new();
            }
        };
        let moved = self.chats.replace(chats);
        let mut effects = self.join_known_rooms();
        if moved {
            effects.extend(self.activate());
        }
        effects
    }

    pub fn select_chat(&mut self, chat_id: ChatId) -> Vec<Effect> {
        if self.chats.selected() == Some(chat_id) {
            return Vec::new();
        }
        if !self.chats.select(chat_id) {
            debug!("Ignoring selection of unknown chat {}", chat_id);
            return Vec::new();
        }
        self.mode = UiMode::Browsing;
        self.activate()
    }

    /// Reloads the active chat's thread and members.
    pub fn reload_active(&mut self) -> Vec<Effect> {
        self.activate()
    }

    // ---- fetch results ----

    pub fn messages_loaded(
        &mut self,
        ticket: FetchTicket,
        result: Result<Vec<Message>, ClientError>,
    ) -> bool {
        if !self.is_current(&ticket) {
            debug!("Discarding stale message history for {}", ticket.chat_id);
            return false;
        }
        match result {
            Ok(history) => {
                self.thread.load(history);
                true
            }
            Err(e) => {
                warn!("Loading messages for {} failed: {}", ticket.chat_id, e);
                self.notify(NoticeLevel::Error, "Failed to load messages");
                false
            }
        }
    }

    pub fn members_loaded(
        &mut self,
        ticket: FetchTicket,
        result: Result<Vec<Member>, ClientError>,
    ) -> bool {
        if !self.is_current(&ticket) {
            debug!("Discarding stale member list for {}", ticket.chat_id);
            return false;
        }
        match result {
            Ok(members) => self.roster.replace(members),
            Err(e) => {
                debug!("Member list unavailable for {}: {}", ticket.chat_id, e);
                self.roster.clear();
            }
        }
        true
    }

    // ---- realtime ----

    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(message) => {
                self.chats.apply_message(&message);
                if self.thread.apply(message) == Applied::Duplicate {
                    debug!("Dropped duplicate message");
                }
            }
            ServerEvent::UserTyping { user_id, chat_id } => {
                self.typing.on_typing(user_id, chat_id);
            }
            ServerEvent::UserStopTyping { user_id, chat_id } => {
                self.typing.on_stop_typing(user_id, chat_id);
            }
        }
    }

    pub fn connection_event(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        match event {
            ConnectionEvent::Connected => {
                self.status = "Connected".to_string();
                if self.rooms.is_empty() {
                    return Vec::new();
                }
                info!("Rejoining {} chats after reconnect", self.rooms.all().len());
                vec![Effect::Emit(ClientEvent::JoinChats(self.rooms.all()))]
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                self.status = if attempt == 0 {
                    "Reconnecting".to_string()
                } else {
                    format!("Reconnecting (attempt {}, retry in {} ms)", attempt, delay.as_millis())
                };
                Vec::new()
            }
            ConnectionEvent::Error(message) => {
                let text = format!("Failed to connect to chat server: {}", message);
                self.notify(NoticeLevel::Error, text);
                Vec::new()
            }
            ConnectionEvent::Disconnected => {
                self.status = "Disconnected".to_string();
                self.notify(NoticeLevel::Error, "Disconnected from chat server");
                Vec::new()
            }
        }
    }

    // ---- composing ----

    pub fn compose(&self, content: &str) -> Result<Outgoing, ClientError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::Forbidden("message is empty"));
        }
        let chat = self.active_chat().ok_or(ClientError::Forbidden("no chat selected"))?;
        let allowed = self.permissions().map_or(false, |p| p.can_send());
        if !allowed {
            return Err(ClientError::Forbidden("only owners and admins can post in this channel"));
        }
        Ok(Outgoing {
            chat_id: chat.id,
            content: content.to_string(),
        })
    }

    /// Server confirmed (or rejected) a send.
    pub fn message_sent(
        &mut self,
        outgoing: Outgoing,
        result: Result<Message, ClientError>,
    ) -> Vec<Effect> {
        match result {
            Ok(message) => {
                self.chats.apply_message(&message);
                self.thread.apply(message);
                vec![Effect::Emit(ClientEvent::SendMessage {
                    chat_id: outgoing.chat_id,
                    content: outgoing.content,
                })]
            }
            Err(e) => {
                warn!("Sending to {} failed: {}", outgoing.chat_id, e);
                self.notify(NoticeLevel::Error, "Failed to send message");
                Vec::new()
            }
        }
    }

    pub fn typing_started(&self) -> Option<Effect> {
        let chat_id = self.chats.selected()?;
        Some(Effect::Emit(ClientEvent::Typing { chat_id }))
    }

    pub fn typing_stopped(&self) -> Option<Effect> {
        let chat_id = self.chats.selected()?;
        Some(Effect::Emit(ClientEvent::StopTyping { chat_id }))
    }

    // ---- membership ----

    /// Applies a server-confirmed roster change to the chat it was made in.
    pub fn member_mutation_confirmed(
        &mut self,
        chat_id: ChatId,
        result: Result<MemberMutation, ClientError>,
    ) {
        let mutation = match result {
            Ok(mutation) => mutation,
            Err(e) => {
                warn!("Membership change in {} failed: {}", chat_id, e);
                self.notify(NoticeLevel::Error, format!("Membership change failed: {}", e));
                return;
            }
        };
        if self.chats.selected() != Some(chat_id) {
            debug!("Membership change for inactive chat {}", chat_id);
            return;
        }
        if self.roster.apply(mutation) {
            self.notify(NoticeLevel::Success, "Members updated");
        }
    }

    /// The current user left `chat_id`, or deleted it.
    pub fn chat_removed(
        &mut self,
        chat_id: ChatId,
        result: Result<(), ClientError>,
    ) -> Vec<Effect> {
        if let Err(e) = result {
            warn!("Removing chat {} failed: {}", chat_id, e);
            self.notify(NoticeLevel::Error, format!("Failed to remove chat: {}", e));
            return Vec::new();
        }
        self.mode = UiMode::Browsing;
        self.notify(NoticeLevel::Success, "Chat removed");
        if self.chats.remove(&chat_id) {
            return self.activate();
        }
        Vec::new()
    }

    pub fn chat_created(&mut self, result: Result<Chat, ClientError>) -> Vec<Effect> {
        let chat = match result {
            Ok(chat) => chat,
            Err(e) => {
                warn!("Chat creation failed: {}", e);
                self.notify(NoticeLevel::Error, "Failed to create chat");
                return Vec::new();
            }
        };
        let chat_id = chat.id;
        self.chats.insert(chat);
        self.mode = UiMode::Browsing;
        self.notify(NoticeLevel::Success, "Chat created");
        let mut effects = self.join_known_rooms();
        effects.extend(self.select_chat(chat_id));
        effects
    }

    // ---- ui mode ----

    /// Opens an overlay. Gated overlays need the matching permission.
    pub fn open(&mut self, mode: UiMode) -> Result<(), ClientError> {
        let permissions = self.permissions();
        let allowed = match mode {
            UiMode::AddMembers => permissions.map_or(false, |p| p.can_add_members()),
            UiMode::ConfirmDelete => permissions.map_or(false, |p| p.can_delete_chat()),
            UiMode::ConfirmLeave => permissions.map_or(false, |p| p.can_leave()),
            UiMode::CreateGroup(ChatKind::Private) => false,
            _ => true,
        };
        if !allowed {
            return Err(ClientError::Forbidden("not allowed in this chat"));
        }
        self.mode = mode;
        Ok(())
    }

    pub fn close(&mut self) {
        self.mode = UiMode::Browsing;
    }

    fn activate(&mut self) -> Vec<Effect> {
        self.generation += 1;
        let selected = self.chats.selected_chat().map(|c| (c.id, c.kind));
        let chat_id = selected.map(|(id, _)| id);
        self.thread = Thread::new(chat_id);
        self.typing.switch_chat(chat_id);
        self.roster.clear();
        match selected {
            Some((chat_id, kind)) => vec![Effect::LoadThread(FetchTicket {
                chat_id,
                kind,
                generation: self.generation,
            })],
            None => Vec::new(),
        }
    }

    fn join_known_rooms(&mut self) -> Vec<Effect> {
        let added = self.rooms.join(self.chats.ids());
        if added.is_empty() {
            Vec::new()
        } else {
            vec![Effect::Emit(ClientEvent::JoinChats(added))]
        }
    }

    fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.generation && self.chats.selected() == Some(ticket.chat_id)
    }

    /// Queues a notice for the driver to show.
    pub fn notify(&mut self, level: NoticeLevel, text: impl Into<String>) {
        self.notices.push(Notice {
            level,
            text: text.into(),
        });
    }
}

use chrono::{DateTime, Local, Utc};
use futures_util::future::LocalBoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::{fetch_overview, ChatApi};
use crate::connection::{ConnectionEvent, ConnectionManager, Connector, DisconnectReason};
use crate::error::ClientError;
use crate::membership::{addable_users, MemberMutation};
use crate::models::{
    Chat, ChatId, ChatKind, Member, Message, NewGroup, Role, Session, User, UserId,
};
use crate::realtime::{Incoming, RealtimeConnection, ServerEvent};
use crate::state::{ChatState, Effect, FetchTicket, NoticeLevel, Outgoing, UiMode};

pub const HELP: &str = "\
Commands:
  /chats [query]           list chats
  /open <n|chat-id>        switch to a chat
  /refresh                 reload chats and the open thread
  /typing, /stop           typing indicator on/off
  /members                 show members of the active chat
  /promote|/demote|/remove <user-id>
  /users [query]           users that can be added
  /add <user-id>...        add members
  /dm <user-id>            start a private chat
  /group|/channel <name> <user-id>... (prefix an id with + to make it admin)
  /leave, /delete          leave or delete the active chat (confirm with /yes, /no)
  /reconnect               reconnect the realtime channel
  /quit
Anything else is sent to the active chat.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Chats(String),
    Open(String),
    Refresh,
    Say(String),
    Typing,
    StopTyping,
    Members,
    Promote(UserId),
    Demote(UserId),
    Remove(UserId),
    Users(String),
    Add(Vec<UserId>),
    Direct(UserId),
    NewGroup(NewGroup),
    Leave,
    Delete,
    Confirm,
    Cancel,
    Reconnect,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    let args: Vec<&str> = parts.collect();

    let command = match name.as_str() {
        "help" => Command::Help,
        "chats" => Command::Chats(args.join(" ")),
        "open" => Command::Open(single(&args, "/open <n|chat-id>")?.to_string()),
        "refresh" => Command::Refresh,
        "typing" => Command::Typing,
        "stop" => Command::StopTyping,
        "members" => Command::Members,
        "promote" => Command::Promote(parse_id(single(&args, "/promote <user-id>")?)?),
        "demote" => Command::Demote(parse_id(single(&args, "/demote <user-id>")?)?),
        "remove" => Command::Remove(parse_id(single(&args, "/remove <user-id>")?)?),
        "users" => Command::Users(args.join(" ")),
        "add" => {
            if args.is_empty() {
                return Err("Usage: /add <user-id>...".to_string());
            }
            Command::Add(args.iter().map(|a| parse_id(a)).collect::<Result<_, _>>()?)
        }
        "dm" => Command::Direct(parse_id(single(&args, "/dm <user-id>")?)?),
        "group" | "channel" => {
            if args.is_empty() {
                return Err(format!("Usage: /{} <name> [+]<user-id>...", name));
            }
            let kind = if name == "group" { ChatKind::Group } else { ChatKind::Channel };
            let mut group = NewGroup::new(args[0], kind);
            for arg in &args[1..] {
                match arg.strip_prefix('+') {
                    Some(id) => {
                        let id = parse_id(id)?;
                        group.toggle_member(id);
                        group.toggle_admin(id);
                    }
                    None => group.toggle_member(parse_id(arg)?),
                }
            }
            Command::NewGroup(group)
        }
        "leave" => Command::Leave,
        "delete" => Command::Delete,
        "yes" => Command::Confirm,
        "no" => Command::Cancel,
        "reconnect" => Command::Reconnect,
        "quit" | "exit" => Command::Quit,
        _ => return Err(format!("Unknown command '/{}', try /help", name)),
    };
    Ok(command)
}

fn single<'a>(args: &[&'a str], usage: &str) -> Result<&'a str, String> {
    match args {
        [one] => Ok(one),
        _ => Err(format!("Usage: {}", usage)),
    }
}

fn parse_id(raw: &str) -> Result<Uuid, String> {
    Uuid::parse_str(raw).map_err(|_| format!("'{}' is not a valid id", raw))
}

/// Forwards parsed stdin lines until EOF or `/quit`.
pub async fn read_stdin(tx: mpsc::UnboundedSender<Command>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(command) => {
                let quit = command == Command::Quit;
                if tx.send(command).is_err() || quit {
                    break;
                }
            }
            Err(message) => println!("{}", message),
        }
    }
    Ok(())
}

enum Completion {
    Chats(Result<Vec<Chat>, ClientError>),
    Messages(FetchTicket, Result<Vec<Message>, ClientError>),
    Members(FetchTicket, Result<Vec<Member>, ClientError>),
    Users(Result<Vec<User>, ClientError>),
    Sent(Outgoing, Result<Message, ClientError>),
    Membership(ChatId, Result<MemberMutation, ClientError>),
    Added {
        chat_id: ChatId,
        added: Vec<Member>,
        error: Option<ClientError>,
    },
    Removed(ChatId, Result<(), ClientError>),
    Created(Result<Chat, ClientError>),
}

type Pending<'a> = FuturesUnordered<LocalBoxFuture<'a, Completion>>;

/// A connect or reconnect cycle. It owns the manager until it settles.
type Cycle<C> = LocalBoxFuture<'static, (ConnectionManager<C>, Result<(), ClientError>)>;

pub struct Client<A, C>
where
    A: ChatApi,
    C: Connector<Connection = RealtimeConnection>,
{
    api: A,
    manager: Option<ConnectionManager<C>>,
    state: ChatState,
    session: Session,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    users: Vec<User>,
}

impl<A, C> Client<A, C>
where
    A: ChatApi,
    C: Connector<Connection = RealtimeConnection> + 'static,
{
    pub fn new(api: A, mut manager: ConnectionManager<C>, session: Session) -> Self {
        let events = manager.subscribe();
        Client {
            api,
            state: ChatState::new(session.user_id),
            manager: Some(manager),
            session,
            events,
            users: Vec::new(),
        }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    /// Runs until `/quit` or the command channel closes. Only a rejected
    /// credential ends the loop with an error.
    ///
    /// Connecting and reconnecting run alongside commands and API calls, so
    /// the loop never waits out a backoff.
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), ClientError> {
        let Client {
            api,
            manager,
            state,
            session,
            events,
            users,
        } = self;
        let api: &A = api;
        let mut pending: Pending<'_> = FuturesUnordered::new();
        let mut cycle: Option<Cycle<C>> = manager.take().map(|m| connect_cycle(m, session.clone()));
        pending.push(async move { Completion::Chats(fetch_overview(api).await) }.boxed_local());

        let outcome = loop {
            render_notices(state);
            tokio::select! {
                incoming = next_incoming(manager.as_mut()) => match incoming {
                    Incoming::Event(event) => {
                        render_event(state, &event);
                        state.handle_event(event);
                    }
                    Incoming::Closed(reason) => {
                        debug!("Realtime channel closed: {:?}", reason);
                        cycle = manager.take().map(|m| recovery_cycle(m, reason));
                    }
                },
                (returned, result) = settle(&mut cycle) => {
                    cycle = None;
                    *manager = Some(returned);
                    let effects = drain_connection_events(events, state);
                    run_effects(effects, api, manager.as_ref(), &mut pending);
                    match result {
                        Err(e) if e.is_unauthorized() => {
                            render_notices(state);
                            break Err(e);
                        }
                        Err(e) => {
                            warn!("Realtime channel gave up: {}", e);
                            println!("Realtime updates unavailable, use /reconnect to try again");
                        }
                        Ok(()) => {}
                    }
                }
                Some(event) = events.recv() => {
                    let effects = state.connection_event(event);
                    run_effects(effects, api, manager.as_ref(), &mut pending);
                }
                Some(done) = pending.next(), if !pending.is_empty() => {
                    let effects = complete(done, state, users);
                    run_effects(effects, api, manager.as_ref(), &mut pending);
                }
                command = commands.recv() => match command {
                    None | Some(Command::Quit) => break Ok(()),
                    Some(Command::Reconnect) => match manager.take() {
                        Some(m) => cycle = Some(connect_cycle(m, session.clone())),
                        None => println!("Already connecting"),
                    },
                    Some(command) => {
                        let effects = dispatch(command, api, state, users, &mut pending);
                        run_effects(effects, api, manager.as_ref(), &mut pending);
                    }
                },
            }
        };

        if let Some(manager) = manager.as_mut() {
            manager.disconnect();
        }
        outcome
    }
}

fn connect_cycle<C>(mut manager: ConnectionManager<C>, session: Session) -> Cycle<C>
where
    C: Connector<Connection = RealtimeConnection> + 'static,
{
    async move {
        let result = manager.connect(session).await;
        (manager, result)
    }
    .boxed_local()
}

fn recovery_cycle<C>(mut manager: ConnectionManager<C>, reason: DisconnectReason) -> Cycle<C>
where
    C: Connector<Connection = RealtimeConnection> + 'static,
{
    async move {
        let result = manager.handle_disconnect(reason).await;
        (manager, result)
    }
    .boxed_local()
}

async fn settle<C>(cycle: &mut Option<Cycle<C>>) -> (ConnectionManager<C>, Result<(), ClientError>)
where
    C: Connector<Connection = RealtimeConnection>,
{
    match cycle.as_mut() {
        Some(running) => running.await,
        None => std::future::pending().await,
    }
}

async fn next_incoming<C>(manager: Option<&mut ConnectionManager<C>>) -> Incoming
where
    C: Connector<Connection = RealtimeConnection>,
{
    match manager.and_then(|m| m.connection_mut()) {
        Some(connection) => connection.next().await,
        None => std::future::pending().await,
    }
}

fn drain_connection_events(
    events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    state: &mut ChatState,
) -> Vec<Effect> {
    let mut effects = Vec::new();
    while let Ok(event) = events.try_recv() {
        effects.extend(state.connection_event(event));
    }
    effects
}

fn run_effects<'a, A, C>(
    effects: Vec<Effect>,
    api: &'a A,
    manager: Option<&ConnectionManager<C>>,
    pending: &mut Pending<'a>,
) where
    A: ChatApi,
    C: Connector<Connection = RealtimeConnection>,
{
    for effect in effects {
        match effect {
            Effect::Emit(event) => match manager.and_then(|m| m.connection()) {
                Some(connection) => {
                    if let Err(e) = connection.emit(event) {
                        warn!("Could not emit realtime event: {}", e);
                    }
                }
                None => debug!("Not connected, dropping {:?}", event),
            },
            Effect::LoadThread(ticket) => {
                pending.push(
                    async move {
                        let result = api.list_messages(ticket.chat_id).await;
                        Completion::Messages(ticket, result)
                    }
                    .boxed_local(),
                );
                if ticket.wants_members() {
                    pending.push(
                        async move {
                            let result = api.list_members(ticket.chat_id).await;
                            Completion::Members(ticket, result)
                        }
                        .boxed_local(),
                    );
                }
            }
        }
    }
}

fn complete(done: Completion, state: &mut ChatState, users: &mut Vec<User>) -> Vec<Effect> {
    match done {
        Completion::Chats(result) => {
            let effects = state.chats_loaded(result);
            render_chats(state, "");
            effects
        }
        Completion::Messages(ticket, result) => {
            if state.messages_loaded(ticket, result) {
                render_thread(state);
            }
            Vec::new()
        }
        Completion::Members(ticket, result) => {
            state.members_loaded(ticket, result);
            Vec::new()
        }
        Completion::Users(result) => {
            match result {
                Ok(list) => {
                    *users = list;
                    let own = state.user_id();
                    let addable = addable_users(users, state.members(), "");
                    for user in addable.into_iter().filter(|u| u.id != own) {
                        println!("  {}  {} <{}>", user.id, user.name, user.email);
                    }
                }
                Err(e) => println!("Error: Failed to load users ({})", e),
            }
            Vec::new()
        }
        Completion::Sent(outgoing, result) => state.message_sent(outgoing, result),
        Completion::Membership(chat_id, result) => {
            state.member_mutation_confirmed(chat_id, result);
            Vec::new()
        }
        Completion::Added { chat_id, added, error } => {
            if !added.is_empty() {
                state.member_mutation_confirmed(chat_id, Ok(MemberMutation::Added(added)));
            }
            if let Some(e) = error {
                state.member_mutation_confirmed(chat_id, Err(e));
            }
            state.close();
            Vec::new()
        }
        Completion::Removed(chat_id, result) => state.chat_removed(chat_id, result),
        Completion::Created(result) => state.chat_created(result),
    }
}

fn dispatch<'a, A: ChatApi>(
    command: Command,
    api: &'a A,
    state: &mut ChatState,
    users: &[User],
    pending: &mut Pending<'a>,
) -> Vec<Effect> {
    match command {
        Command::Help => println!("{}", HELP),
        Command::Chats(query) => render_chats(state, &query),
        Command::Refresh => {
            pending.push(async move { Completion::Chats(fetch_overview(api).await) }.boxed_local());
            return state.reload_active();
        }
        Command::Open(target) => match resolve_chat(state, &target) {
            Some(chat_id) => return state.select_chat(chat_id),
            None => println!("No chat '{}'", target),
        },
        Command::Say(text) => match state.compose(&text) {
            Ok(outgoing) => {
                pending.push(
                    async move {
                        let result = api.send_message(outgoing.chat_id, &outgoing.content).await;
                        Completion::Sent(outgoing, result)
                    }
                    .boxed_local(),
                );
            }
            Err(e) => println!("Error: {}", e),
        },
        Command::Typing => return state.typing_started().into_iter().collect(),
        Command::StopTyping => return state.typing_stopped().into_iter().collect(),
        Command::Members => render_members(state),
        Command::Promote(id) => change_role(state, api, pending, id, Role::Admin),
        Command::Demote(id) => change_role(state, api, pending, id, Role::Member),
        Command::Remove(id) => {
            let allowed = match (state.permissions(), state.member(&id)) {
                (Some(view), Some(target)) => view.can_remove(target),
                _ => false,
            };
            match state.active_chat().map(|c| c.id) {
                Some(chat_id) if allowed => {
                    pending.push(
                        async move {
                            let result = api
                                .remove_member(chat_id, id)
                                .await
                                .map(|_| MemberMutation::Removed { member_id: id });
                            Completion::Membership(chat_id, result)
                        }
                        .boxed_local(),
                    );
                }
                _ => println!("Error: {}", ClientError::Forbidden("cannot remove this member")),
            }
        }
        Command::Users(query) => {
            if query.is_empty() || users.is_empty() {
                let fetch = async move { Completion::Users(api.list_users().await) };
                pending.push(fetch.boxed_local());
            } else {
                for user in addable_users(users, state.members(), &query) {
                    println!("  {}  {} <{}>", user.id, user.name, user.email);
                }
            }
        }
        Command::Add(ids) => {
            if let Err(e) = state.open(UiMode::AddMembers) {
                println!("Error: {}", e);
                return Vec::new();
            }
            let Some(chat_id) = state.active_chat().map(|c| c.id) else {
                return Vec::new();
            };
            let names: Vec<(UserId, String)> = ids
                .iter()
                .filter(|id| state.member(*id).is_none())
                .map(|id| (*id, display_name(users, id)))
                .collect();
            if names.is_empty() {
                state.close();
                state.notify(NoticeLevel::Info, "Everyone listed is already a member");
                return Vec::new();
            }
            pending.push(
                async move {
                    let mut added = Vec::new();
                    let mut error = None;
                    for (id, name) in names {
                        match api.add_member(chat_id, id).await {
                            Ok(()) => added.push(Member {
                                id,
                                name,
                                role: Role::Member,
                            }),
                            Err(e) => {
                                error = Some(e);
                                break;
                            }
                        }
                    }
                    Completion::Added { chat_id, added, error }
                }
                .boxed_local(),
            );
        }
        Command::Direct(user_id) => {
            if user_id == state.user_id() {
                println!("Error: cannot start a chat with yourself");
                return Vec::new();
            }
            let _ = state.open(UiMode::PickUser);
            let name = display_name(users, &user_id);
            pending.push(
                async move {
                    let result = api.create_private_chat(user_id).await.map(|id| Chat {
                        id,
                        kind: ChatKind::Private,
                        display_name: name,
                        last_message: None,
                    });
                    Completion::Created(result)
                }
                .boxed_local(),
            );
        }
        Command::NewGroup(group) => {
            if let Err(e) = state.open(UiMode::CreateGroup(group.kind)) {
                println!("Error: {}", e);
                return Vec::new();
            }
            pending.push(
                async move {
                    let result = api.create_group(&group).await.map(|id| Chat {
                        id,
                        kind: group.kind,
                        display_name: group.name.clone(),
                        last_message: None,
                    });
                    Completion::Created(result)
                }
                .boxed_local(),
            );
        }
        Command::Leave => match state.open(UiMode::ConfirmLeave) {
            Ok(()) => println!("Leave this chat? /yes or /no"),
            Err(e) => println!("Error: {}", e),
        },
        Command::Delete => match state.open(UiMode::ConfirmDelete) {
            Ok(()) => println!("Delete this chat for everyone? /yes or /no"),
            Err(e) => println!("Error: {}", e),
        },
        Command::Confirm => {
            let mode = state.mode();
            let Some(chat_id) = state.active_chat().map(|c| c.id) else {
                state.close();
                return Vec::new();
            };
            match mode {
                UiMode::ConfirmLeave => pending.push(
                    async move { Completion::Removed(chat_id, api.leave_chat(chat_id).await) }
                        .boxed_local(),
                ),
                UiMode::ConfirmDelete => pending.push(
                    async move { Completion::Removed(chat_id, api.delete_group(chat_id).await) }
                        .boxed_local(),
                ),
                _ => println!("Nothing to confirm"),
            }
        }
        Command::Cancel => state.close(),
        Command::Reconnect | Command::Quit => {}
    }
    Vec::new()
}

fn change_role<'a, A: ChatApi>(
    state: &ChatState,
    api: &'a A,
    pending: &mut Pending<'a>,
    member_id: UserId,
    role: Role,
) {
    let allowed = match (state.permissions(), state.member(&member_id)) {
        (Some(view), Some(target)) if role == Role::Admin => view.can_promote(target),
        (Some(view), Some(target)) => view.can_demote(target),
        _ => false,
    };
    let Some(chat_id) = state.active_chat().map(|c| c.id).filter(|_| allowed) else {
        println!("Error: {}", ClientError::Forbidden("cannot change this member's role"));
        return;
    };
    pending.push(
        async move {
            let result = api
                .set_member_role(chat_id, member_id, role)
                .await
                .map(|_| MemberMutation::RoleChanged { member_id, role });
            Completion::Membership(chat_id, result)
        }
        .boxed_local(),
    );
}

fn resolve_chat(state: &ChatState, target: &str) -> Option<ChatId> {
    if let Ok(n) = target.parse::<usize>() {
        return state.chats().iter().nth(n.checked_sub(1)?).map(|c| c.id);
    }
    let id = Uuid::parse_str(target).ok()?;
    state.chats().get(&id).map(|c| c.id)
}

fn display_name(users: &[User], id: &UserId) -> String {
    users
        .iter()
        .find(|u| u.id == *id)
        .map(|u| u.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn render_notices(state: &mut ChatState) {
    for notice in state.drain_notices() {
        match notice.level {
            NoticeLevel::Error => println!("Error: {}", notice.text),
            NoticeLevel::Success => println!("Success: {}", notice.text),
            NoticeLevel::Info => println!("{}", notice.text),
        }
    }
}

fn render_event(state: &ChatState, event: &ServerEvent) {
    match event {
        ServerEvent::NewMessage(message) => {
            let active = state.active_chat().map(|c| c.id) == Some(message.chat_id);
            let known = state.messages().iter().any(|m| m.id == message.id);
            if active && !known {
                println!("{}", format_message(state, message));
            }
        }
        ServerEvent::UserTyping { chat_id, .. } => {
            if state.active_chat().map(|c| c.id) == Some(*chat_id) {
                println!("Typing...");
            }
        }
        _ => {}
    }
}

fn render_chats(state: &ChatState, query: &str) {
    let selected = state.chats().selected();
    let matches = state.chats().filter(query);
    if matches.is_empty() {
        println!("No chats found");
    }
    for (index, chat) in state.chats().iter().enumerate() {
        if !matches.iter().any(|c| c.id == chat.id) {
            continue;
        }
        let marker = if selected == Some(chat.id) { '*' } else { ' ' };
        let preview = chat
            .last_message
            .as_ref()
            .map(|m| m.preview())
            .unwrap_or_else(|| "No messages yet".to_string());
        println!(
            "{}{:>3}. [{}] {}  {}",
            marker,
            index + 1,
            chat.kind.label(),
            chat.display_name,
            preview
        );
    }
}

fn render_thread(state: &ChatState) {
    if let Some(chat) = state.active_chat() {
        println!("--- {} ({}) ---", chat.display_name, state.status());
    }
    for message in state.messages() {
        println!("{}", format_message(state, message));
    }
}

fn render_members(state: &ChatState) {
    let Some(view) = state.permissions() else {
        println!("No chat selected");
        return;
    };
    println!("Members ({})", state.members().len());
    for role in [Role::Owner, Role::Admin, Role::Member] {
        for member in state.members().with_role(role) {
            let mut actions = Vec::new();
            if view.can_promote(member) {
                actions.push("promote");
            }
            if view.can_demote(member) {
                actions.push("demote");
            }
            if view.can_remove(member) {
                actions.push("remove");
            }
            println!("  [{}] {} {}  {}", role.label(), member.name, member.id, actions.join(" "));
        }
    }
}

fn format_message(state: &ChatState, message: &Message) -> String {
    let sender = if message.sender_id == state.user_id() {
        "you".to_string()
    } else {
        message
            .sender_name
            .clone()
            .or_else(|| state.member(&message.sender_id).map(|m| m.name.clone()))
            .unwrap_or_else(|| message.sender_id.to_string())
    };
    format!("[{}] {}: {}", format_timestamp(message.created_at), sender, message.content)
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    let local_datetime: DateTime<Local> = timestamp.with_timezone(&Local);
    let today = Local::now().date_naive();
    let message_date = local_datetime.date_naive();

    if message_date == today {
        local_datetime.format("%I:%M %p").to_string()
    } else if (today - message_date).num_days() == 1 {
        format!("Yesterday, {}", local_datetime.format("%I:%M %p"))
    } else {
        local_datetime.format("%b %d, %I:%M %p").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;
    use crate::realtime::ClientEvent;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(parse_command("  hello there "), Ok(Command::Say("hello there".into())));
    }

    #[test]
    fn test_parse_commands() {
        let id = Uuid::new_v4();
        assert_eq!(parse_command("/open 2"), Ok(Command::Open("2".into())));
        assert_eq!(parse_command(&format!("/promote {}", id)), Ok(Command::Promote(id)));
        assert_eq!(parse_command("/chats fam"), Ok(Command::Chats("fam".into())));
        assert_eq!(parse_command("/QUIT"), Ok(Command::Quit));
        assert_eq!(parse_command("/yes"), Ok(Command::Confirm));
        assert!(parse_command("/promote nobody").is_err());
        assert!(parse_command("/open").is_err());
        assert!(parse_command("/dance").is_err());
        assert_eq!(parse_command("/add"), Err("Usage: /add <user-id>...".to_string()));
        assert!(parse_command("/group").unwrap_err().starts_with("Usage: /group"));
        assert!(parse_command("/channel").unwrap_err().starts_with("Usage: /channel"));
    }

    #[test]
    fn test_parse_group_with_admins() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let command = parse_command(&format!("/channel news {} +{}", a, b)).unwrap();
        let Command::NewGroup(group) = command else {
            panic!("expected a group");
        };
        assert_eq!(group.kind, ChatKind::Channel);
        assert_eq!(group.name, "news");
        assert_eq!(group.members, vec![a, b]);
        assert_eq!(group.admins, vec![b]);
    }

    #[test]
    fn test_resolve_chat_by_index_or_id() {
        let mut state = ChatState::new(Uuid::new_v4());
        let chats: Vec<Chat> = (0..2)
            .map(|i| Chat {
                id: Uuid::new_v4(),
                kind: ChatKind::Group,
                display_name: format!("c{}", i),
                last_message: None,
            })
            .collect();
        state.chats_loaded(Ok(chats.clone()));

        assert_eq!(resolve_chat(&state, "2"), Some(chats[1].id));
        assert_eq!(resolve_chat(&state, "0"), None);
        assert_eq!(resolve_chat(&state, "3"), None);
        assert_eq!(resolve_chat(&state, &chats[0].id.to_string()), Some(chats[0].id));
        assert_eq!(resolve_chat(&state, &Uuid::new_v4().to_string()), None);
    }

    #[test]
    fn test_format_timestamp_older_dates() {
        let formatted = format_timestamp(Utc::now() - chrono::Duration::days(3));
        assert!(formatted.contains(", "));
        assert!(!formatted.starts_with("Yesterday"));
    }

    /// Every API call in the order it was made.
    #[derive(Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<(String, Instant)>>>);

    impl CallLog {
        fn record(&self, call: impl Into<String>) {
            self.0.lock().unwrap().push((call.into(), Instant::now()));
        }

        fn names(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
        }

        fn times(&self, prefix: &str) -> Vec<Instant> {
            let calls = self.0.lock().unwrap();
            calls.iter().filter(|(name, _)| name.starts_with(prefix)).map(|(_, at)| *at).collect()
        }
    }

    #[derive(Default)]
    struct FakeApi {
        me: UserId,
        chats: Vec<Chat>,
        histories: HashMap<ChatId, Vec<Message>>,
        members: HashMap<ChatId, Vec<Member>>,
        slow: HashMap<ChatId, Duration>,
        send_delay: Duration,
        log: CallLog,
    }

    impl FakeApi {
        async fn lag(&self, chat_id: ChatId) {
            if let Some(delay) = self.slow.get(&chat_id) {
                sleep(*delay).await;
            }
        }
    }

    impl ChatApi for FakeApi {
        async fn list_chats(&self) -> Result<Vec<Chat>, ClientError> {
            self.log.record("list_chats");
            Ok(self.chats.clone())
        }
        async fn list_messages(&self, chat_id: ChatId) -> Result<Vec<Message>, ClientError> {
            self.log.record(format!("list_messages {}", chat_id));
            self.lag(chat_id).await;
            Ok(self.histories.get(&chat_id).cloned().unwrap_or_default())
        }
        async fn send_message(
            &self,
            chat_id: ChatId,
            content: &str,
        ) -> Result<Message, ClientError> {
            self.log.record("send_message");
            sleep(self.send_delay).await;
            let mut sent = message(chat_id, content);
            sent.sender_id = self.me;
            Ok(sent)
        }
        async fn list_members(&self, chat_id: ChatId) -> Result<Vec<Member>, ClientError> {
            self.log.record(format!("list_members {}", chat_id));
            self.lag(chat_id).await;
            Ok(self.members.get(&chat_id).cloned().unwrap_or_default())
        }
        async fn list_users(&self) -> Result<Vec<User>, ClientError> {
            self.log.record("list_users");
            Ok(Vec::new())
        }
        async fn create_private_chat(&self, _: UserId) -> Result<ChatId, ClientError> {
            self.log.record("create_private_chat");
            Ok(Uuid::new_v4())
        }
        async fn create_group(&self, _: &NewGroup) -> Result<ChatId, ClientError> {
            self.log.record("create_group");
            Ok(Uuid::new_v4())
        }
        async fn delete_group(&self, chat_id: ChatId) -> Result<(), ClientError> {
            self.log.record(format!("delete_group {}", chat_id));
            Ok(())
        }
        async fn add_member(&self, _: ChatId, user_id: UserId) -> Result<(), ClientError> {
            self.log.record(format!("add_member {}", user_id));
            Ok(())
        }
        async fn set_member_role(
            &self,
            _: ChatId,
            member_id: UserId,
            _: Role,
        ) -> Result<(), ClientError> {
            self.log.record(format!("set_member_role {}", member_id));
            Ok(())
        }
        async fn remove_member(&self, _: ChatId, member_id: UserId) -> Result<(), ClientError> {
            self.log.record(format!("remove_member {}", member_id));
            Ok(())
        }
        async fn leave_chat(&self, chat_id: ChatId) -> Result<(), ClientError> {
            self.log.record(format!("leave_chat {}", chat_id));
            Ok(())
        }
    }

    /// Server end of one scripted connection.
    struct Peer {
        emitted: mpsc::UnboundedReceiver<ClientEvent>,
        push: mpsc::UnboundedSender<Incoming>,
    }

    /// Connector that plays back scripted outcomes; once the script runs out
    /// every attempt is refused.
    #[derive(Clone, Default)]
    struct ScriptedLink {
        script: Arc<Mutex<VecDeque<Result<(), ClientError>>>>,
        peers: Arc<Mutex<Vec<Peer>>>,
    }

    impl ScriptedLink {
        fn with(results: Vec<Result<(), ClientError>>) -> Self {
            let link = ScriptedLink::default();
            link.script.lock().unwrap().extend(results);
            link
        }

        fn connections(&self) -> usize {
            self.peers.lock().unwrap().len()
        }

        fn emitted(&self, index: usize) -> Vec<ClientEvent> {
            let mut peers = self.peers.lock().unwrap();
            let mut events = Vec::new();
            while let Ok(event) = peers[index].emitted.try_recv() {
                events.push(event);
            }
            events
        }

        fn close(&self, index: usize, reason: DisconnectReason) {
            let peers = self.peers.lock().unwrap();
            peers[index].push.send(Incoming::Closed(reason)).unwrap();
        }
    }

    impl Connector for ScriptedLink {
        type Connection = RealtimeConnection;

        async fn connect(&mut self, _session: &Session) -> Result<RealtimeConnection, ClientError> {
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Err(ClientError::Transport("connection refused".into())))?;
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            self.peers.lock().unwrap().push(Peer {
                emitted: out_rx,
                push: in_tx,
            });
            Ok(RealtimeConnection::new(out_tx, in_rx))
        }
    }

    fn message(chat_id: ChatId, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            chat_id,
            sender_id: Uuid::new_v4(),
            sender_name: None,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    fn chat(kind: ChatKind, name: &str) -> Chat {
        let id = Uuid::new_v4();
        Chat {
            id,
            kind,
            display_name: name.into(),
            last_message: Some(message(id, "earlier")),
        }
    }

    fn member(role: Role) -> Member {
        Member {
            id: Uuid::new_v4(),
            name: role.label().into(),
            role,
        }
    }

    fn client(api: FakeApi, link: &ScriptedLink) -> Client<FakeApi, ScriptedLink> {
        let session = Session::new(api.me, "token");
        let manager = ConnectionManager::new(link.clone(), ReconnectPolicy::default());
        Client::new(api, manager, session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_are_served_while_reconnecting() {
        let log = CallLog::default();
        let api = FakeApi {
            me: Uuid::new_v4(),
            chats: vec![chat(ChatKind::Private, "dm")],
            log: log.clone(),
            ..FakeApi::default()
        };
        let link = ScriptedLink::with(vec![Ok(())]);
        let mut client = client(api, &link);
        let start = Instant::now();

        let (tx, rx) = mpsc::unbounded_channel();
        let script = async {
            sleep(Duration::from_millis(50)).await;
            link.close(0, DisconnectReason::TransportFailure("reset".into()));
            sleep(Duration::from_millis(50)).await;
            tx.send(Command::Refresh).unwrap();
            sleep(Duration::from_millis(100)).await;
            tx.send(Command::Quit).unwrap();
        };
        let (result, ()) = tokio::join!(client.run(rx), script);

        assert_eq!(result, Ok(()));
        let refreshes = log.times("list_chats");
        assert_eq!(refreshes.len(), 2);
        assert!(refreshes[1] - start < Duration::from_millis(150));
        assert_eq!(link.connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_does_not_delay_first_load() {
        let log = CallLog::default();
        let api = FakeApi {
            me: Uuid::new_v4(),
            chats: vec![chat(ChatKind::Group, "team")],
            log: log.clone(),
            ..FakeApi::default()
        };
        let link = ScriptedLink::default();
        let mut client = client(api, &link);
        let start = Instant::now();

        let (tx, rx) = mpsc::unbounded_channel();
        let script = async {
            sleep(Duration::from_millis(100)).await;
            tx.send(Command::Quit).unwrap();
        };
        let (result, ()) = tokio::join!(client.run(rx), script);

        assert_eq!(result, Ok(()));
        assert_eq!(log.times("list_chats"), vec![start]);
        assert_eq!(client.state().chats().len(), 1);
        assert_eq!(link.connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credential_ends_the_run() {
        let api = FakeApi {
            me: Uuid::new_v4(),
            ..FakeApi::default()
        };
        let link = ScriptedLink::with(vec![Err(ClientError::Unauthorized("expired".into()))]);
        let mut client = client(api, &link);

        let (_tx, rx) = mpsc::unbounded_channel();
        let result = client.run(rx).await;

        assert!(result.unwrap_err().is_unauthorized());
        assert_eq!(link.connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_checks_happen_before_the_api() {
        let me = member(Role::Admin);
        let owner = member(Role::Owner);
        let other_admin = member(Role::Admin);
        let plain = member(Role::Member);
        let group = chat(ChatKind::Group, "team");
        let log = CallLog::default();
        let api = FakeApi {
            me: me.id,
            chats: vec![group.clone()],
            members: HashMap::from([(
                group.id,
                vec![owner.clone(), me.clone(), other_admin.clone(), plain.clone()],
            )]),
            log: log.clone(),
            ..FakeApi::default()
        };
        let link = ScriptedLink::with(vec![Ok(())]);
        let mut client = client(api, &link);

        let (tx, rx) = mpsc::unbounded_channel();
        let script = async {
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::Add(vec![other_admin.id, plain.id])).unwrap();
            tx.send(Command::Remove(other_admin.id)).unwrap();
            tx.send(Command::Remove(owner.id)).unwrap();
            tx.send(Command::Demote(other_admin.id)).unwrap();
            tx.send(Command::Delete).unwrap();
            tx.send(Command::Confirm).unwrap();
            tx.send(Command::Remove(plain.id)).unwrap();
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::Quit).unwrap();
        };
        let (result, ()) = tokio::join!(client.run(rx), script);
        assert_eq!(result, Ok(()));

        let mutations: Vec<String> = log
            .names()
            .into_iter()
            .filter(|name| {
                ["add_member", "remove_member", "set_member_role", "delete_group"]
                    .iter()
                    .any(|call| name.starts_with(*call))
            })
            .collect();
        assert_eq!(mutations, vec![format!("remove_member {}", plain.id)]);

        let state = client.state();
        assert!(state.member(&plain.id).is_none());
        assert_eq!(state.member(&other_admin.id).map(|m| m.role), Some(Role::Admin));
        assert_eq!(state.mode(), UiMode::Browsing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adding_only_existing_members_skips_the_api() {
        let me = member(Role::Admin);
        let plain = member(Role::Member);
        let newcomer = Uuid::new_v4();
        let group = chat(ChatKind::Group, "team");
        let log = CallLog::default();
        let api = FakeApi {
            me: me.id,
            chats: vec![group.clone()],
            members: HashMap::from([(group.id, vec![me.clone(), plain.clone()])]),
            log: log.clone(),
            ..FakeApi::default()
        };
        let link = ScriptedLink::with(vec![Ok(())]);
        let mut client = client(api, &link);

        let (tx, rx) = mpsc::unbounded_channel();
        let script = async {
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::Add(vec![plain.id, me.id])).unwrap();
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::Add(vec![plain.id, newcomer])).unwrap();
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::Quit).unwrap();
        };
        let (result, ()) = tokio::join!(client.run(rx), script);
        assert_eq!(result, Ok(()));

        let adds: Vec<String> = log
            .names()
            .into_iter()
            .filter(|name| name.starts_with("add_member"))
            .collect();
        assert_eq!(adds, vec![format!("add_member {}", newcomer)]);
        let state = client.state();
        assert_eq!(state.member(&newcomer).map(|m| m.role), Some(Role::Member));
        assert_eq!(state.mode(), UiMode::Browsing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_results_for_a_previous_chat_are_dropped() {
        let me = member(Role::Member);
        let group = chat(ChatKind::Group, "team");
        let dm = chat(ChatKind::Private, "dm");
        let (old, fresh) = (message(group.id, "old"), message(dm.id, "fresh"));
        let log = CallLog::default();
        let api = FakeApi {
            me: me.id,
            chats: vec![group.clone(), dm.clone()],
            histories: HashMap::from([(group.id, vec![old]), (dm.id, vec![fresh.clone()])]),
            members: HashMap::from([(group.id, vec![member(Role::Owner), me.clone()])]),
            slow: HashMap::from([(group.id, Duration::from_millis(100))]),
            log: log.clone(),
            ..FakeApi::default()
        };
        let link = ScriptedLink::with(vec![Ok(())]);
        let mut client = client(api, &link);

        let (tx, rx) = mpsc::unbounded_channel();
        let script = async {
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::Open("2".into())).unwrap();
            sleep(Duration::from_millis(300)).await;
            tx.send(Command::Quit).unwrap();
        };
        let (result, ()) = tokio::join!(client.run(rx), script);
        assert_eq!(result, Ok(()));

        let state = client.state();
        assert_eq!(state.active_chat().map(|c| c.id), Some(dm.id));
        assert_eq!(state.messages(), &[fresh][..]);
        assert!(state.members().is_empty());
        assert_eq!(log.times(&format!("list_members {}", group.id)).len(), 1);
        assert!(log.times(&format!("list_members {}", dm.id)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_rejoins_rooms_on_the_new_connection() {
        let (a, b) = (chat(ChatKind::Private, "a"), chat(ChatKind::Private, "b"));
        let api = FakeApi {
            me: Uuid::new_v4(),
            chats: vec![a.clone(), b.clone()],
            ..FakeApi::default()
        };
        let link = ScriptedLink::with(vec![Ok(()), Ok(())]);
        let mut client = client(api, &link);

        let (tx, rx) = mpsc::unbounded_channel();
        let first = Arc::new(Mutex::new(Vec::new()));
        let script = async {
            sleep(Duration::from_millis(10)).await;
            first.lock().unwrap().extend(link.emitted(0));
            link.close(0, DisconnectReason::PeerInitiated);
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::Quit).unwrap();
        };
        let (result, ()) = tokio::join!(client.run(rx), script);
        assert_eq!(result, Ok(()));

        let joined = ClientEvent::JoinChats(vec![a.id, b.id]);
        assert_eq!(*first.lock().unwrap(), vec![joined.clone()]);
        assert_eq!(link.connections(), 2);
        assert_eq!(link.emitted(1), vec![joined]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_send_does_not_block_typing() {
        let dm = chat(ChatKind::Private, "dm");
        let api = FakeApi {
            me: Uuid::new_v4(),
            chats: vec![dm.clone()],
            send_delay: Duration::from_secs(1),
            ..FakeApi::default()
        };
        let link = ScriptedLink::with(vec![Ok(())]);
        let mut client = client(api, &link);

        let (tx, rx) = mpsc::unbounded_channel();
        let script = async {
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::Say("hi".into())).unwrap();
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::Typing).unwrap();
            sleep(Duration::from_millis(10)).await;
            tx.send(Command::StopTyping).unwrap();
            sleep(Duration::from_secs(2)).await;
            tx.send(Command::Quit).unwrap();
        };
        let (result, ()) = tokio::join!(client.run(rx), script);
        assert_eq!(result, Ok(()));

        assert_eq!(
            link.emitted(0),
            vec![
                ClientEvent::JoinChats(vec![dm.id]),
                ClientEvent::Typing { chat_id: dm.id },
                ClientEvent::StopTyping { chat_id: dm.id },
                ClientEvent::SendMessage {
                    chat_id: dm.id,
                    content: "hi".into(),
                },
            ]
        );
        let state = client.state();
        let contents: Vec<_> = state.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi"]);
    }
}

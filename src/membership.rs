//! Roles and the permissions derived from them.
//!
//! Admins manage plain members only; only the owner manages admins. The owner
//! is never a valid target, and nobody targets themselves.

use log::warn;

use crate::models::{ChatKind, Member, Role, User, UserId};

/// A roster change the server has confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberMutation {
    RoleChanged { member_id: UserId, role: Role },
    Removed { member_id: UserId },
    Added(Vec<Member>),
}

#[derive(Debug, Default, Clone)]
pub struct Roster {
    members: Vec<Member>,
}

impl Roster {
    pub fn new(members: Vec<Member>) -> Self {
        Roster { members }
    }

    pub fn replace(&mut self, members: Vec<Member>) {
        self.members = members;
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn get(&self, id: &UserId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == *id)
    }

    pub fn role_of(&self, id: &UserId) -> Option<Role> {
        self.get(id).map(|m| m.role)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn with_role(&self, role: Role) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(move |m| m.role == role)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Applies a confirmed change. Returns false when it was ignored.
    pub fn apply(&mut self, mutation: MemberMutation) -> bool {
        match mutation {
            MemberMutation::RoleChanged { member_id, role } => {
                if role == Role::Owner {
                    warn!("Ignoring ownership grant to {}", member_id);
                    return false;
                }
                match self.members.iter_mut().find(|m| m.id == member_id) {
                    Some(member) if member.role != Role::Owner => {
                        member.role = role;
                        true
                    }
                    Some(_) => {
                        warn!("Ignoring role change on owner {}", member_id);
                        false
                    }
                    None => false,
                }
            }
            MemberMutation::Removed { member_id } => {
                if self.role_of(&member_id) == Some(Role::Owner) {
                    warn!("Ignoring removal of owner {}", member_id);
                    return false;
                }
                let before = self.members.len();
                self.members.retain(|m| m.id != member_id);
                self.members.len() != before
            }
            MemberMutation::Added(added) => {
                let mut changed = false;
                for member in added {
                    if member.role == Role::Owner || self.get(&member.id).is_some() {
                        continue;
                    }
                    self.members.push(member);
                    changed = true;
                }
                changed
            }
        }
    }
}

/// Permissions of the current user in one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipView {
    kind: ChatKind,
    self_id: UserId,
    own_role: Option<Role>,
}

impl MembershipView {
    pub fn new(kind: ChatKind, self_id: UserId, roster: &Roster) -> Self {
        MembershipView {
            kind,
            self_id,
            own_role: roster.role_of(&self_id),
        }
    }

    pub fn own_role(&self) -> Option<Role> {
        self.own_role
    }

    pub fn can_send(&self) -> bool {
        self.kind != ChatKind::Channel || matches!(self.own_role, Some(Role::Owner | Role::Admin))
    }

    pub fn can_leave(&self) -> bool {
        self.kind != ChatKind::Private && matches!(self.own_role, Some(Role::Admin | Role::Member))
    }

    pub fn can_promote(&self, target: &Member) -> bool {
        self.targetable(target)
            && target.role == Role::Member
            && matches!(self.own_role, Some(Role::Owner | Role::Admin))
    }

    pub fn can_demote(&self, target: &Member) -> bool {
        self.targetable(target) && target.role == Role::Admin && self.own_role == Some(Role::Owner)
    }

    pub fn can_remove(&self, target: &Member) -> bool {
        self.targetable(target)
            && match self.own_role {
                Some(Role::Owner) => true,
                Some(Role::Admin) => target.role == Role::Member,
                _ => false,
            }
    }

    pub fn can_delete_chat(&self) -> bool {
        self.own_role == Some(Role::Owner)
    }

    pub fn can_add_members(&self) -> bool {
        self.kind != ChatKind::Private && matches!(self.own_role, Some(Role::Owner | Role::Admin))
    }

    fn targetable(&self, target: &Member) -> bool {
        target.role != Role::Owner && target.id != self.self_id
    }
}

/// Directory users that can still be added, matched on name or email.
pub fn addable_users<'a>(users: &'a [User], roster: &Roster, query: &str) -> Vec<&'a User> {
    let needle = query.trim().to_lowercase();
    users
        .iter()
        .filter(|u| roster.get(&u.id).is_none())
        .filter(|u| {
            u.name.to_lowercase().contains(&needle) || u.email.to_lowercase().contains(&needle)
        })
        .collect()
}

//! Joined-channel state: topic and member set.
//!
//! A channel object exists iff the local user is currently joined to it
//! (the session store enforces that). Member mutation happens on the read
//! path; readers always see a complete pre- or post-mutation snapshot.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::collab::UserId;

/// One channel member. `sigils` are the raw prefix characters as sent by
/// the server (`"@+"`); `modes` are the mode letters they translate to
/// through the support list (`"ov"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: UserId,
    pub nick: String,
    pub sigils: String,
    pub modes: String,
}

/// Channel topic with setter identity and timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub set_by: Option<String>,
    pub set_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ChannelInner {
    topic: Option<Topic>,
    members: Vec<Member>,
}

/// Live state for one joined channel.
#[derive(Debug)]
pub struct Channel {
    name: String,
    inner: RwLock<ChannelInner>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Channel {
        Channel {
            name: name.into(),
            inner: RwLock::new(ChannelInner::default()),
        }
    }

    /// Channel name with original casing.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> Option<Topic> {
        self.inner.read().topic.clone()
    }

    pub fn set_topic(&self, topic: Option<Topic>) {
        self.inner.write().topic = topic;
    }

    /// Atomically replace the full member set (end of a NAMES listing).
    /// Duplicate identities in the input collapse to the first occurrence.
    pub fn set_members(&self, members: Vec<Member>) {
        let mut deduped: Vec<Member> = Vec::with_capacity(members.len());
        for member in members {
            if !deduped.iter().any(|m| m.id == member.id) {
                deduped.push(member);
            }
        }
        self.inner.write().members = deduped;
    }

    /// Add a member if their identity is not already present.
    pub fn add_member(&self, member: Member) {
        let mut inner = self.inner.write();
        if !inner.members.iter().any(|m| m.id == member.id) {
            inner.members.push(member);
        }
    }

    /// Remove a member by identity. Returns whether anything was removed.
    pub fn remove_member(&self, id: UserId) -> bool {
        let mut inner = self.inner.write();
        let before = inner.members.len();
        inner.members.retain(|m| m.id != id);
        inner.members.len() != before
    }

    /// Rename a member in place on nick change.
    pub fn rename_member(&self, id: UserId, new_nick: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.members.iter_mut().find(|m| m.id == id) {
            Some(member) => {
                member.nick = new_nick.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn member(&self, id: UserId) -> Option<Member> {
        self.inner.read().members.iter().find(|m| m.id == id).cloned()
    }

    pub fn has_member(&self, id: UserId) -> bool {
        self.inner.read().members.iter().any(|m| m.id == id)
    }

    /// Complete member snapshot.
    pub fn members(&self) -> Vec<Member> {
        self.inner.read().members.clone()
    }

    pub fn member_count(&self) -> usize {
        self.inner.read().members.len()
    }
}

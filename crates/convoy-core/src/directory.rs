//! Identity and group-membership collaborators.
//!
//! Both are consulted on every authorization check; the engine never trusts
//! a client-asserted identity or role.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{MemberIdentity, MemberRole};

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory could not be reached.
    #[error("Directory unreachable: {0}")]
    Unreachable(String),
}

/// Who belongs to which group, and with which role.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// The user's role in the group, or `None` if not a member.
    async fn role(&self, group_id: &str, user_id: &str)
        -> Result<Option<MemberRole>, DirectoryError>;

    /// Display identity of a user, for snapshots.
    async fn identity(&self, user_id: &str) -> Result<Option<MemberIdentity>, DirectoryError>;
}

/// Resolves a session token to a stable identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Option<MemberIdentity>, DirectoryError>;
}

/// In-process directory backing both collaborator traits.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: DashMap<String, MemberIdentity>,
    tokens: DashMap<String, String>,
    groups: DashMap<String, HashMap<String, MemberRole>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user.
    pub fn add_user(&self, identity: MemberIdentity) {
        self.users.insert(identity.user_id.clone(), identity);
    }

    /// Register a session token for a user.
    pub fn add_token(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.insert(token.into(), user_id.into());
    }

    /// Add a user to a group, replacing any previous role.
    pub fn add_member(
        &self,
        group_id: impl Into<String>,
        user_id: impl Into<String>,
        role: MemberRole,
    ) {
        self.groups
            .entry(group_id.into())
            .or_default()
            .insert(user_id.into(), role);
    }

    /// Remove a user from a group.
    pub fn remove_member(&self, group_id: &str, user_id: &str) -> bool {
        self.groups
            .get_mut(group_id)
            .is_some_and(|mut members| members.remove(user_id).is_some())
    }
}

#[async_trait]
impl MembershipDirectory for MemoryDirectory {
    async fn role(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberRole>, DirectoryError> {
        Ok(self
            .groups
            .get(group_id)
            .and_then(|members| members.get(user_id).copied()))
    }

    async fn identity(&self, user_id: &str) -> Result<Option<MemberIdentity>, DirectoryError> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }
}

#[async_trait]
impl IdentityVerifier for MemoryDirectory {
    async fn verify(&self, token: &str) -> Result<Option<MemberIdentity>, DirectoryError> {
        let Some(user_id) = self.tokens.get(token).map(|u| u.clone()) else {
            return Ok(None);
        };
        Ok(Some(
            self.users
                .get(&user_id)
                .map(|u| u.clone())
                .unwrap_or_else(|| MemberIdentity::new(user_id.clone(), user_id)),
        ))
    }
}

//! Session and role collaborator
//!
//! The directory never consults sessions. Presentation layers use this to
//! decide who is looking at the directory and what they may do with it.

use crate::types::UserId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use tracing::debug;

/// What a user is allowed to be in the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Provider,
    Passenger,
    Admin,
}

impl Role {
    /// Admins may edit any provider record
    pub fn can_administer(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Provider => "provider",
            Role::Passenger => "passenger",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "provider" | "driver" => Ok(Role::Provider),
            "passenger" | "user" => Ok(Role::Passenger),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Trait for resolving the signed-in user and their role
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The signed-in user, if any
    async fn current_identity(&self) -> Option<UserId>;

    /// Role of `user_id`; users without a recorded role are passengers
    async fn role_of(&self, user_id: &str) -> Role;
}

/// Session provider with a fixed user table, for local runs and tests
#[derive(Debug, Default)]
pub struct StaticSessionProvider {
    current: RwLock<Option<UserId>>,
    roles: HashMap<UserId, Role>,
}

impl StaticSessionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, user_id: impl Into<UserId>, role: Role) -> Self {
        self.roles.insert(user_id.into(), role);
        self
    }

    pub fn sign_in(&self, user_id: impl Into<UserId>) {
        if let Ok(mut current) = self.current.write() {
            *current = Some(user_id.into());
        }
    }

    pub fn sign_out(&self) {
        if let Ok(mut current) = self.current.write() {
            *current = None;
        }
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn current_identity(&self) -> Option<UserId> {
        self.current.read().ok().and_then(|current| current.clone())
    }

    async fn role_of(&self, user_id: &str) -> Role {
        match self.roles.get(user_id) {
            Some(role) => *role,
            None => {
                debug!("No role recorded for '{}', treating as passenger", user_id);
                Role::Passenger
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("driver".parse::<Role>(), Ok(Role::Provider));
        assert_eq!("Provider".parse::<Role>(), Ok(Role::Provider));
        assert_eq!("user".parse::<Role>(), Ok(Role::Passenger));
        assert_eq!(" admin ".parse::<Role>(), Ok(Role::Admin));
        assert!("superuser".parse::<Role>().is_err());
    }

    #[test]
    fn test_only_admins_administer() {
        assert!(Role::Admin.can_administer());
        assert!(!Role::Provider.can_administer());
        assert!(!Role::Passenger.can_administer());
    }

    #[tokio::test]
    async fn test_static_sessions() {
        let sessions = StaticSessionProvider::new()
            .with_role("u-admin", Role::Admin)
            .with_role("u-driver", Role::Provider);

        assert_eq!(sessions.current_identity().await, None);

        sessions.sign_in("u-driver");
        let current = sessions.current_identity().await.unwrap();
        assert_eq!(sessions.role_of(&current).await, Role::Provider);

        sessions.sign_out();
        assert_eq!(sessions.current_identity().await, None);
    }

    #[tokio::test]
    async fn test_unknown_users_are_passengers() {
        let sessions = StaticSessionProvider::new();
        assert_eq!(sessions.role_of("nobody").await, Role::Passenger);
    }
}

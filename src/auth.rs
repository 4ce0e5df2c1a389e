use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::model::Actor;

/// Shared-password login; every user authenticates with the same secret.
#[derive(Debug)]
pub struct RoombookAuthSource {
    password: String,
}

impl RoombookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoombookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Maps login names to actors.
#[derive(Debug, Clone, Default)]
pub struct ActorDirectory {
    superusers: HashSet<String>,
    disabled: HashSet<String>,
}

impl ActorDirectory {
    pub fn new<S, D>(superusers: S, disabled: D) -> Self
    where
        S: IntoIterator<Item = String>,
        D: IntoIterator<Item = String>,
    {
        Self {
            superusers: superusers.into_iter().collect(),
            disabled: disabled.into_iter().collect(),
        }
    }

    /// Build from comma-separated lists, ignoring blanks.
    pub fn from_lists(superusers: &str, disabled: &str) -> Self {
        Self::new(split_list(superusers), split_list(disabled))
    }

    pub fn resolve(&self, login: &str) -> Actor {
        Actor {
            id: login.to_string(),
            is_active: !self.disabled.contains(login),
            is_superuser: self.superusers.contains(login),
        }
    }
}

fn split_list(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

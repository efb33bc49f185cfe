//! Authorization seam.
//!
//! Access rules are evaluated by the surrounding application; the core only
//! asks a yes/no question before an actor-initiated operation runs.

use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};
use uuid::Uuid;

use super::{StorageError, StorageResult, StorageService};

/// The user or client on whose behalf an operation runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    /// Where recall notifications are sent.
    pub email: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Download,
    Copy,
    Move,
    Recall,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Download => "download",
            Self::Copy => "copy",
            Self::Move => "move",
            Self::Recall => "recall",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Target {
    DataFile(Uuid),
    Dataset(Uuid),
    Replica(Uuid),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataFile(id) => write!(f, "datafile {}", id),
            Self::Dataset(id) => write!(f, "dataset {}", id),
            Self::Replica(id) => write!(f, "replica {}", id),
        }
    }
}

pub trait Authorizer: Send + Sync {
    fn allows(&self, actor: &Actor, action: Action, target: Target) -> bool;
}

/// Grants everything. For trusted internal callers only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn allows(&self, _actor: &Actor, _action: Action, _target: Target) -> bool {
        true
    }
}

/// Grants everything to a fixed set of actor ids and nothing to anyone else.
#[derive(Debug, Default, Clone)]
pub struct AllowList {
    actors: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(actors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actors: actors.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for AllowList {
    fn allows(&self, actor: &Actor, _action: Action, _target: Target) -> bool {
        self.actors.contains(&actor.id)
    }
}

impl StorageService {
    /// Fail with `Forbidden` unless the configured authorizer permits it.
    pub fn authorize(&self, actor: &Actor, action: Action, target: Target) -> StorageResult<()> {
        if self.authorizer.allows(actor, action, target) {
            Ok(())
        } else {
            tracing::info!(actor = %actor.id, %action, %target, "access denied");
            Err(StorageError::Forbidden {
                actor: actor.id.clone(),
                action: action.to_string(),
                target: target.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_only_grants_members() {
        let list = AllowList::new(["alice"]);
        let target = Target::DataFile(Uuid::nil());
        assert!(list.allows(&Actor::new("alice"), Action::Read, target));
        assert!(!list.allows(&Actor::new("mallory"), Action::Read, target));
        assert!(!AllowList::default().allows(&Actor::new("alice"), Action::Delete, target));
        assert!(AllowAll.allows(&Actor::new("anyone"), Action::Delete, target));
    }
}

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;

use crate::entity::EntityKind;

/// The authenticated caller, as established upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub id: Option<String>,
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Default)]
struct DecisionCache {
    generation: u64,
    decisions: HashMap<(EntityKind, String), bool>,
}

/// Everything a plugin may look at while deciding one request.
///
/// The context also memoizes verdicts so that repeated checks of the same
/// entity within one request are answered once. Memoized verdicts belong to
/// the plugin generation that produced them and are discarded after a
/// reload.
#[derive(Debug, Default)]
pub struct RequestContext {
    user: Option<User>,
    headers: BTreeMap<String, String>,
    cache: Mutex<DecisionCache>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    /// Header names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub(crate) fn cached_decision(&self, generation: u64, kind: EntityKind, name: &str) -> Option<bool> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.generation != generation {
            cache.generation = generation;
            cache.decisions.clear();
            return None;
        }
        cache.decisions.get(&(kind, name.to_string())).copied()
    }

    pub(crate) fn remember_decision(&self, generation: u64, kind: EntityKind, name: &str, allowed: bool) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.generation != generation {
            cache.generation = generation;
            cache.decisions.clear();
        }
        cache.decisions.insert((kind, name.to_string()), allowed);
    }

    pub fn forget_decisions(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decisions
            .clear();
    }
}

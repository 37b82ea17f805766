//! Named string sets and the allow/block access check built on them.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

/// Set of strings; serialized as a JSON array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringSet(HashSet<String>);

impl StringSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has(&self, item: &str) -> bool {
        self.0.contains(item)
    }
}

impl Deref for StringSet {
    type Target = HashSet<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for StringSet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<S: Into<String>> FromIterator<S> for StringSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// How list membership maps to access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Access control disabled.
    #[default]
    #[serde(alias = "")]
    Default,
    /// Only listed items pass.
    #[serde(alias = "accept", alias = "whitelist")]
    Allow,
    /// Listed items are refused.
    #[serde(alias = "deny", alias = "blacklist")]
    Block,
}

impl AccessMode {
    #[must_use]
    pub fn is_enabled(self) -> bool {
        self != Self::Default
    }
}

/// Whether `item` passes access control over `lists`.
///
/// `Default` mode lets everything through.
#[must_use]
pub fn check_access<'a, I>(lists: I, mode: AccessMode, item: &str) -> bool
where
    I: IntoIterator<Item = &'a StringSet>,
{
    let hit = lists.into_iter().any(|list| list.has(item));
    match mode {
        AccessMode::Default => true,
        AccessMode::Allow => hit,
        AccessMode::Block => !hit,
    }
}

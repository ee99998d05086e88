//! The set of modules a single connection is subscribed to.
//!
//! Module names are compared exactly (case-sensitive, no patterns).  Both
//! operations are idempotent: subscribing twice to the same module, or
//! unsubscribing from a module that was never subscribed, leaves the set as it
//! would have been after a single call.

use std::collections::BTreeSet;

/// Ordered set of subscribed module names.
///
/// A `BTreeSet` keeps the names sorted, which makes the `subscriptions` array
/// sent back to clients deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    modules: BTreeSet<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every module in `modules` (set union).
    pub fn subscribe<I, S>(&mut self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules.extend(modules.into_iter().map(Into::into));
    }

    /// Removes every module in `modules` (set difference).
    pub fn unsubscribe<I, S>(&mut self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for module in modules {
            self.modules.remove(module.as_ref());
        }
    }

    pub fn contains(&self, module: &str) -> bool {
        self.modules.contains(module)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Returns the subscribed modules, sorted.
    pub fn to_vec(&self) -> Vec<String> {
        self.modules.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(String::as_str)
    }
}

//! One-shot existence watches.
//!
//! A watch is registered per `(path, session)` pair and fires at most once, on
//! the next create, delete or data change of the path. Registering the same
//! pair twice before it fires still yields a single notification.

use crate::store::SessionId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub(crate) struct WatchRegistry {
    by_path: HashMap<String, HashSet<SessionId>>,
}

impl WatchRegistry {
    pub(crate) fn register(&mut self, path: &str, session: SessionId) {
        self.by_path
            .entry(path.to_string())
            .or_default()
            .insert(session);
    }

    /// Removes and returns every session watching `path`.
    pub(crate) fn take(&mut self, path: &str) -> Vec<SessionId> {
        self.by_path
            .remove(path)
            .map(|sessions| sessions.into_iter().collect())
            .unwrap_or_default()
    }

    pub(crate) fn drop_session(&mut self, session: SessionId) {
        self.by_path.retain(|_, sessions| {
            sessions.remove(&session);
            !sessions.is_empty()
        });
    }

    pub(crate) fn watcher_count(&self, path: &str) -> usize {
        self.by_path.get(path).map_or(0, HashSet::len)
    }
}

//! Client allow/deny lists.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

/// Copy-on-write sets of client identifiers consulted before any
/// bucket work.
///
/// Updates build a new set and publish it wholesale, so readers always
/// observe a complete snapshot. Membership checks clone the current
/// `Arc` under a brief read lock and probe without holding the lock.
#[derive(Debug, Default)]
pub(crate) struct AccessLists {
    allow: RwLock<Arc<HashSet<String>>>,
    deny: RwLock<Arc<HashSet<String>>>,
}

impl AccessLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_insert(&self, client_id: &str) {
        Self::insert(&self.allow, client_id);
    }

    pub fn allow_remove(&self, client_id: &str) {
        Self::remove(&self.allow, client_id);
    }

    pub fn is_allowed(&self, client_id: &str) -> bool {
        self.allow.read().clone().contains(client_id)
    }

    pub fn deny_insert(&self, client_id: &str) {
        Self::insert(&self.deny, client_id);
    }

    pub fn deny_remove(&self, client_id: &str) {
        Self::remove(&self.deny, client_id);
    }

    pub fn is_denied(&self, client_id: &str) -> bool {
        self.deny.read().clone().contains(client_id)
    }

    fn insert(list: &RwLock<Arc<HashSet<String>>>, client_id: &str) {
        let mut current = list.write();
        let mut updated: HashSet<String> = (**current).clone();
        updated.insert(client_id.to_string());
        *current = Arc::new(updated);
    }

    fn remove(list: &RwLock<Arc<HashSet<String>>>, client_id: &str) {
        let mut current = list.write();
        if !current.contains(client_id) {
            return;
        }
        let mut updated: HashSet<String> = (**current).clone();
        updated.remove(client_id);
        *current = Arc::new(updated);
    }
}

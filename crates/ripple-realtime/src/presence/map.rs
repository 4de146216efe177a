//! Membership set that converges regardless of message order.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::protocol::{PresenceAction, PresenceMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemberKey {
    /// `client_id:connection_id`, for everyone on the channel.
    Member,
    /// `client_id`, for members this client entered itself.
    ClientId,
}

impl MemberKey {
    fn of(self, item: &PresenceMessage) -> String {
        match self {
            MemberKey::Member => item.member_key(),
            MemberKey::ClientId => item.client_id.clone(),
        }
    }
}

/// Criteria for listing members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceQuery {
    pub wait_for_sync: bool,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
}

impl PresenceQuery {
    fn matches(&self, item: &PresenceMessage) -> bool {
        self.client_id.as_deref().map_or(true, |c| c == item.client_id)
            && self
                .connection_id
                .as_deref()
                .map_or(true, |c| c == item.connection_id)
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Whether `item` should replace `existing`.
fn newer_than(item: &PresenceMessage, existing: &PresenceMessage) -> bool {
    if item.is_synthesized() || existing.is_synthesized() {
        return item.timestamp.unwrap_or(0) >= existing.timestamp.unwrap_or(0);
    }
    match (item.parse_id(), existing.parse_id()) {
        (Some(new), Some(old)) => new > old,
        _ => item.timestamp.unwrap_or(0) >= existing.timestamp.unwrap_or(0),
    }
}

pub(crate) struct PresenceMap {
    key: MemberKey,
    map: HashMap<String, PresenceMessage>,
    /// Members present when the current sync started and not seen since.
    residual: Option<HashMap<String, PresenceMessage>>,
    sync_in_progress: bool,
}

impl PresenceMap {
    pub fn new(key: MemberKey) -> Self {
        Self {
            key,
            map: HashMap::new(),
            residual: None,
            sync_in_progress: false,
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&PresenceMessage> {
        self.map.get(key)
    }

    pub fn values(&self) -> Vec<PresenceMessage> {
        self.map
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .cloned()
            .collect()
    }

    pub fn list(&self, query: &PresenceQuery) -> Vec<PresenceMessage> {
        let mut members: Vec<PresenceMessage> = self
            .map
            .values()
            .filter(|m| m.action != PresenceAction::Absent && query.matches(m))
            .cloned()
            .collect();
        members.sort_by(|a, b| a.member_key().cmp(&b.member_key()));
        members
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress
    }

    /// Add or replace a member; returns false if `item` is older than what
    /// is held.
    pub fn put(&mut self, item: PresenceMessage) -> bool {
        let mut item = item;
        if matches!(item.action, PresenceAction::Enter | PresenceAction::Update) {
            item.action = PresenceAction::Present;
        }
        let key = self.key.of(&item);
        if let Some(residual) = self.residual.as_mut() {
            residual.remove(&key);
        }
        if let Some(existing) = self.map.get(&key) {
            if !newer_than(&item, existing) {
                debug!(key = %key, "Ignoring stale presence");
                return false;
            }
        }
        self.map.insert(key, item);
        true
    }

    /// Remove a member; returns false if there was none or `item` is stale.
    /// During a sync an absent marker is kept even for unknown members.
    pub fn remove(&mut self, item: &PresenceMessage) -> bool {
        let key = self.key.of(item);
        let existed = match self.map.get(&key) {
            Some(existing) if !newer_than(item, existing) => return false,
            Some(_) => true,
            None => false,
        };
        if self.sync_in_progress {
            // Keep a tombstone so an older PRESENT later in the sync loses.
            let mut absent = item.clone();
            absent.action = PresenceAction::Absent;
            self.map.insert(key, absent);
        } else {
            self.map.remove(&key);
        }
        existed
    }

    pub fn start_sync(&mut self) {
        if !self.sync_in_progress {
            debug!(members = self.map.len(), "Presence sync started");
            self.residual = Some(self.map.clone());
            self.sync_in_progress = true;
        }
    }

    /// Finish a sync; returns a synthesized leave for every member the sync
    /// did not mention.
    pub fn end_sync(&mut self) -> Vec<PresenceMessage> {
        if !self.sync_in_progress {
            return Vec::new();
        }
        self.map.retain(|_, m| m.action != PresenceAction::Absent);

        let mut leaves = Vec::new();
        let now = now_millis();
        for (key, member) in self.residual.take().unwrap_or_default() {
            if self.map.remove(&key).is_some() {
                leaves.push(synthesized_leave(&member, now));
            }
        }
        self.sync_in_progress = false;
        debug!(members = self.map.len(), left = leaves.len(), "Presence sync ended");
        leaves
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.residual = None;
        self.sync_in_progress = false;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.values().len()
    }
}

pub(crate) fn synthesized_leave(member: &PresenceMessage, timestamp: i64) -> PresenceMessage {
    PresenceMessage {
        id: None,
        action: PresenceAction::Leave,
        timestamp: Some(timestamp),
        ..member.clone()
    }
}

//! Multi-dimensional ban records with per-dimension lookup indexes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Horizon used for every ban that is not a timed temporary ban.
pub const PERMANENT_BAN_MILLIS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanType {
    Temporary,
    Permanent,
    Ip,
    Hardware,
}

/// Who a ban is aimed at. Empty dimensions are simply not indexed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BanTarget {
    pub player_id: Option<u32>,
    pub endpoint: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub ban_id: String,
    pub player_id: Option<u32>,
    pub endpoint: Option<String>,
    pub fingerprint: Option<String>,
    pub admin_id: u32,
    pub reason: String,
    pub ban_type: BanType,
    pub ban_time: u64,
    pub expires_at: u64,
    pub active: bool,
}

impl BanRecord {
    pub fn is_live(&self, now: u64) -> bool {
        self.active && now < self.expires_at
    }

    /// Restricts the stored dimensions to the ones the ban type covers.
    pub fn new(
        ban_id: String,
        target: BanTarget,
        admin_id: u32,
        reason: &str,
        ban_type: BanType,
        now: u64,
        duration_ms: Option<u64>,
    ) -> Self {
        let non_empty = |s: Option<String>| s.filter(|v| !v.is_empty());
        let (player_id, endpoint, fingerprint) = match ban_type {
            BanType::Ip => (None, non_empty(target.endpoint), None),
            BanType::Hardware => (None, None, non_empty(target.fingerprint)),
            BanType::Temporary | BanType::Permanent => (
                target.player_id,
                non_empty(target.endpoint),
                non_empty(target.fingerprint),
            ),
        };
        let lifetime = match (ban_type, duration_ms) {
            (BanType::Temporary, Some(ms)) => ms,
            _ => PERMANENT_BAN_MILLIS,
        };
        Self {
            ban_id,
            player_id,
            endpoint,
            fingerprint,
            admin_id,
            reason: reason.to_string(),
            ban_type,
            ban_time: now,
            expires_at: now.saturating_add(lifetime),
            active: true,
        }
    }
}

pub fn generate_ban_id() -> String {
    format!("ban_{:08x}", rand::thread_rng().gen::<u32>())
}

#[derive(Debug, Default)]
pub struct BanList {
    records: HashMap<String, BanRecord>,
    by_player: HashMap<u32, HashSet<String>>,
    by_endpoint: HashMap<String, HashSet<String>>,
    by_fingerprint: HashMap<String, HashSet<String>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, ban_id: &str) -> bool {
        self.records.contains_key(ban_id)
    }

    pub fn insert(&mut self, record: BanRecord) {
        let id = record.ban_id.clone();
        if let Some(player_id) = record.player_id {
            self.by_player.entry(player_id).or_default().insert(id.clone());
        }
        if let Some(endpoint) = &record.endpoint {
            self.by_endpoint
                .entry(endpoint.clone())
                .or_default()
                .insert(id.clone());
        }
        if let Some(fingerprint) = &record.fingerprint {
            self.by_fingerprint
                .entry(fingerprint.clone())
                .or_default()
                .insert(id.clone());
        }
        self.records.insert(id, record);
    }

    /// First live ban matching any of the supplied dimensions.
    pub fn find_match(
        &self,
        player_id: Option<u32>,
        endpoint: &str,
        fingerprint: &str,
        now: u64,
    ) -> Option<&BanRecord> {
        let candidates = player_id
            .and_then(|id| self.by_player.get(&id))
            .into_iter()
            .chain(self.by_endpoint.get(endpoint))
            .chain(self.by_fingerprint.get(fingerprint))
            .flatten();

        candidates
            .filter_map(|id| self.records.get(id))
            .find(|record| record.is_live(now))
    }

    pub fn deactivate(&mut self, ban_id: &str) -> Option<&BanRecord> {
        let record = self.records.get_mut(ban_id)?;
        record.active = false;
        Some(record)
    }

    pub fn get(&self, ban_id: &str) -> Option<&BanRecord> {
        self.records.get(ban_id)
    }

    pub fn active(&self, now: u64) -> Vec<BanRecord> {
        let mut bans: Vec<BanRecord> = self
            .records
            .values()
            .filter(|r| r.is_live(now))
            .cloned()
            .collect();
        bans.sort_by(|a, b| a.ban_time.cmp(&b.ban_time).then(a.ban_id.cmp(&b.ban_id)));
        bans
    }

    pub fn all(&self) -> Vec<BanRecord> {
        self.records.values().cloned().collect()
    }

    /// Drops inactive and expired bans; returns how many were removed.
    pub fn prune(&mut self, now: u64) -> usize {
        let dead: Vec<String> = self
            .records
            .values()
            .filter(|r| !r.is_live(now))
            .map(|r| r.ban_id.clone())
            .collect();
        for id in &dead {
            self.remove(id);
        }
        dead.len()
    }

    fn remove(&mut self, ban_id: &str) {
        let Some(record) = self.records.remove(ban_id) else {
            return;
        };
        if let Some(player_id) = record.player_id {
            unindex(&mut self.by_player, &player_id, ban_id);
        }
        if let Some(endpoint) = &record.endpoint {
            unindex(&mut self.by_endpoint, endpoint, ban_id);
        }
        if let Some(fingerprint) = &record.fingerprint {
            unindex(&mut self.by_fingerprint, fingerprint, ban_id);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn unindex<K: std::hash::Hash + Eq>(index: &mut HashMap<K, HashSet<String>>, key: &K, ban_id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(ban_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

//! Connected host bridges, as seen by the UDP transport
//!
//! This module tracks which network address speaks for which authenticated
//! player:
//! - Peer registration after a successful authentication
//! - Address lookup for incoming packets and audience fan-out
//! - Liveness tracking and timeout detection
//! - Capacity enforcement mirroring `max_online_players`
//!
//! The table is transport state only. Sessions, permissions and everything
//! else about a player live in the coordination core.

use log::info;
use shared::Audience;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One authenticated bridge connection
#[derive(Debug, Clone)]
pub struct Peer {
    /// Player the bridge authenticated as
    pub player_id: u32,
    /// Where decisions for this player are sent
    pub addr: SocketAddr,
    /// Session token, kept so a silent disconnect can be reported as a leave
    pub session_token: String,
    /// Last time any packet arrived from this peer
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(player_id: u32, addr: SocketAddr, session_token: String) -> Self {
        Self {
            player_id,
            addr,
            session_token,
            last_seen: Instant::now(),
        }
    }

    /// Returns true if nothing has been heard from the peer within `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Address book of authenticated bridges
///
/// A player is reachable through at most one address and an address speaks
/// for at most one player; registering either again replaces the old entry.
pub struct PeerManager {
    peers: HashMap<u32, Peer>,
    max_peers: usize,
    timeout: Duration,
}

impl PeerManager {
    pub fn new(max_peers: usize, timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
            timeout,
        }
    }

    /// Registers `player_id` at `addr`.
    ///
    /// Returns false when the table is full and the player is not already
    /// present.
    pub fn add_peer(&mut self, player_id: u32, addr: SocketAddr, session_token: String) -> bool {
        if let Some(previous) = self.find_by_addr(addr) {
            if previous != player_id {
                info!("Address {} now speaks for player #{} instead of #{}", addr, player_id, previous);
                self.peers.remove(&previous);
            }
        }
        if !self.peers.contains_key(&player_id) && self.peers.len() >= self.max_peers {
            return false;
        }

        info!("Peer for player #{} registered at {}", player_id, addr);
        self.peers
            .insert(player_id, Peer::new(player_id, addr, session_token));
        true
    }

    pub fn remove_peer(&mut self, player_id: u32) -> Option<Peer> {
        let peer = self.peers.remove(&player_id)?;
        info!("Peer for player #{} at {} removed", player_id, peer.addr);
        Some(peer)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.peers
            .values()
            .find(|peer| peer.addr == addr)
            .map(|peer| peer.player_id)
    }

    pub fn get(&self, player_id: u32) -> Option<&Peer> {
        self.peers.get(&player_id)
    }

    /// Marks the peer at `addr` as alive; returns its player id.
    pub fn touch(&mut self, addr: SocketAddr) -> Option<u32> {
        let peer = self.peers.values_mut().find(|peer| peer.addr == addr)?;
        peer.last_seen = Instant::now();
        Some(peer.player_id)
    }

    /// Removes and returns every peer silent for longer than the timeout.
    pub fn check_timeouts(&mut self) -> Vec<Peer> {
        let timed_out: Vec<u32> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(self.timeout))
            .map(|peer| peer.player_id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|player_id| self.remove_peer(player_id))
            .collect()
    }

    /// Addresses of every peer the audience includes, ordered by player id.
    pub fn addrs_for(&self, audience: Audience) -> Vec<(u32, SocketAddr)> {
        let mut addrs: Vec<(u32, SocketAddr)> = self
            .peers
            .values()
            .filter(|peer| audience.includes(peer.player_id))
            .map(|peer| (peer.player_id, peer.addr))
            .collect();
        addrs.sort_by_key(|(player_id, _)| *player_id);
        addrs
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn manager(max_peers: usize) -> PeerManager {
        PeerManager::new(max_peers, Duration::from_secs(5))
    }

    #[test]
    fn test_add_and_find_peer() {
        let mut peers = manager(2);
        assert!(peers.add_peer(7, addr(9000), "tok".to_string()));

        assert_eq!(peers.len(), 1);
        assert_eq!(peers.find_by_addr(addr(9000)), Some(7));
        assert_eq!(peers.find_by_addr(addr(9001)), None);
        assert_eq!(peers.get(7).unwrap().session_token, "tok");
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut peers = manager(1);
        assert!(peers.add_peer(1, addr(9000), "a".to_string()));
        assert!(!peers.add_peer(2, addr(9001), "b".to_string()));
        assert_eq!(peers.len(), 1);

        // Re-registering a present player does not need a free slot
        assert!(peers.add_peer(1, addr(9002), "c".to_string()));
        assert_eq!(peers.find_by_addr(addr(9002)), Some(1));
    }

    #[test]
    fn test_address_reuse_replaces_old_player() {
        let mut peers = manager(4);
        peers.add_peer(1, addr(9000), "a".to_string());
        peers.add_peer(2, addr(9000), "b".to_string());

        assert_eq!(peers.len(), 1);
        assert!(peers.get(1).is_none());
        assert_eq!(peers.find_by_addr(addr(9000)), Some(2));
    }

    #[test]
    fn test_remove_peer() {
        let mut peers = manager(2);
        peers.add_peer(3, addr(9000), "a".to_string());

        let removed = peers.remove_peer(3).unwrap();
        assert_eq!(removed.addr, addr(9000));
        assert!(peers.is_empty());
        assert!(peers.remove_peer(3).is_none());
    }

    #[test]
    fn test_timeouts_remove_silent_peers() {
        let mut peers = manager(4);
        peers.add_peer(1, addr(9000), "a".to_string());
        peers.add_peer(2, addr(9001), "b".to_string());
        peers.peers.get_mut(&1).unwrap().last_seen = Instant::now() - Duration::from_secs(10);

        let timed_out = peers.check_timeouts();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].player_id, 1);
        assert_eq!(timed_out[0].session_token, "a");
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_touch_refreshes_liveness() {
        let mut peers = manager(4);
        peers.add_peer(1, addr(9000), "a".to_string());
        peers.peers.get_mut(&1).unwrap().last_seen = Instant::now() - Duration::from_secs(10);

        assert_eq!(peers.touch(addr(9000)), Some(1));
        assert!(peers.check_timeouts().is_empty());
        assert_eq!(peers.touch(addr(9999)), None);
    }

    #[test]
    fn test_audience_fan_out() {
        let mut peers = manager(4);
        peers.add_peer(1, addr(9001), "a".to_string());
        peers.add_peer(2, addr(9002), "b".to_string());
        peers.add_peer(3, addr(9003), "c".to_string());

        assert_eq!(peers.addrs_for(Audience::All).len(), 3);
        assert_eq!(peers.addrs_for(Audience::Player(2)), vec![(2, addr(9002))]);
        let others: Vec<u32> = peers
            .addrs_for(Audience::AllExcept(2))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(others, vec![1, 3]);
    }
}

//! UDP transport between host bridges and the coordination core

use crate::auth::AuthRequest;
use crate::bridge::HostBridge;
use crate::client_manager::{Peer, PeerManager};
use crate::config::NetworkConfig;
use crate::coop::CoopCore;
use crate::error::CoreError;
use crate::lifecycle::{SystemState, SystemType};
use log::{debug, error, info, warn};
use shared::{
    decode, encode, AuthResult, AuthoritativeDecision, HostEvent, Packet, WirePacket, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    PeerTimeout { peer: Peer },
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
    Deliver { decision: AuthoritativeDecision },
    /// Drop a peer once everything queued before it has gone out
    Forget { player_id: u32 },
}

/// Host bridge that forwards decisions to the sender task for fan-out.
///
/// A revoked session also unregisters its peer, right after the notice,
/// unless the player has logged in again since.
struct PeerFanout<'a> {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    core: &'a CoopCore,
}

impl HostBridge for PeerFanout<'_> {
    fn apply_authoritative(&self, decision: &AuthoritativeDecision) {
        if let Err(e) = self.tx.send(OutboundMessage::Deliver {
            decision: decision.clone(),
        }) {
            error!("Failed to queue decision for delivery: {}", e);
        }
        if let WirePacket::SessionRevoked { player_id, .. } = &decision.packet {
            if self.core.auth().is_online(*player_id) {
                return;
            }
            if let Err(e) = self.tx.send(OutboundMessage::Forget { player_id: *player_id }) {
                error!("Failed to queue peer removal: {}", e);
            }
        }
    }
}

/// Transport server driving one [`CoopCore`]
pub struct Server {
    socket: Arc<UdpSocket>,
    core: Arc<CoopCore>,
    peers: Arc<RwLock<PeerManager>>,
    tick_duration: Duration,
    max_packet_size: usize,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    pub async fn new(core: Arc<CoopCore>, config: &NetworkConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_address).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let peers = PeerManager::new(
            core.config().identity.max_online_players,
            Duration::from_secs(config.peer_timeout_secs),
        );

        Ok(Server {
            socket,
            core,
            peers: Arc::new(RwLock::new(peers)),
            tick_duration: Duration::from_secs_f64(1.0 / f64::from(config.tick_rate.max(1))),
            max_packet_size: config.max_packet_size,
            server_tx,
            server_rx,
            out_tx,
            out_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender usable to stop [`Server::run`] from outside.
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();
        let max_packet_size = self.max_packet_size;

        tokio::spawn(async move {
            let mut buffer = vec![0u8; max_packet_size];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match decode::<Packet>(&buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) = server_tx.send(ServerMessage::PacketReceived { packet, addr }) {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to decode packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let peers = Arc::clone(&self.peers);
        let mut out_rx = std::mem::replace(&mut self.out_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::Deliver { decision } => {
                        let targets = peers.read().await.addrs_for(decision.audience);
                        let name = decision.packet.name();
                        let packet = Packet::Decision(decision);
                        for (player_id, addr) in targets {
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send {} to player #{}: {}", name, player_id, e);
                            }
                        }
                    }
                    OutboundMessage::Forget { player_id } => {
                        peers.write().await.remove_peer(player_id);
                    }
                }
            }
        });
    }

    /// Spawns task that monitors peer timeouts
    fn spawn_timeout_checker(&self) {
        let peers = Arc::clone(&self.peers);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = peers.write().await.check_timeouts();
                for peer in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::PeerTimeout { peer }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Runs `job` every `every` until the lifecycle stop flag leaves `Running`.
    fn spawn_periodic<F>(&self, name: &'static str, every: Duration, job: F)
    where
        F: Fn(&CoopCore) + Send + 'static,
    {
        let stop = self.core.lifecycle().stop_flag();
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            let mut interval = interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if stop.should_stop() {
                    break;
                }
                job(&*core);
            }
            debug!("{} stopped", name);
        });
    }

    /// Spawns the background sweeps that must keep running even while the
    /// main loop is busy with packets.
    fn spawn_background_tasks(&self) {
        let config = self.core.config();

        let sweep_every = Duration::from_secs(config.identity.session_sweep_interval_secs.max(1));
        self.spawn_periodic("Identity sweep", sweep_every, |core| {
            let swept = core.sweep_identity();
            if swept > 0 {
                debug!("Identity sweep removed {} entries", swept);
            }
        });

        let lifecycle = &config.lifecycle;
        let poll_every = Duration::from_millis(
            lifecycle
                .health_check_interval_ms
                .min(lifecycle.watchdog_interval_ms)
                .max(10),
        );
        self.spawn_periodic("Health polling", poll_every, |core| core.lifecycle().poll());

        let walk_every = Duration::from_millis(config.quest.sync_walk_interval_ms.max(10));
        self.spawn_periodic("Quest sync walker", walk_every, |core| {
            if is_running(core, &SystemType::QuestEngine) {
                let synced = core.quests().run_sync_walk();
                if synced > 0 {
                    debug!("Sync walker refreshed {} quests", synced);
                }
            }
        });

        let scan_every = Duration::from_millis(config.dialog.vote_scan_interval_ms.max(10));
        self.spawn_periodic("Vote timeout scan", scan_every, |core| {
            let mut expired = 0;
            if is_running(core, &SystemType::DialogCoordinator) {
                expired += core.dialogs().process_vote_timeouts();
            }
            if is_running(core, &SystemType::QuestEngine) {
                expired += core.quests().process_vote_timeouts();
            }
            if expired > 0 {
                debug!("Vote scan failed {} expired votes", expired);
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = encode(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.out_tx.send(OutboundMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn send_error(&self, error: &CoreError, addr: SocketAddr) {
        self.send_packet(
            Packet::Error {
                kind: error.kind().to_string(),
                message: error.to_string(),
            },
            addr,
        );
    }

    /// Processes one incoming packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        {
            // A bridge whose session is gone must still be allowed to time out
            let mut peers = self.peers.write().await;
            if let Some(player_id) = peers.find_by_addr(addr) {
                if self.core.auth().is_online(player_id) {
                    peers.touch(addr);
                }
            }
        }

        match packet {
            Packet::Authenticate {
                protocol_version,
                name,
                token,
                method,
                fingerprint,
            } => {
                info!("Bridge authenticating from {} as {}", addr, name);
                if protocol_version != PROTOCOL_VERSION {
                    let message = format!(
                        "protocol version {} is not supported (expected {})",
                        protocol_version, PROTOCOL_VERSION
                    );
                    self.send_packet(
                        Packet::AuthFailed {
                            code: AuthResult::VersionMismatch,
                            message,
                        },
                        addr,
                    );
                    return;
                }

                let request = AuthRequest::new(&name, &token, method, &fingerprint, &addr.ip().to_string());
                match self.core.authenticate(&request) {
                    Ok(grant) => {
                        let registered = self
                            .peers
                            .write()
                            .await
                            .add_peer(grant.player_id, addr, grant.session_token.clone());
                        if !registered {
                            if let Err(e) = self.core.auth().logout(grant.player_id) {
                                warn!("Could not undo session of player #{}: {}", grant.player_id, e);
                            }
                            self.send_packet(
                                Packet::AuthFailed {
                                    code: AuthResult::ServerFull,
                                    message: "no free bridge slot".to_string(),
                                },
                                addr,
                            );
                            return;
                        }
                        self.send_packet(
                            Packet::Authenticated {
                                player_id: grant.player_id,
                                session_token: grant.session_token,
                                permission_level: grant.permission_level,
                                permissions: grant.permissions,
                                expires_at: grant.expires_at,
                            },
                            addr,
                        );
                    }
                    Err(rejection) => {
                        self.send_packet(
                            Packet::AuthFailed {
                                code: rejection.code,
                                message: rejection.message,
                            },
                            addr,
                        );
                    }
                }
            }

            Packet::Event {
                player_id,
                session_token,
                event,
            } => {
                let kind = event.kind();
                if let Err(e) = self.core.ingest(player_id, &session_token, event) {
                    debug!("Rejected {} from player #{}: {}", kind, player_id, e);
                    self.send_error(&e, addr);
                }
            }

            Packet::Logout {
                player_id,
                session_token,
            } => {
                match self.core.logout(player_id, &session_token) {
                    Ok(()) => {
                        // Queues the revocation notice and then the peer removal
                        self.flush_decisions();
                    }
                    Err(e) => self.send_error(&e, addr),
                }
            }

            Packet::Heartbeat { player_id } => {
                let known = self.peers.read().await.find_by_addr(addr);
                if known != Some(player_id) {
                    debug!("Heartbeat for player #{} from unregistered {}", player_id, addr);
                }
            }

            _ => {
                warn!("Unexpected packet type from bridge at {}", addr);
            }
        }
    }

    /// Reports a silently disconnected bridge as a player leave.
    fn handle_timeout(&self, peer: Peer) {
        info!("Bridge of player #{} at {} timed out", peer.player_id, peer.addr);
        let leave = HostEvent::PlayerLeave {
            player_id: peer.player_id,
        };
        if let Err(e) = self.core.ingest(peer.player_id, &peer.session_token, leave) {
            debug!("Leave for timed-out player #{} not ingested: {}", peer.player_id, e);
        }
        if let Err(e) = self.core.auth().logout(peer.player_id) {
            debug!("No session to end for player #{}: {}", peer.player_id, e);
        }
    }

    /// Hands queued decisions to the sender task.
    fn flush_decisions(&self) -> usize {
        let fanout = PeerFanout {
            tx: self.out_tx.clone(),
            core: &self.core,
        };
        self.core.pump(&fanout)
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();
        self.spawn_background_tasks();

        let stop = self.core.lifecycle().stop_flag();
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::PeerTimeout { peer }) => {
                            self.handle_timeout(peer);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                    self.flush_decisions();
                },

                _ = tick_interval.tick() => {
                    self.core.tick();
                    self.flush_decisions();
                    ticks += 1;

                    if stop.should_stop() {
                        warn!("Core stopped ({}), leaving server loop",
                              self.core.lifecycle().emergency_reason().unwrap_or_else(|| "shutdown".to_string()));
                        break;
                    }

                    if ticks % 600 == 0 {
                        let peers = self.peers.read().await.len();
                        debug!("Tick {}: {} bridges, {} dialogs active", ticks, peers,
                               self.core.dialogs().get_active_dialog_count());
                    }
                },
            }
        }

        self.core.shutdown();
        self.flush_decisions();
        Ok(())
    }
}

fn is_running(core: &CoopCore, system_type: &SystemType) -> bool {
    core.lifecycle().get_system_state(system_type) == Some(SystemState::Running)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::clock::ManualClock;
    use shared::{AuthMethod, Audience};

    async fn test_server() -> Server {
        let config = CoreConfig::default();
        let core = Arc::new(CoopCore::new(config.clone()).unwrap());
        core.initialize().unwrap();
        let network = NetworkConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..config.network
        };
        Server::new(core, &network).await.unwrap()
    }

    async fn test_server_at(clock: &ManualClock) -> Server {
        let config = CoreConfig::default();
        let core = Arc::new(CoopCore::with_clock(config.clone(), Arc::new(clock.clone()), None).unwrap());
        core.initialize().unwrap();
        let network = NetworkConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..config.network
        };
        Server::new(core, &network).await.unwrap()
    }

    /// Drains the outbound queue, applying peer removals like the sender task.
    async fn drain(server: &mut Server) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = server.out_rx.try_recv() {
            if let OutboundMessage::Forget { player_id } = &message {
                server.peers.write().await.remove_peer(*player_id);
            }
            messages.push(message);
        }
        messages
    }

    fn bridge_addr() -> SocketAddr {
        "127.0.0.1:40001".parse().unwrap()
    }

    fn authenticate(version: u32) -> Packet {
        Packet::Authenticate {
            protocol_version: version,
            name: "Nova".to_string(),
            token: "steam-token-0123456789".to_string(),
            method: AuthMethod::Steam,
            fingerprint: "hwA".to_string(),
        }
    }

    fn next_outbound(server: &mut Server) -> OutboundMessage {
        server.out_rx.try_recv().unwrap()
    }

    #[tokio::test]
    async fn test_authenticate_registers_peer() {
        let mut server = test_server().await;
        server.handle_packet(authenticate(PROTOCOL_VERSION), bridge_addr()).await;

        match next_outbound(&mut server) {
            OutboundMessage::SendPacket {
                packet: Packet::Authenticated { player_id, session_token, .. },
                addr,
            } => {
                assert_eq!(addr, bridge_addr());
                assert!(session_token.len() >= 32);
                assert_eq!(server.peers.read().await.find_by_addr(addr), Some(player_id));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_is_refused() {
        let mut server = test_server().await;
        server.handle_packet(authenticate(PROTOCOL_VERSION + 1), bridge_addr()).await;

        match next_outbound(&mut server) {
            OutboundMessage::SendPacket {
                packet: Packet::AuthFailed { code, .. },
                ..
            } => assert_eq!(code, AuthResult::VersionMismatch),
            other => panic!("Unexpected message: {:?}", other),
        }
        assert!(server.peers.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_event_reports_error_kind() {
        let mut server = test_server().await;
        let packet = Packet::Event {
            player_id: 5,
            session_token: "nope".to_string(),
            event: HostEvent::PlayerLeave { player_id: 5 },
        };
        server.handle_packet(packet, bridge_addr()).await;

        match next_outbound(&mut server) {
            OutboundMessage::SendPacket {
                packet: Packet::Error { kind, .. },
                ..
            } => assert_eq!(kind, "NotFound"),
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_logs_player_out() {
        let mut server = test_server().await;
        server.handle_packet(authenticate(PROTOCOL_VERSION), bridge_addr()).await;
        let _ = next_outbound(&mut server);

        let peer = server.peers.write().await.remove_peer(1).unwrap();
        server.handle_timeout(peer);

        assert!(!server.core.auth().is_online(1));
        server.flush_decisions();
        match next_outbound(&mut server) {
            OutboundMessage::Deliver { decision } => {
                assert_eq!(decision.audience, Audience::Player(1));
                assert!(matches!(decision.packet, WirePacket::SessionRevoked { player_id: 1, .. }));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_revoked_session_unregisters_peer() {
        let mut server = test_server().await;
        server.handle_packet(authenticate(PROTOCOL_VERSION), bridge_addr()).await;
        drain(&mut server).await;

        server.core.auth().logout(1).unwrap();
        server.flush_decisions();
        let messages = drain(&mut server).await;

        assert_eq!(messages.len(), 2);
        match &messages[0] {
            OutboundMessage::Deliver { decision } => {
                assert_eq!(decision.audience, Audience::Player(1));
                assert!(matches!(decision.packet, WirePacket::SessionRevoked { player_id: 1, .. }));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert!(matches!(messages[1], OutboundMessage::Forget { player_id: 1 }));

        server
            .handle_packet(Packet::Heartbeat { player_id: 1 }, bridge_addr())
            .await;
        let peers = server.peers.read().await;
        assert_eq!(peers.find_by_addr(bridge_addr()), None);
        assert!(peers.addrs_for(Audience::All).is_empty());
    }

    #[tokio::test]
    async fn test_expired_session_is_not_kept_alive() {
        let clock = ManualClock::new(1_000_000);
        let mut server = test_server_at(&clock).await;
        server.handle_packet(authenticate(PROTOCOL_VERSION), bridge_addr()).await;
        drain(&mut server).await;

        let first_seen = server.peers.read().await.get(1).unwrap().last_seen;
        tokio::time::sleep(Duration::from_millis(5)).await;
        server
            .handle_packet(Packet::Heartbeat { player_id: 1 }, bridge_addr())
            .await;
        let refreshed = server.peers.read().await.get(1).unwrap().last_seen;
        assert!(refreshed > first_seen);

        // Past the session deadline heartbeats no longer count as liveness
        clock.advance(Duration::from_secs(3_600));
        tokio::time::sleep(Duration::from_millis(5)).await;
        server
            .handle_packet(Packet::Heartbeat { player_id: 1 }, bridge_addr())
            .await;
        assert_eq!(server.peers.read().await.get(1).unwrap().last_seen, refreshed);

        assert!(server.core.sweep_identity() >= 1);
        server.flush_decisions();
        let messages = drain(&mut server).await;
        assert!(messages
            .iter()
            .any(|m| matches!(m, OutboundMessage::Forget { player_id: 1 })));
        assert!(server.peers.read().await.is_empty());
    }

    #[test]
    fn test_peer_fanout_forwards_decisions() {
        let core = CoopCore::new(CoreConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fanout = PeerFanout { tx, core: &core };
        let decision = AuthoritativeDecision::to_player(
            3,
            WirePacket::SessionRevoked {
                player_id: 3,
                reason: "kicked".to_string(),
            },
        );
        fanout.apply_authoritative(&decision);

        match rx.try_recv().unwrap() {
            OutboundMessage::Deliver { decision: d } => assert_eq!(d, decision),
            other => panic!("Unexpected message: {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), OutboundMessage::Forget { player_id: 3 }));
        assert!(rx.try_recv().is_err());
    }
}

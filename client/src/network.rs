use crate::commands::parse_command;
use log::{debug, error, info, warn};
use shared::{
    decode, encode, AuthMethod, AuthResult, AuthoritativeDecision, HostEvent, Packet,
    PermissionLevel, WirePacket, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};

/// Session granted by the server after a successful authentication
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub player_id: u32,
    pub session_token: String,
    pub permission_level: PermissionLevel,
    pub permissions: Vec<String>,
    pub expires_at: u64,
}

/// What the bridge learned from one server packet
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeUpdate {
    Authenticated(Session),
    AuthFailed { code: AuthResult, message: String },
    Decision(AuthoritativeDecision),
    Rejected { kind: String, message: String },
    /// The server revoked this bridge's session
    Revoked { reason: String },
}

/// Reference host-bridge adapter speaking the coordination protocol over UDP.
///
/// A real integration would translate game-engine hooks into [`HostEvent`]s
/// and enact the returned decisions in the game; this one reads commands and
/// logs decisions.
pub struct BridgeClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    session: Option<Session>,
    reply_timeout: Duration,
    buffer: Vec<u8>,
}

impl BridgeClient {
    pub async fn new(server_addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let server_addr: SocketAddr = server_addr.parse()?;
        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;

        Ok(BridgeClient {
            socket,
            server_addr,
            session: None,
            reply_timeout: Duration::from_secs(2),
            buffer: vec![0u8; 4096],
        })
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn player_id(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.player_id)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = encode(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Sends credentials and waits for the server's verdict.
    ///
    /// Decisions that arrive before the verdict are dropped.
    pub async fn authenticate(
        &mut self,
        name: &str,
        token: &str,
        method: AuthMethod,
        fingerprint: &str,
    ) -> Result<BridgeUpdate, Box<dyn std::error::Error>> {
        info!("Authenticating as '{}' via {}", name, method.name());
        self.send_packet(&Packet::Authenticate {
            protocol_version: PROTOCOL_VERSION,
            name: name.to_string(),
            token: token.to_string(),
            method,
            fingerprint: fingerprint.to_string(),
        })
        .await?;

        loop {
            match self.next_update().await? {
                Some(update @ BridgeUpdate::Authenticated(_))
                | Some(update @ BridgeUpdate::AuthFailed { .. }) => return Ok(update),
                Some(other) => debug!("Ignoring {:?} while authenticating", other),
                None => return Err("no authentication reply from server".into()),
            }
        }
    }

    /// Forwards one host event under the current session.
    pub async fn send_event(&self, event: HostEvent) -> Result<(), Box<dyn std::error::Error>> {
        let session = self.session.as_ref().ok_or("not authenticated")?;
        debug!("Sending {} event", event.kind());
        self.send_packet(&Packet::Event {
            player_id: session.player_id,
            session_token: session.session_token.clone(),
            event,
        })
        .await
    }

    pub async fn heartbeat(&self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(session) = &self.session {
            self.send_packet(&Packet::Heartbeat {
                player_id: session.player_id,
            })
            .await?;
        }
        Ok(())
    }

    /// Ends the session; a no-op when not authenticated.
    pub async fn logout(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(session) = self.session.take() {
            info!("Logging out player #{}", session.player_id);
            self.send_packet(&Packet::Logout {
                player_id: session.player_id,
                session_token: session.session_token,
            })
            .await?;
        }
        Ok(())
    }

    /// Waits up to the reply timeout for the next server packet.
    ///
    /// Returns `Ok(None)` on timeout. Undecodable datagrams are skipped.
    pub async fn next_update(&mut self) -> Result<Option<BridgeUpdate>, Box<dyn std::error::Error>> {
        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let received = match timeout(remaining, self.socket.recv_from(&mut self.buffer)).await {
                Ok(result) => result?,
                Err(_) => return Ok(None),
            };
            let (len, from) = received;
            if from != self.server_addr {
                warn!("Ignoring datagram from unexpected address {}", from);
                continue;
            }
            match decode::<Packet>(&self.buffer[..len]) {
                Ok(packet) => {
                    if let Some(update) = self.handle_packet(packet) {
                        return Ok(Some(update));
                    }
                }
                Err(e) => warn!("Failed to decode packet from server: {}", e),
            }
        }
    }

    /// Collects updates until the server stays silent for `window`.
    pub async fn collect_updates(
        &mut self,
        window: Duration,
    ) -> Result<Vec<BridgeUpdate>, Box<dyn std::error::Error>> {
        let saved = self.reply_timeout;
        self.reply_timeout = window;
        let mut updates = Vec::new();
        let result = loop {
            match self.next_update().await {
                Ok(Some(update)) => updates.push(update),
                Ok(None) => break Ok(updates),
                Err(e) => break Err(e),
            }
        };
        self.reply_timeout = saved;
        result
    }

    fn handle_packet(&mut self, packet: Packet) -> Option<BridgeUpdate> {
        match packet {
            Packet::Authenticated {
                player_id,
                session_token,
                permission_level,
                permissions,
                expires_at,
            } => {
                info!(
                    "Authenticated as player #{} ({})",
                    player_id,
                    permission_level.name()
                );
                let session = Session {
                    player_id,
                    session_token,
                    permission_level,
                    permissions,
                    expires_at,
                };
                self.session = Some(session.clone());
                Some(BridgeUpdate::Authenticated(session))
            }
            Packet::AuthFailed { code, message } => {
                warn!("Authentication failed ({}): {}", code.name(), message);
                Some(BridgeUpdate::AuthFailed { code, message })
            }
            Packet::Decision(decision) => {
                if let WirePacket::SessionRevoked { player_id, reason } = &decision.packet {
                    if self.player_id() == Some(*player_id) {
                        warn!("Session revoked: {}", reason);
                        self.session = None;
                        return Some(BridgeUpdate::Revoked {
                            reason: reason.clone(),
                        });
                    }
                }
                Some(BridgeUpdate::Decision(decision))
            }
            Packet::Error { kind, message } => {
                warn!("Server rejected event ({}): {}", kind, message);
                Some(BridgeUpdate::Rejected { kind, message })
            }
            other => {
                warn!("Unexpected packet from server: {:?}", other);
                None
            }
        }
    }

    /// Interactive loop: reads commands from stdin, forwards them as events,
    /// keeps the session alive and logs every decision until stdin closes.
    pub async fn run(&mut self, heartbeat_every: Duration) -> Result<(), Box<dyn std::error::Error>> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut heartbeat_interval = interval(heartbeat_every);
        let mut buffer = vec![0u8; 4096];

        while self.session.is_some() {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => match decode::<Packet>(&buffer[..len]) {
                            Ok(packet) => {
                                if let Some(update) = self.handle_packet(packet) {
                                    report(&update);
                                }
                            }
                            Err(e) => warn!("Failed to decode packet from server: {}", e),
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let Some(player_id) = self.player_id() else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_command(&line, player_id) {
                        Ok(event) => {
                            if let Err(e) = self.send_event(event).await {
                                error!("Error sending event: {}", e);
                            }
                        }
                        Err(e) => warn!("{}", e),
                    }
                },

                _ = heartbeat_interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        error!("Error sending heartbeat: {}", e);
                    }
                },
            }
        }

        self.logout().await
    }
}

fn report(update: &BridgeUpdate) {
    match update {
        BridgeUpdate::Decision(decision) => {
            info!("[{:?}] {:?}", decision.audience, decision.packet);
        }
        BridgeUpdate::Rejected { kind, message } => warn!("{}: {}", kind, message),
        BridgeUpdate::Revoked { reason } => warn!("Session ended: {}", reason),
        other => debug!("{:?}", other),
    }
}

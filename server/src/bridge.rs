//! Seam between the coordination core and the host game.
//!
//! Components post [`AuthoritativeDecision`]s to an [`Outbox`] without
//! blocking; whoever owns the receiving half (the UDP transport, or a test)
//! hands them to a [`HostBridge`].

use crate::utils::lock;
use log::{debug, warn};
use shared::{AuthoritativeDecision, WirePacket};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub trait HostBridge: Send + Sync {
    fn apply_authoritative(&self, decision: &AuthoritativeDecision);
}

pub type DecisionReceiver = mpsc::UnboundedReceiver<AuthoritativeDecision>;

/// Fire-and-forget sender of authoritative decisions.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<AuthoritativeDecision>,
}

impl Outbox {
    pub fn channel() -> (Self, DecisionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, decision: AuthoritativeDecision) {
        let name = decision.packet.name();
        if self.tx.send(decision).is_err() {
            warn!("Dropped {} decision: outbox receiver is gone", name);
        } else {
            debug!("Queued {} decision", name);
        }
    }

    pub fn send_all<I: IntoIterator<Item = AuthoritativeDecision>>(&self, decisions: I) {
        for decision in decisions {
            self.send(decision);
        }
    }
}

/// Collects every decision it is given; used by tests and the CLI bridge.
#[derive(Debug, Clone, Default)]
pub struct RecordingBridge {
    decisions: Arc<Mutex<Vec<AuthoritativeDecision>>>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> Vec<AuthoritativeDecision> {
        lock(&self.decisions).clone()
    }

    pub fn packets(&self) -> Vec<WirePacket> {
        lock(&self.decisions)
            .iter()
            .map(|d| d.packet.clone())
            .collect()
    }

    pub fn count(&self, packet_name: &str) -> usize {
        lock(&self.decisions)
            .iter()
            .filter(|d| d.packet.name() == packet_name)
            .count()
    }

    pub fn clear(&self) {
        lock(&self.decisions).clear();
    }
}

impl HostBridge for RecordingBridge {
    fn apply_authoritative(&self, decision: &AuthoritativeDecision) {
        lock(&self.decisions).push(decision.clone());
    }
}

/// Hands every queued decision to `bridge`; returns how many were delivered.
pub fn drain_into(rx: &mut DecisionReceiver, bridge: &dyn HostBridge) -> usize {
    let mut delivered = 0;
    while let Ok(decision) = rx.try_recv() {
        bridge.apply_authoritative(&decision);
        delivered += 1;
    }
    delivered
}

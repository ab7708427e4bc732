//! Registered collectors and their handshake state.

use crate::error::ArbError;
use crate::protocol::Message;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot};

/// Handshake progress of one collector. Only `Ready` collectors receive fetch commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    NotReady,
    /// `confirm-out` arrived, waiting for `confirm-in`
    OutReady,
    /// `confirm-in` arrived, waiting for `confirm-out`
    InReady,
    Ready,
}

impl CollectorState {
    pub fn on_confirm_in(self) -> CollectorState {
        match self {
            CollectorState::NotReady => CollectorState::InReady,
            CollectorState::OutReady | CollectorState::Ready => CollectorState::Ready,
            CollectorState::InReady => CollectorState::InReady,
        }
    }

    pub fn on_confirm_out(self) -> CollectorState {
        match self {
            CollectorState::NotReady => CollectorState::OutReady,
            CollectorState::InReady | CollectorState::Ready => CollectorState::Ready,
            CollectorState::OutReady => CollectorState::OutReady,
        }
    }

    pub fn is_ready(self) -> bool {
        self == CollectorState::Ready
    }
}

struct CollectorEntry {
    port_in: u16,
    port_out: u16,
    state: CollectorState,
    commands: Option<mpsc::UnboundedSender<Message>>,
    kill_ack: Option<oneshot::Sender<()>>,
}

/// Port assignment handed to a collector during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAssignment {
    pub id: usize,
    pub port_in: u16,
    pub port_out: u16,
}

pub struct CollectorRegistry {
    base_port: u16,
    next_id: AtomicUsize,
    collectors: DashMap<usize, CollectorEntry>,
}

impl CollectorRegistry {
    pub fn new(base_port: u16) -> Self {
        CollectorRegistry {
            base_port,
            next_id: AtomicUsize::new(0),
            collectors: DashMap::new(),
        }
    }

    /// Allocates the next id and its port pair: `in = base + 2 * id`, `out = in + 1`.
    pub fn register(&self) -> Result<PortAssignment, ArbError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let port_in = id
            .checked_mul(2)
            .and_then(|offset| u16::try_from(offset).ok())
            .and_then(|offset| self.base_port.checked_add(offset))
            .filter(|port| *port < u16::MAX)
            .ok_or_else(|| {
                ArbError::ConfigError(format!("no free port pair left for collector {}", id))
            })?;
        let assignment = PortAssignment {
            id,
            port_in,
            port_out: port_in + 1,
        };
        self.collectors.insert(
            id,
            CollectorEntry {
                port_in: assignment.port_in,
                port_out: assignment.port_out,
                state: CollectorState::NotReady,
                commands: None,
                kill_ack: None,
            },
        );
        info!(
            "📝 Registered collector {} on ports {}/{}",
            id, assignment.port_in, assignment.port_out
        );
        Ok(assignment)
    }

    fn transition(&self, id: usize, step: fn(CollectorState) -> CollectorState) -> Option<CollectorState> {
        let mut entry = self.collectors.get_mut(&id)?;
        let before = entry.state;
        entry.state = step(before);
        if !before.is_ready() && entry.state.is_ready() {
            info!(
                "✅ Collector {} ready ({}/{})",
                id, entry.port_in, entry.port_out
            );
        }
        Some(entry.state)
    }

    pub fn confirm_in(&self, id: usize) -> Option<CollectorState> {
        self.transition(id, CollectorState::on_confirm_in)
    }

    pub fn confirm_out(&self, id: usize) -> Option<CollectorState> {
        self.transition(id, CollectorState::on_confirm_out)
    }

    pub fn state(&self, id: usize) -> Option<CollectorState> {
        self.collectors.get(&id).map(|e| e.state)
    }

    /// Installs the queue feeding the collector's inbound channel.
    pub fn attach(&self, id: usize, commands: mpsc::UnboundedSender<Message>) {
        if let Some(mut entry) = self.collectors.get_mut(&id) {
            entry.commands = Some(commands);
        }
    }

    /// Ready collector ids in registration order.
    pub fn ready_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self
            .collectors
            .iter()
            .filter(|e| e.state.is_ready() && e.commands.is_some())
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn ready_count(&self) -> usize {
        self.ready_ids().len()
    }

    pub fn ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.collectors.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    pub fn send(&self, id: usize, message: Message) -> Result<(), ArbError> {
        let entry = self
            .collectors
            .get(&id)
            .ok_or_else(|| ArbError::ChannelClosed(format!("collector {} is gone", id)))?;
        let commands = entry
            .commands
            .as_ref()
            .ok_or_else(|| ArbError::ChannelClosed(format!("collector {} has no inbound channel", id)))?;
        commands
            .send(message)
            .map_err(|_| ArbError::ChannelClosed(format!("collector {} inbound channel closed", id)))
    }

    /// Sends `kill` and returns a receiver that fires when the collector acknowledges it.
    pub fn kill(&self, id: usize) -> Result<oneshot::Receiver<()>, ArbError> {
        let (tx, rx) = oneshot::channel();
        if let Some(mut entry) = self.collectors.get_mut(&id) {
            entry.kill_ack = Some(tx);
        }
        self.send(id, Message::kill())?;
        Ok(rx)
    }

    pub fn acknowledge_kill(&self, id: usize) {
        let ack = self.collectors.get_mut(&id).and_then(|mut e| e.kill_ack.take());
        match ack {
            Some(tx) => {
                let _ = tx.send(());
                debug!("Collector {} acknowledged kill", id);
            }
            None => warn!("Unsolicited kill acknowledgement from collector {}", id),
        }
    }

    /// Called when the collector's inbound channel went away. A collector that is being killed
    /// stays registered so its acknowledgement can still be matched; it just stops receiving
    /// commands. Returns true if the collector was forgotten.
    pub fn disconnect(&self, id: usize) -> bool {
        let killing = match self.collectors.get_mut(&id) {
            Some(mut entry) => {
                entry.commands = None;
                entry.kill_ack.is_some()
            }
            None => return false,
        };
        !killing && self.remove(id)
    }

    /// Forgets the collector; dropping its command queue closes the inbound channel.
    pub fn remove(&self, id: usize) -> bool {
        self.collectors.remove(&id).is_some()
    }
}

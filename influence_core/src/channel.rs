//! Broadcast bus abstraction shared by every client in a session.

use std::io;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use influence_proto::{ClientId, SyncEnvelope, WireError};
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("replication channel disconnected")]
    Disconnected,
    #[error("replication channel i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Best-effort broadcast transport.
///
/// Delivery reaches every peer except the sender. Messages from one sender
/// arrive in send order; nothing is promised across senders.
pub trait ReplicationChannel {
    fn local_id(&self) -> &ClientId;

    /// Fire-and-forget send. Failures are reported but never retried here.
    fn broadcast(&self, envelope: &SyncEnvelope) -> Result<(), ChannelError>;

    /// Next delivered envelope if one is waiting. Never blocks.
    fn try_recv(&self) -> Result<Option<SyncEnvelope>, ChannelError>;
}

impl<C> ReplicationChannel for Box<C>
where
    C: ReplicationChannel + ?Sized,
{
    fn local_id(&self) -> &ClientId {
        (**self).local_id()
    }

    fn broadcast(&self, envelope: &SyncEnvelope) -> Result<(), ChannelError> {
        (**self).broadcast(envelope)
    }

    fn try_recv(&self) -> Result<Option<SyncEnvelope>, ChannelError> {
        (**self).try_recv()
    }
}

/// Random identifier for a freshly connected client.
pub fn generate_client_id() -> ClientId {
    let mut rng = SmallRng::from_entropy();
    ClientId::new(format!("client-{:016x}", rng.gen::<u64>()))
}

struct Peer {
    id: ClientId,
    sender: Sender<SyncEnvelope>,
}

#[derive(Default)]
struct BusState {
    peers: Vec<Peer>,
    taps: Vec<Sender<SyncEnvelope>>,
}

/// In-process bus. Every [`LocalEndpoint`] sees what the others broadcast.
#[derive(Clone, Default)]
pub struct LocalBus {
    state: Arc<Mutex<BusState>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the bus. A previous endpoint with the same id is cut off.
    pub fn connect(&self, id: ClientId) -> LocalEndpoint {
        let (sender, receiver) = unbounded();
        let mut state = self.state.lock();
        state.peers.retain(|peer| peer.id != id);
        state.peers.push(Peer {
            id: id.clone(),
            sender,
        });
        tracing::debug!(
            target: "influence_sync::channel",
            client = %id,
            peers = state.peers.len(),
            "bus.connected"
        );
        LocalEndpoint {
            id,
            bus: self.clone(),
            receiver,
        }
    }

    /// Receives a copy of every envelope on the bus.
    pub fn tap(&self) -> Receiver<SyncEnvelope> {
        let (sender, receiver) = unbounded();
        self.state.lock().taps.push(sender);
        receiver
    }

    pub fn disconnect(&self, id: &ClientId) -> bool {
        let mut state = self.state.lock();
        let before = state.peers.len();
        state.peers.retain(|peer| &peer.id != id);
        before != state.peers.len()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    fn deliver(&self, envelope: &SyncEnvelope) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if !state.peers.iter().any(|peer| peer.id == envelope.sender) {
            return Err(ChannelError::Disconnected);
        }
        state.peers.retain(|peer| {
            if peer.id == envelope.sender {
                return true;
            }
            peer.sender.send(envelope.clone()).is_ok()
        });
        state
            .taps
            .retain(|tap| tap.send(envelope.clone()).is_ok());
        Ok(())
    }
}

/// One client's attachment to a [`LocalBus`].
pub struct LocalEndpoint {
    id: ClientId,
    bus: LocalBus,
    receiver: Receiver<SyncEnvelope>,
}

impl LocalEndpoint {
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }
}

impl ReplicationChannel for LocalEndpoint {
    fn local_id(&self) -> &ClientId {
        &self.id
    }

    fn broadcast(&self, envelope: &SyncEnvelope) -> Result<(), ChannelError> {
        self.bus.deliver(envelope)
    }

    fn try_recv(&self) -> Result<Option<SyncEnvelope>, ChannelError> {
        match self.receiver.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use influence_proto::SyncMessage;

    fn envelope(sender: &ClientId, seq: u64) -> SyncEnvelope {
        SyncEnvelope::new(sender.clone(), seq, SyncMessage::RefreshSignal)
    }

    #[test]
    fn broadcast_skips_sender() {
        let bus = LocalBus::new();
        let gm = bus.connect(ClientId::from("gm"));
        let player = bus.connect(ClientId::from("p1"));

        gm.broadcast(&envelope(gm.local_id(), 1)).expect("send");
        assert!(gm.try_recv().expect("recv").is_none());
        let received = player.try_recv().expect("recv").expect("delivered");
        assert_eq!(received.sender.as_str(), "gm");
    }

    #[test]
    fn per_sender_order_is_kept() {
        let bus = LocalBus::new();
        let gm = bus.connect(ClientId::from("gm"));
        let player = bus.connect(ClientId::from("p1"));
        for seq in 0..5 {
            gm.broadcast(&envelope(gm.local_id(), seq)).expect("send");
        }
        let seqs: Vec<u64> = std::iter::from_fn(|| player.try_recv().ok().flatten())
            .map(|envelope| envelope.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn tap_sees_everything() {
        let bus = LocalBus::new();
        let tap = bus.tap();
        let gm = bus.connect(ClientId::from("gm"));
        gm.broadcast(&envelope(gm.local_id(), 1)).expect("send");
        assert_eq!(tap.try_recv().expect("tapped").seq, 1);
    }

    #[test]
    fn disconnected_endpoint_cannot_send() {
        let bus = LocalBus::new();
        let gm = bus.connect(ClientId::from("gm"));
        let player = bus.connect(ClientId::from("p1"));
        assert!(bus.disconnect(player.local_id()));
        assert!(matches!(
            player.broadcast(&envelope(player.local_id(), 1)),
            Err(ChannelError::Disconnected)
        ));
        assert!(matches!(player.try_recv(), Err(ChannelError::Disconnected)));
        gm.broadcast(&envelope(gm.local_id(), 1)).expect("gm still sends");
        assert_eq!(bus.peer_count(), 1);
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(generate_client_id(), generate_client_id());
    }
}

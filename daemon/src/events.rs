use std::sync::Arc;

use log::trace;
use tokio::sync::broadcast;

use atoll_common::{
    block::Block,
    crypto::{Address, Hash},
};

use crate::p2p::PeerId;

// Capacity of the broadcast channel. Subscribers lagging behind this many
// events lose the oldest ones, which is acceptable for every consumer we
// have (transport rebroadcast, pool pruning, RPC notifications).
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    Included,
    Expired,
    Evicted,
    Replaced,
    Conflict,
}

// The small set of events wiring the components together.
// Processor-emitted events are observed in block application order.
#[derive(Clone, Debug)]
pub enum Event {
    NewBlock {
        block: Arc<Block>,
        id: Hash,
    },
    DeleteBlock {
        block: Arc<Block>,
        id: Hash,
    },
    ValidatorsChanged {
        round: u64,
        validators: Arc<Vec<Address>>,
    },
    BlockFinalized {
        height: u64,
    },
    SyncRequired {
        block: Arc<Block>,
        peer_id: PeerId,
    },
    BroadcastBlock {
        block: Arc<Block>,
    },
    TransactionRemoved {
        id: Hash,
        reason: RemovalReason,
    },
}

// Typed event bus between the named components. Components hold a
// publisher handle, never each other.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    // Publishing never fails: with no subscriber the event is dropped
    pub fn emit(&self, event: Event) {
        if log::log_enabled!(log::Level::Trace) {
            trace!("emitting event {:?}", event);
        }
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

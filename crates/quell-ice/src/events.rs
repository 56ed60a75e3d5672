use crate::candidate::CandidateDescriptor;
use crate::{ComponentId, ComponentState, StreamId};
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Events emitted by the [`IceAgent`](crate::IceAgent)
///
/// `SendData` is the agent's I/O output and must be forwarded to the right
/// socket; everything else is informational and delivered in causal order.
#[derive(Debug)]
pub enum IceEvent {
    /// Send `data` from the local address `source` to `target`
    SendData {
        stream: StreamId,
        component: ComponentId,
        data: Vec<u8>,
        source: SocketAddr,
        target: SocketAddr,
    },

    /// A component's state changed
    ComponentStateChanged {
        stream: StreamId,
        component: ComponentId,
        state: ComponentState,
    },

    /// All scheduled candidate discoveries finished
    GatheringDone,

    /// A new local candidate was discovered
    NewCandidate {
        stream: StreamId,
        candidate: CandidateDescriptor,
    },

    /// A remote peer-reflexive candidate was learned from an inbound check
    NewRemoteCandidate {
        stream: StreamId,
        candidate: CandidateDescriptor,
    },

    /// A pair was nominated and is now the component's selected pair
    NewSelectedPair {
        stream: StreamId,
        component: ComponentId,
        local_foundation: String,
        remote_foundation: String,
    },

    /// The first valid STUN Binding request arrived on this stream
    InitialBindingRequestReceived { stream: StreamId },
}

/// FIFO queue of events, drained by the driver
#[derive(Default)]
pub struct Events {
    events: VecDeque<IceEvent>,
}

impl Events {
    pub fn pop(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    pub fn push(&mut self, event: IceEvent) {
        self.events.push_back(event);
    }
}

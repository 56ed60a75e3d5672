use crate::events::IceEvent;
use crate::stun::{self, StunConfig};
use crate::{ComponentId, StreamId};
use quell_stun_types::attributes::XorMappedAddress;
use quell_stun_types::{Message, TransactionId};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A single server-reflexive discovery: one Binding transaction from one host
/// candidate towards one STUN server.
///
/// Discoveries start unscheduled; the agent fires at most one per pacing tick.
/// Retransmission then runs on the discovery's own timer. A discovery that
/// exhausts its retransmits fails silently, the candidate slot simply never
/// appears.
pub(crate) struct StunServerBinding {
    server: SocketAddr,
    stream: StreamId,
    component: ComponentId,
    /// Host candidate address the request is sent from (and the base of the
    /// resulting server-reflexive candidate)
    base: SocketAddr,
    state: DiscoveryState,
}

enum DiscoveryState {
    Unscheduled,
    InProgress {
        transaction_id: TransactionId,
        stun_request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
    },
    Completed,
    Failed,
}

impl StunServerBinding {
    pub(crate) fn new(
        server: SocketAddr,
        stream: StreamId,
        component: ComponentId,
        base: SocketAddr,
    ) -> Self {
        Self {
            server,
            stream,
            component,
            base,
            state: DiscoveryState::Unscheduled,
        }
    }

    pub(crate) fn stream(&self) -> StreamId {
        self.stream
    }

    pub(crate) fn component(&self) -> ComponentId {
        self.component
    }

    pub(crate) fn base(&self) -> SocketAddr {
        self.base
    }

    pub(crate) fn server(&self) -> SocketAddr {
        self.server
    }

    pub(crate) fn is_unscheduled(&self) -> bool {
        matches!(self.state, DiscoveryState::Unscheduled)
    }

    /// Finished, successfully or not
    pub(crate) fn completed(&self) -> bool {
        matches!(self.state, DiscoveryState::Completed | DiscoveryState::Failed)
    }

    /// Send the initial request. Called at most once, paced by the agent.
    pub(crate) fn start(
        &mut self,
        now: Instant,
        config: &StunConfig,
        on_event: &mut impl FnMut(IceEvent),
    ) {
        debug_assert!(self.is_unscheduled());

        let transaction_id = TransactionId::random();
        let stun_request = stun::make_server_binding_request(transaction_id);

        log::debug!(
            "start srflx discovery from {} towards {}",
            self.base,
            self.server
        );

        on_event(IceEvent::SendData {
            stream: self.stream,
            component: self.component,
            data: stun_request.clone(),
            source: self.base,
            target: self.server,
        });

        self.state = DiscoveryState::InProgress {
            transaction_id,
            stun_request,
            retransmit_at: now + config.retransmit_delta(0),
            retransmits: 0,
        };
    }

    /// Drive the retransmission timer
    pub(crate) fn poll(
        &mut self,
        now: Instant,
        config: &StunConfig,
        on_event: &mut impl FnMut(IceEvent),
    ) {
        let DiscoveryState::InProgress {
            stun_request,
            retransmit_at,
            retransmits,
            ..
        } = &mut self.state
        else {
            return;
        };

        if *retransmit_at > now {
            return;
        }

        if *retransmits >= config.max_retransmits {
            log::debug!(
                "srflx discovery from {} towards {} timed out",
                self.base,
                self.server
            );
            self.state = DiscoveryState::Failed;
            return;
        }

        *retransmits += 1;
        *retransmit_at += config.retransmit_delta(*retransmits);

        on_event(IceEvent::SendData {
            stream: self.stream,
            component: self.component,
            data: stun_request.clone(),
            source: self.base,
            target: self.server,
        });
    }

    pub(crate) fn timeout(&self, now: Instant) -> Option<Duration> {
        match &self.state {
            DiscoveryState::InProgress { retransmit_at, .. } => {
                Some(retransmit_at.saturating_duration_since(now))
            }
            // Unscheduled discoveries wait for a pacing slot, which the
            // agent's tick timer covers
            _ => None,
        }
    }

    pub(crate) fn wants_stun_response(&self, transaction_id: TransactionId) -> bool {
        matches!(
            self.state,
            DiscoveryState::InProgress { transaction_id: tid, .. } if tid == transaction_id
        )
    }

    /// Process the server's Binding response, returning the mapped address
    pub(crate) fn receive_stun_response(&mut self, stun_msg: &Message) -> Option<SocketAddr> {
        let mapped = match stun_msg.attribute::<XorMappedAddress>() {
            Some(Ok(mapped)) => Some(mapped.0),
            _ => None,
        };

        self.state = if mapped.is_some() {
            DiscoveryState::Completed
        } else {
            // Response without a usable mapped address, nothing to learn
            DiscoveryState::Failed
        };

        mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> StunServerBinding {
        StunServerBinding::new(
            "192.0.2.1:3478".parse().unwrap(),
            1,
            1,
            "10.0.0.1:5000".parse().unwrap(),
        )
    }

    #[test]
    fn retransmits_are_bounded() {
        let config = StunConfig::new();
        let mut b = binding();
        let mut sent = Vec::new();

        let mut now = Instant::now();
        b.start(now, &config, &mut |ev| sent.push(ev));

        // Drive time far past the full backoff schedule
        for _ in 0..40 {
            now += Duration::from_millis(1600);
            b.poll(now, &config, &mut |ev| sent.push(ev));
        }

        assert!(b.completed());
        // Rc transmissions total: the initial request + 6 retransmits
        assert_eq!(sent.len(), 7);
    }

    #[test]
    fn transaction_id_is_matched() {
        let config = StunConfig::new();
        let mut b = binding();
        let mut requests = Vec::new();

        b.start(Instant::now(), &config, &mut |ev| {
            if let IceEvent::SendData { data, .. } = ev {
                requests.push(data);
            }
        });

        let msg = Message::parse(requests.pop().unwrap()).unwrap();
        assert!(b.wants_stun_response(msg.transaction_id()));
        assert!(!b.wants_stun_response(TransactionId::random()));
    }
}

#![deny(unreachable_pub, unsafe_code)]

//! sans io implementation of an ICE agent
//!
//! The [`IceAgent`] holds the full connectivity establishment state machine
//! for any number of media streams: host & server-reflexive candidate
//! gathering, STUN connectivity checks, nomination and keepalive. It performs
//! no I/O of its own; datagrams go in through [`IceAgent::receive`], time
//! through [`IceAgent::poll`], and everything to be sent comes back out as
//! [`IceEvent::SendData`]. [`AsyncIceAgent`] wraps it together with UDP
//! sockets for tokio based applications.

use slotmap::SlotMap;
use std::cmp::max;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;

use quell_stun_types::attributes::Fingerprint;
use quell_stun_types::{is_stun_message, Class, IsStunMessageInfo, Message};

mod candidate;
mod checklist;
mod driver;
mod events;
mod gather;
mod stream;
mod stun;

pub use candidate::{CandidateDescriptor, CandidateKind};
pub use driver::{AsyncIceAgent, SocketFactory, UdpSocketFactory};
pub use events::{Events, IceEvent};
pub use stream::{ComponentId, ComponentState, IceCredentials, StreamId};

use candidate::{
    candidate_priority, compute_foundation, Candidate, LocalCandidateId, RemoteCandidateId,
};
use checklist::CandidatePair;
use gather::StunServerBinding;
use stream::Stream;
use stun::StunConfig;

/// A datagram received on a component's UDP socket
pub struct ReceivedPkt {
    /// The received data
    pub data: Vec<u8>,
    /// Source address of the datagram
    pub source: SocketAddr,
    /// Local socket address the datagram arrived on
    pub destination: SocketAddr,
    /// Stream the socket belongs to
    pub stream: StreamId,
    /// Component the socket belongs to
    pub component: ComponentId,
}

/// Agent configuration, assembled before [`IceAgent::new`]
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// STUN server used for server-reflexive candidate discovery
    pub stun_server: Option<IpAddr>,
    pub stun_server_port: u16,

    /// Reserved; relay allocation is not implemented
    pub turn_server: Option<IpAddr>,
    pub turn_server_port: u16,

    /// Initial ICE role. May flip while resolving a role conflict.
    pub controlling_mode: bool,

    /// A full agent gathers reflexive candidates and sends connectivity
    /// checks. When unset the agent only answers inbound checks.
    pub full_mode: bool,

    /// Pacing interval Ta between outgoing transactions, at least 1ms
    pub stun_pacing_timer: Duration,

    /// Interval of the keepalive indications on selected pairs
    pub keepalive_interval: Duration,

    /// Cap on the check list length
    pub max_pairs: usize,

    /// Cap on remote candidates per component
    pub max_remote_candidates: usize,

    /// Fixed role tie-breaker, mainly useful for reproducible tests. Drawn
    /// randomly when unset.
    pub tie_breaker: Option<u64>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_server: None,
            stun_server_port: 3478,
            turn_server: None,
            turn_server_port: 3478,
            controlling_mode: true,
            full_mode: true,
            stun_pacing_timer: Duration::from_millis(20),
            keepalive_interval: Duration::from_secs(15),
            max_pairs: 100,
            max_remote_candidates: 25,
            tie_breaker: None,
        }
    }
}

impl IceConfig {
    fn ta(&self) -> Duration {
        max(self.stun_pacing_timer, Duration::from_millis(1))
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("unknown stream or component")]
    UnknownComponent,
    #[error("component has no selected pair yet")]
    NoSelectedPair,
}

/// The ICE agent state machine
pub struct IceAgent {
    config: IceConfig,
    stun_config: StunConfig,

    local_addresses: Vec<IpAddr>,

    streams: Vec<Stream>,
    next_stream_id: StreamId,

    local_candidates: SlotMap<LocalCandidateId, Candidate>,
    remote_candidates: SlotMap<RemoteCandidateId, Candidate>,

    stun_bindings: Vec<StunServerBinding>,
    gathering_done_emitted: bool,

    is_controlling: bool,
    control_tie_breaker: u64,

    pairs: Vec<CandidatePair>,
    triggered_check_queue: VecDeque<(LocalCandidateId, RemoteCandidateId)>,

    last_ta_trigger: Option<Instant>,
    next_keepalive_at: Option<Instant>,

    pending_events: VecDeque<IceEvent>,
}

impl IceAgent {
    pub fn new(config: IceConfig) -> Self {
        IceAgent {
            is_controlling: config.controlling_mode,
            control_tie_breaker: config.tie_breaker.unwrap_or_else(rand::random),
            config,
            stun_config: StunConfig::new(),
            local_addresses: Vec::new(),
            streams: Vec::new(),
            next_stream_id: 1,
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            stun_bindings: Vec::new(),
            gathering_done_emitted: false,
            pairs: Vec::new(),
            triggered_check_queue: VecDeque::new(),
            last_ta_trigger: None,
            next_keepalive_at: None,
            pending_events: VecDeque::new(),
        }
    }

    /// Inform the agent of an address a local network interface is bound to.
    /// At least one local address must be known before adding streams.
    pub fn add_local_address(&mut self, addr: IpAddr) {
        if !self.local_addresses.contains(&addr) {
            self.local_addresses.push(addr);
        }
    }

    pub fn local_addresses(&self) -> &[IpAddr] {
        &self.local_addresses
    }

    /// Create a stream with `n_components` components. Returns the new
    /// stream's id, or 0 on failure.
    pub fn add_stream(&mut self, n_components: ComponentId) -> StreamId {
        if n_components == 0 {
            return 0;
        }

        if self.local_addresses.is_empty() {
            log::warn!("add_stream called before any local address was added");
            return 0;
        }

        let id = self.next_stream_id;
        self.next_stream_id += 1;

        self.streams.push(Stream::new(id, n_components));

        log::debug!("added stream {id} with {n_components} components");

        id
    }

    /// Remove a stream, synchronously reclaiming its pairs, discoveries and
    /// candidates
    pub fn remove_stream(&mut self, stream: StreamId) {
        let Some(i) = self.streams.iter().position(|s| s.id == stream) else {
            return;
        };

        self.pairs.retain(|p| p.stream != stream);
        self.local_candidates.retain(|_, c| c.stream != stream);
        self.remote_candidates.retain(|_, c| c.stream != stream);
        self.stun_bindings.retain(|b| b.stream() != stream);

        let pairs = &self.pairs;
        self.triggered_check_queue
            .retain(|&(l, r)| pairs.iter().any(|p| p.local == l && p.remote == r));

        self.streams.remove(i);

        if self.streams.is_empty() {
            self.next_keepalive_at = None;
        }
    }

    /// Register a bound socket address as a host candidate of a component.
    /// Schedules server-reflexive discovery from it when a STUN server is
    /// configured.
    pub fn add_host_candidate(
        &mut self,
        stream: StreamId,
        component: ComponentId,
        addr: SocketAddr,
    ) -> bool {
        let known_component = self
            .streams
            .iter()
            .find(|s| s.id == stream)
            .is_some_and(|s| s.component(component).is_some());

        if !known_component {
            return false;
        }

        let already_exists = self.local_candidates.values().any(|c| {
            c.stream == stream
                && c.component == component
                && c.kind == CandidateKind::Host
                && c.addr == addr
        });

        if already_exists {
            return true;
        }

        log::debug!("add local candidate host({addr}) stream={stream} component={component}");

        let id = self.local_candidates.insert(Candidate {
            stream,
            component,
            kind: CandidateKind::Host,
            addr,
            base: addr,
            priority: candidate_priority(
                CandidateKind::Host,
                self.local_preference(addr.ip()),
                component,
            ),
            foundation: compute_foundation(CandidateKind::Host, addr.ip(), None, "udp"),
        });

        self.pending_events.push_back(IceEvent::NewCandidate {
            stream,
            candidate: self.local_candidates[id].to_descriptor(),
        });

        self.set_component_state(stream, component, ComponentState::Gathering);

        if self.config.full_mode {
            if let Some(server_ip) = self.config.stun_server {
                let server = SocketAddr::new(server_ip, self.config.stun_server_port);

                let already_scheduled = self.stun_bindings.iter().any(|b| {
                    b.stream() == stream
                        && b.component() == component
                        && b.base() == addr
                        && b.server() == server
                });

                if !already_scheduled {
                    self.stun_bindings
                        .push(StunServerBinding::new(server, stream, component, addr));
                    self.gathering_done_emitted = false;
                }
            }
        }

        self.form_pairs();

        true
    }

    /// Local candidates of a stream suitable for signalling to the peer.
    /// Peer-reflexive candidates are never signalled.
    pub fn candidates(&self, stream: StreamId) -> Vec<CandidateDescriptor> {
        self.local_candidates
            .values()
            .filter(|c| c.stream == stream)
            .filter(|c| {
                matches!(
                    c.kind,
                    CandidateKind::Host | CandidateKind::ServerReflexive
                )
            })
            .map(Candidate::to_descriptor)
            .collect()
    }

    pub fn local_credentials(&self, stream: StreamId) -> Option<&IceCredentials> {
        self.streams
            .iter()
            .find(|s| s.id == stream)
            .map(|s| &s.local_credentials)
    }

    pub fn set_remote_credentials(&mut self, stream: StreamId, ufrag: &str, pwd: &str) -> bool {
        let Some(stream) = self.streams.iter_mut().find(|s| s.id == stream) else {
            return false;
        };

        stream.remote_credentials = Some(IceCredentials {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        });

        true
    }

    /// Install a peer candidate received over the signalling channel
    pub fn add_remote_candidate(
        &mut self,
        stream: StreamId,
        component: ComponentId,
        candidate: &CandidateDescriptor,
    ) -> bool {
        let known_component = self
            .streams
            .iter()
            .find(|s| s.id == stream)
            .is_some_and(|s| s.component(component).is_some());

        if !known_component {
            return false;
        }

        if !candidate.transport.eq_ignore_ascii_case("udp") {
            log::debug!("discarding remote candidate with unsupported transport");
            return false;
        }

        if !matches!(
            candidate.kind,
            CandidateKind::Host | CandidateKind::ServerReflexive
        ) {
            log::debug!("discarding remote candidate of kind {}", candidate.kind);
            return false;
        }

        let already_exists = self
            .remote_candidates
            .values()
            .any(|c| c.stream == stream && c.component == component && c.addr == candidate.addr);

        if already_exists {
            return true;
        }

        let count = self
            .remote_candidates
            .values()
            .filter(|c| c.stream == stream && c.component == component)
            .count();

        if count >= self.config.max_remote_candidates {
            log::debug!("remote candidate cap reached for stream={stream} component={component}");
            return false;
        }

        self.remote_candidates.insert(Candidate {
            stream,
            component,
            kind: candidate.kind,
            addr: candidate.addr,
            base: candidate.related_addr.unwrap_or(candidate.addr),
            priority: candidate.priority,
            foundation: candidate.foundation.clone(),
        });

        self.form_pairs();

        true
    }

    /// Install a whole remote candidate list, returning the number of
    /// accepted candidates or -1 if the component does not exist
    pub fn set_remote_candidates(
        &mut self,
        stream: StreamId,
        component: ComponentId,
        candidates: &[CandidateDescriptor],
    ) -> i32 {
        let known_component = self
            .streams
            .iter()
            .find(|s| s.id == stream)
            .is_some_and(|s| s.component(component).is_some());

        if !known_component {
            return -1;
        }

        candidates
            .iter()
            .filter(|c| self.add_remote_candidate(stream, component, c))
            .count() as i32
    }

    pub fn is_controlling(&self) -> bool {
        self.is_controlling
    }

    /// Change the agent's role. Check-list ordering depends on it, so all
    /// pair priorities are recomputed.
    pub fn set_controlling(&mut self, controlling: bool) {
        if self.is_controlling != controlling {
            self.is_controlling = controlling;
            self.recompute_pair_priorities();
        }
    }

    /// Update the STUN server used for discoveries scheduled from here on
    pub fn set_stun_server(&mut self, server: Option<IpAddr>, port: u16) {
        self.config.stun_server = server;
        self.config.stun_server_port = port;
    }

    pub fn component_state(&self, stream: StreamId, component: ComponentId) -> Option<ComponentState> {
        self.streams
            .iter()
            .find(|s| s.id == stream)?
            .component(component)
            .map(|c| c.state)
    }

    /// The selected (local, remote) pair of a component, once nominated
    pub fn selected_pair(
        &self,
        stream: StreamId,
        component: ComponentId,
    ) -> Option<(CandidateDescriptor, CandidateDescriptor)> {
        let (local, remote) = self
            .streams
            .iter()
            .find(|s| s.id == stream)?
            .component(component)?
            .selected_pair?;

        Some((
            self.local_candidates[local].to_descriptor(),
            self.remote_candidates[remote].to_descriptor(),
        ))
    }

    /// Send media over the component's selected pair. The bytes are handed
    /// back through [`IceEvent::SendData`] targeting the selected remote
    /// candidate.
    pub fn send(
        &mut self,
        stream: StreamId,
        component: ComponentId,
        data: &[u8],
        mut on_event: impl FnMut(IceEvent),
    ) -> Result<usize, SendError> {
        let (local, remote) = {
            let stream = self
                .streams
                .iter_mut()
                .find(|s| s.id == stream)
                .ok_or(SendError::UnknownComponent)?;

            let component = stream
                .component_mut(component)
                .ok_or(SendError::UnknownComponent)?;

            let selected = component.selected_pair.ok_or(SendError::NoSelectedPair)?;
            component.media_after_tick = true;
            selected
        };

        on_event(IceEvent::SendData {
            stream,
            component,
            data: data.to_vec(),
            source: self.local_candidates[local].base,
            target: self.remote_candidates[remote].addr,
        });

        Ok(data.len())
    }

    /// Receive a datagram for this agent. Media (and anything else that is
    /// not STUN) is returned to the caller untouched; STUN messages are
    /// consumed by the agent.
    pub fn receive(
        &mut self,
        pkt: ReceivedPkt,
        mut on_event: impl FnMut(IceEvent),
    ) -> Option<ReceivedPkt> {
        // RTP & RTCP packets always carry version 2 in the top bits
        if pkt.data.first().is_some_and(|b| b & 0xC0 == 0x80) {
            return Some(pkt);
        }

        if let IsStunMessageInfo::No = is_stun_message(&pkt.data) {
            return Some(pkt);
        }

        let stun_msg = match Message::parse(pkt.data.clone()) {
            Ok(stun_msg) => stun_msg,
            Err(e) => {
                log::debug!("received datagram which is not quite STUN, {e}");
                return Some(pkt);
            }
        };

        let passed_fingerprint_check = stun_msg
            .attribute::<Fingerprint>()
            .is_some_and(|r| r.is_ok());

        if !passed_fingerprint_check {
            log::trace!(
                "incoming STUN {:?} failed fingerprint check, discarding",
                stun_msg.class()
            );
            return None;
        }

        match stun_msg.class() {
            Class::Request => self.receive_stun_request(&pkt, stun_msg, &mut on_event),
            Class::Indication => { /* peer keepalive, no reply required */ }
            Class::Success => self.receive_stun_success(&pkt, stun_msg),
            Class::Error => self.receive_stun_error(stun_msg),
        }

        self.drain_events(&mut on_event);

        None
    }

    /// Drive the ICE agent forward. Must be called whenever the duration
    /// returned by [`timeout`](IceAgent::timeout) elapsed.
    pub fn poll(&mut self, now: Instant, mut on_event: impl FnMut(IceEvent)) {
        self.poll_keepalive(now, &mut on_event);

        // Discovery retransmissions run on their own timers
        for binding in &mut self.stun_bindings {
            binding.poll(now, &self.stun_config, &mut on_event);
        }

        self.maybe_emit_gathering_done();
        self.update_component_states();

        let ta = self.config.ta();
        let within_pacing_window = self
            .last_ta_trigger
            .is_some_and(|it| it + ta > now);

        if !within_pacing_window {
            self.last_ta_trigger = Some(now);

            // One transmission per tick: an unscheduled discovery takes the
            // slot, otherwise the check scheduler picks an action
            if let Some(i) = self.stun_bindings.iter().position(|b| b.is_unscheduled()) {
                let (bindings, stun_config) = (&mut self.stun_bindings, &self.stun_config);
                bindings[i].start(now, stun_config, &mut on_event);
            } else if self.config.full_mode {
                self.tick_checks(now, &mut on_event);
            }

            self.maybe_emit_gathering_done();
            self.update_component_states();
        }

        self.drain_events(&mut on_event);
    }

    /// Returns the duration after which [`poll`](IceAgent::poll) must be
    /// called again, or `None` when the agent is idle
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        if !self.pending_events.is_empty() {
            return Some(Duration::ZERO);
        }

        let mut timeout = None;

        if self.has_paced_work() {
            let deadline = self
                .last_ta_trigger
                .map(|it| (it + self.config.ta()).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);

            timeout = opt_min(timeout, Some(deadline));
        }

        for binding in &self.stun_bindings {
            timeout = opt_min(timeout, binding.timeout(now));
        }

        match self.next_keepalive_at {
            Some(at) => timeout = opt_min(timeout, Some(at.saturating_duration_since(now))),
            None if self.any_component_ready() => {
                // Next poll arms the keepalive timer
                timeout = opt_min(timeout, Some(Duration::ZERO));
            }
            None => {}
        }

        timeout
    }

    // ==== internal ====

    fn drain_events(&mut self, on_event: &mut impl FnMut(IceEvent)) {
        while let Some(event) = self.pending_events.pop_front() {
            on_event(event);
        }
    }

    /// Stable preference of a local interface address; the first registered
    /// address gets the full 65535
    pub(crate) fn local_preference(&self, ip: IpAddr) -> u32 {
        match self.local_addresses.iter().position(|&a| a == ip) {
            Some(i) => 65535u32.saturating_sub(i as u32),
            None => 65535,
        }
    }

    pub(crate) fn stream_has_remote_credentials(&self, stream: StreamId) -> bool {
        self.streams
            .iter()
            .find(|s| s.id == stream)
            .is_some_and(|s| s.remote_credentials.is_some())
    }

    fn any_component_ready(&self) -> bool {
        self.streams
            .iter()
            .any(|s| s.components.iter().any(|c| c.state == ComponentState::Ready))
    }

    /// Whether anything still competes for Ta pacing slots
    fn has_paced_work(&self) -> bool {
        if self.stun_bindings.iter().any(|b| b.is_unscheduled()) {
            return true;
        }

        if !self.config.full_mode {
            return false;
        }

        if !self.triggered_check_queue.is_empty() {
            return true;
        }

        let check_pending = self.pairs.iter().any(|p| {
            matches!(
                p.state,
                checklist::CandidatePairState::Waiting
                    | checklist::CandidatePairState::InProgress { .. }
            ) && self.stream_has_remote_credentials(p.stream)
        });

        if check_pending {
            return true;
        }

        // A nomination is still outstanding
        self.is_controlling
            && self.streams.iter().any(|s| {
                s.components.iter().any(|c| {
                    let has_nominated = self
                        .pairs
                        .iter()
                        .any(|p| p.stream == s.id && p.component == c.id && p.nominated);

                    let has_succeeded = self.pairs.iter().any(|p| {
                        p.stream == s.id
                            && p.component == c.id
                            && p.state == checklist::CandidatePairState::Succeeded
                    });

                    has_succeeded && !has_nominated
                })
            })
    }

    fn maybe_emit_gathering_done(&mut self) {
        if self.gathering_done_emitted || self.streams.is_empty() {
            return;
        }

        if self.stun_bindings.iter().all(|b| b.completed()) {
            log::debug!("candidate gathering done");
            self.gathering_done_emitted = true;
            self.pending_events.push_back(IceEvent::GatheringDone);
        }
    }

    fn poll_keepalive(&mut self, now: Instant, on_event: &mut impl FnMut(IceEvent)) {
        let Some(at) = self.next_keepalive_at else {
            if self.any_component_ready() {
                self.next_keepalive_at = Some(now + self.config.keepalive_interval);
            }
            return;
        };

        if at > now {
            return;
        }

        for stream_idx in 0..self.streams.len() {
            let stream_id = self.streams[stream_idx].id;

            for component_idx in 0..self.streams[stream_idx].components.len() {
                let (component_id, ready, sent_media, selected) = {
                    let component = &mut self.streams[stream_idx].components[component_idx];
                    let info = (
                        component.id,
                        component.state == ComponentState::Ready,
                        component.media_after_tick,
                        component.selected_pair,
                    );
                    component.media_after_tick = false;
                    info
                };

                let (Some((local, remote)), true, false) = (selected, ready, sent_media) else {
                    continue;
                };

                log::trace!("keepalive indication for stream={stream_id} component={component_id}");

                on_event(IceEvent::SendData {
                    stream: stream_id,
                    component: component_id,
                    data: stun::make_binding_indication(),
                    source: self.local_candidates[local].base,
                    target: self.remote_candidates[remote].addr,
                });
            }
        }

        self.next_keepalive_at = Some(now + self.config.keepalive_interval);
    }

    pub(crate) fn add_server_reflexive_candidate(
        &mut self,
        stream: StreamId,
        component: ComponentId,
        base: SocketAddr,
        server: SocketAddr,
        mapped: SocketAddr,
    ) {
        let already_exists = self.local_candidates.values().any(|c| {
            c.stream == stream && c.component == component && c.addr == mapped && c.base == base
        });

        if already_exists {
            return;
        }

        log::debug!(
            "add local candidate srflx(base:{base}, addr:{mapped}) stream={stream} component={component}"
        );

        let id = self.local_candidates.insert(Candidate {
            stream,
            component,
            kind: CandidateKind::ServerReflexive,
            addr: mapped,
            base,
            priority: candidate_priority(
                CandidateKind::ServerReflexive,
                self.local_preference(base.ip()),
                component,
            ),
            foundation: compute_foundation(
                CandidateKind::ServerReflexive,
                base.ip(),
                Some(server.ip()),
                "udp",
            ),
        });

        self.pending_events.push_back(IceEvent::NewCandidate {
            stream,
            candidate: self.local_candidates[id].to_descriptor(),
        });

        self.form_pairs();
    }

    /// A Binding response revealed a mapped address we did not know about
    pub(crate) fn add_peer_reflexive_local_candidate(
        &mut self,
        stream: StreamId,
        component: ComponentId,
        base: SocketAddr,
        mapped: SocketAddr,
    ) -> LocalCandidateId {
        log::debug!(
            "learned local peer-reflexive candidate {mapped} (base {base}) stream={stream} component={component}"
        );

        let id = self.local_candidates.insert(Candidate {
            stream,
            component,
            kind: CandidateKind::PeerReflexive,
            addr: mapped,
            base,
            priority: candidate_priority(
                CandidateKind::PeerReflexive,
                self.local_preference(base.ip()),
                component,
            ),
            foundation: compute_foundation(CandidateKind::PeerReflexive, base.ip(), None, "udp"),
        });

        self.pending_events.push_back(IceEvent::NewCandidate {
            stream,
            candidate: self.local_candidates[id].to_descriptor(),
        });

        id
    }

    fn set_component_state(
        &mut self,
        stream: StreamId,
        component: ComponentId,
        state: ComponentState,
    ) {
        let Some(c) = self
            .streams
            .iter_mut()
            .find(|s| s.id == stream)
            .and_then(|s| s.component_mut(component))
        else {
            return;
        };

        if c.state == state {
            return;
        }

        log::debug!("component state stream={stream} component={component}: {:?} -> {state:?}", c.state);

        c.state = state;

        self.pending_events.push_back(IceEvent::ComponentStateChanged {
            stream,
            component,
            state,
        });
    }

    /// Recompute every component's state & selected pair from the check list
    pub(crate) fn update_component_states(&mut self) {
        for stream_idx in 0..self.streams.len() {
            let stream_id = self.streams[stream_idx].id;
            let has_remote_credentials = self.streams[stream_idx].remote_credentials.is_some();

            for component_idx in 0..self.streams[stream_idx].components.len() {
                let component_id = self.streams[stream_idx].components[component_idx].id;

                let mut any = false;
                let mut any_in_progress = false;
                let mut any_succeeded = false;
                let mut all_failed = true;
                let mut best_nominated: Option<(u64, (LocalCandidateId, RemoteCandidateId))> =
                    None;

                for pair in &self.pairs {
                    if pair.stream != stream_id || pair.component != component_id {
                        continue;
                    }

                    any = true;

                    use checklist::CandidatePairState::*;

                    match &pair.state {
                        InProgress { .. } => any_in_progress = true,
                        Succeeded => any_succeeded = true,
                        _ => {}
                    }

                    if pair.state != Failed {
                        all_failed = false;
                    }

                    let selectable = pair.nominated
                        && (pair.state == Succeeded || !self.config.full_mode);

                    if selectable && best_nominated.is_none_or(|(p, _)| pair.priority > p) {
                        best_nominated = Some((pair.priority, (pair.local, pair.remote)));
                    }
                }

                if let Some((_, selected)) = best_nominated {
                    let changed = {
                        let component =
                            &mut self.streams[stream_idx].components[component_idx];
                        let changed = component.selected_pair != Some(selected);
                        component.selected_pair = Some(selected);
                        changed
                    };

                    if changed {
                        self.pending_events.push_back(IceEvent::NewSelectedPair {
                            stream: stream_id,
                            component: component_id,
                            local_foundation: self.local_candidates[selected.0]
                                .foundation
                                .clone(),
                            remote_foundation: self.remote_candidates[selected.1]
                                .foundation
                                .clone(),
                        });
                    }
                }

                let discovery_pending = self
                    .stun_bindings
                    .iter()
                    .any(|b| b.stream() == stream_id && b.component() == component_id && !b.completed());

                let current = self.streams[stream_idx].components[component_idx].state;

                let new_state = if best_nominated.is_some() {
                    ComponentState::Ready
                } else if any_succeeded {
                    ComponentState::Connected
                } else if any_in_progress {
                    ComponentState::Connecting
                } else if any && all_failed && has_remote_credentials && !discovery_pending {
                    ComponentState::Failed
                } else {
                    current
                };

                if new_state != current {
                    self.set_component_state(stream_id, component_id, new_state);
                }
            }
        }
    }
}

fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(a.min(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> IceAgent {
        let mut agent = IceAgent::new(IceConfig::default());
        agent.add_local_address("10.0.0.1".parse().unwrap());
        agent
    }

    fn remote(addr: &str, priority: u32, foundation: &str) -> CandidateDescriptor {
        CandidateDescriptor {
            foundation: foundation.into(),
            component: 1,
            transport: "udp".into(),
            priority,
            addr: addr.parse().unwrap(),
            kind: CandidateKind::Host,
            related_addr: None,
        }
    }

    #[test]
    fn add_stream_requires_local_address() {
        let mut agent = IceAgent::new(IceConfig::default());
        assert_eq!(agent.add_stream(1), 0);

        agent.add_local_address("10.0.0.1".parse().unwrap());
        assert_eq!(agent.add_stream(1), 1);
        assert_eq!(agent.add_stream(2), 2);
    }

    #[test]
    fn stream_credentials_are_unique() {
        let mut agent = agent();
        let a = agent.add_stream(1);
        let b = agent.add_stream(1);

        let creds_a = agent.local_credentials(a).unwrap().clone();
        let creds_b = agent.local_credentials(b).unwrap().clone();

        assert_eq!(creds_a.ufrag.len(), 8);
        assert_eq!(creds_a.pwd.len(), 32);
        assert_ne!(creds_a, creds_b);

        assert!(agent.local_credentials(99).is_none());
    }

    #[test]
    fn check_list_is_sorted_descending() {
        let mut agent = agent();
        let stream = agent.add_stream(1);

        agent.add_host_candidate(stream, 1, "10.0.0.1:5000".parse().unwrap());
        agent.set_remote_credentials(stream, "ufrag", "pwd");

        agent.add_remote_candidate(stream, 1, &remote("192.0.2.1:1000", 100, "a"));
        agent.add_remote_candidate(stream, 1, &remote("192.0.2.2:1000", 2_113_937_151, "b"));
        agent.add_remote_candidate(stream, 1, &remote("192.0.2.3:1000", 5000, "c"));

        assert_eq!(agent.pairs.len(), 3);
        assert!(agent
            .pairs
            .windows(2)
            .all(|w| w[0].priority > w[1].priority));
    }

    #[test]
    fn redundant_pairs_are_pruned() {
        let mut agent = agent();
        let stream = agent.add_stream(1);

        let host: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        agent.add_host_candidate(stream, 1, host);

        // Server-reflexive candidate based on the same host socket
        agent.add_server_reflexive_candidate(
            stream,
            1,
            host,
            "192.0.2.1:3478".parse().unwrap(),
            "198.51.100.5:40000".parse().unwrap(),
        );

        agent.set_remote_credentials(stream, "ufrag", "pwd");
        agent.add_remote_candidate(stream, 1, &remote("192.0.2.7:1000", 100, "a"));

        // The srflx pair shares (base, remote addr) with the higher-priority
        // host pair and must be pruned
        assert_eq!(agent.pairs.len(), 1);
        assert_eq!(
            agent.local_candidates[agent.pairs[0].local].kind,
            CandidateKind::Host
        );
    }

    #[test]
    fn one_waiting_pair_per_foundation_group() {
        let mut agent = agent();
        agent.add_local_address("10.0.0.2".parse().unwrap());
        let stream = agent.add_stream(2);

        for component in [1, 2] {
            agent.add_host_candidate(
                stream,
                component,
                format!("10.0.0.1:500{component}").parse().unwrap(),
            );
            agent.add_host_candidate(
                stream,
                component,
                format!("10.0.0.2:500{component}").parse().unwrap(),
            );
        }

        agent.set_remote_credentials(stream, "ufrag", "pwd");
        for component in [1, 2] {
            let mut c = remote("192.0.2.1:1000", 100, "a");
            c.component = component;
            agent.add_remote_candidate(stream, component, &c);
        }

        assert_eq!(agent.pairs.len(), 4);

        // Both local host candidates have distinct foundations (different
        // bases), and each group spans two components with exactly one
        // initially unfrozen pair, on the lowest component id
        let waiting: Vec<_> = agent
            .pairs
            .iter()
            .filter(|p| p.state == checklist::CandidatePairState::Waiting)
            .collect();

        assert_eq!(waiting.len(), 2);
        assert!(waiting.iter().all(|p| p.component == 1));
    }

    #[test]
    fn send_without_selected_pair_fails() {
        let mut agent = agent();
        let stream = agent.add_stream(1);

        assert_eq!(
            agent.send(stream, 1, b"media", |_| {}),
            Err(SendError::NoSelectedPair)
        );
        assert_eq!(
            agent.send(stream, 7, b"media", |_| {}),
            Err(SendError::UnknownComponent)
        );
    }

    #[test]
    fn media_passthrough() {
        let mut agent = agent();
        let stream = agent.add_stream(1);

        let pkt = ReceivedPkt {
            data: vec![0x80, 1, 2, 3],
            source: "192.0.2.1:1000".parse().unwrap(),
            destination: "10.0.0.1:5000".parse().unwrap(),
            stream,
            component: 1,
        };

        let media = agent.receive(pkt, |_| {});
        assert!(media.is_some());

        // Random junk that is neither RTP nor STUN is handed back as well
        let junk = ReceivedPkt {
            data: vec![0x01, 2, 3],
            source: "192.0.2.1:1000".parse().unwrap(),
            destination: "10.0.0.1:5000".parse().unwrap(),
            stream,
            component: 1,
        };

        assert!(agent.receive(junk, |_| {}).is_some());
    }

    #[test]
    fn gathering_done_fires_once_for_host_only() {
        let mut agent = agent();
        let stream = agent.add_stream(1);
        agent.add_host_candidate(stream, 1, "10.0.0.1:5000".parse().unwrap());

        let mut events = Vec::new();
        let now = Instant::now();
        agent.poll(now, |ev| events.push(ev));
        agent.poll(now + Duration::from_millis(30), |ev| events.push(ev));

        let gathering_done = events
            .iter()
            .filter(|ev| matches!(ev, IceEvent::GatheringDone))
            .count();

        assert_eq!(gathering_done, 1);
    }
}

use crate::candidate::{
    candidate_priority, peer_reflexive_foundation, Candidate, CandidateKind, DisplayPair,
    LocalCandidateId, RemoteCandidateId,
};
use crate::events::IceEvent;
use crate::stun;
use crate::{IceAgent, ReceivedPkt};
use quell_stun_types::attributes::{
    ErrorCode, IceControlled, IceControlling, KeyedAttribute, MessageIntegrity, Priority,
    UseCandidate, Username, XorMappedAddress,
};
use quell_stun_types::{Message, TransactionId};
use std::cmp::{max, min};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

pub(crate) struct CandidatePair {
    pub(crate) local: LocalCandidateId,
    pub(crate) remote: RemoteCandidateId,
    pub(crate) stream: crate::StreamId,
    pub(crate) component: crate::ComponentId,
    pub(crate) priority: u64,
    pub(crate) state: CandidatePairState,

    // Nominated by the peer
    pub(crate) received_use_candidate: bool,
    // Nominated by us
    pub(crate) nominated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CandidatePairState {
    /// Waiting for its foundation group to produce a first result
    Frozen,

    /// A check can be sent for this pair
    Waiting,

    /// A check has been sent for this pair and the transaction is in progress
    InProgress {
        transaction_id: TransactionId,
        stun_request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
        source: SocketAddr,
        target: SocketAddr,
        /// An inbound check superseded this transaction; the next retransmit
        /// turns into a triggered check instead
        canceled: bool,
    },

    /// A check succeeded for this pair
    Succeeded,

    /// All retransmissions were exhausted or the peer answered with an error
    Failed,
}

impl CandidatePair {
    pub(crate) fn in_progress_with(&self, transaction_id: TransactionId) -> bool {
        matches!(
            self.state,
            CandidatePairState::InProgress { transaction_id: tid, .. } if tid == transaction_id
        )
    }
}

/// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
pub(crate) fn pair_priority(
    local_candidate: &Candidate,
    remote_candidate: &Candidate,
    is_controlling: bool,
) -> u64 {
    let (g, d) = if is_controlling {
        (
            local_candidate.priority as u64,
            remote_candidate.priority as u64,
        )
    } else {
        (
            remote_candidate.priority as u64,
            local_candidate.priority as u64,
        )
    };

    (1u64 << 32) * min(g, d) + 2 * max(g, d) + u64::from(g > d)
}

impl IceAgent {
    /// (Re)build the check list after the local or remote candidate set
    /// changed
    pub(crate) fn form_pairs(&mut self) {
        let mut new_pairs = Vec::new();

        for (local_id, local_candidate) in &self.local_candidates {
            for (remote_id, remote_candidate) in &self.remote_candidates {
                // Remote peer-reflexive candidates are only paired through
                // the triggered-check path
                if remote_candidate.kind == CandidateKind::PeerReflexive {
                    continue;
                }

                if local_candidate.stream != remote_candidate.stream
                    || local_candidate.component != remote_candidate.component
                {
                    continue;
                }

                let already_exists = self
                    .pairs
                    .iter()
                    .any(|pair| pair.local == local_id && pair.remote == remote_id);

                if already_exists {
                    continue;
                }

                // Exclude pairs with incompatible address families
                match (local_candidate.addr.ip(), remote_candidate.addr.ip()) {
                    (IpAddr::V4(l), IpAddr::V4(r)) if l.is_link_local() == r.is_link_local() => {
                        /* ok */
                    }
                    // Only pair IPv6 addresses when either both or neither are link local addresses
                    (IpAddr::V6(l), IpAddr::V6(r))
                        if l.is_unicast_link_local() == r.is_unicast_link_local() =>
                    { /* ok */ }
                    _ => {
                        continue;
                    }
                }

                new_pairs.push((local_id, remote_id));
            }
        }

        for (local_id, remote_id) in new_pairs {
            self.add_candidate_pair(local_id, remote_id, CandidatePairState::Frozen);
        }

        self.sort_pairs();
        self.prune_pairs();
        self.mark_initial_waiting();
    }

    pub(crate) fn add_candidate_pair(
        &mut self,
        local_id: LocalCandidateId,
        remote_id: RemoteCandidateId,
        state: CandidatePairState,
    ) {
        if self
            .pairs
            .iter()
            .any(|p| p.local == local_id && p.remote == remote_id)
        {
            return;
        }

        let local_candidate = &self.local_candidates[local_id];
        let remote_candidate = &self.remote_candidates[remote_id];

        let priority = pair_priority(local_candidate, remote_candidate, self.is_controlling);

        log::debug!(
            "add pair {}, priority: {priority}, component={}",
            DisplayPair(local_candidate, remote_candidate),
            local_candidate.component,
        );

        self.pairs.push(CandidatePair {
            local: local_id,
            remote: remote_id,
            stream: local_candidate.stream,
            component: local_candidate.component,
            priority,
            state,
            received_use_candidate: false,
            nominated: false,
        });
    }

    pub(crate) fn sort_pairs(&mut self) {
        self.pairs.sort_unstable_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Role changes invalidate every pair priority
    pub(crate) fn recompute_pair_priorities(&mut self) {
        for pair in &mut self.pairs {
            pair.priority = pair_priority(
                &self.local_candidates[pair.local],
                &self.remote_candidates[pair.remote],
                self.is_controlling,
            );
        }

        self.sort_pairs();
    }

    /// Drop redundant pairs (same base & same remote address as a higher
    /// priority pair) and enforce the check list cap
    fn prune_pairs(&mut self) {
        let mut seen: HashSet<(crate::StreamId, crate::ComponentId, SocketAddr, SocketAddr)> =
            HashSet::new();

        let local_candidates = &self.local_candidates;
        let remote_candidates = &self.remote_candidates;

        // Pairs are sorted by descending priority, so the first pair of each
        // (base, remote addr) pairing is the one to keep
        self.pairs.retain(|pair| {
            let key = (
                pair.stream,
                pair.component,
                local_candidates[pair.local].base,
                remote_candidates[pair.remote].addr,
            );

            if !seen.insert(key) && matches!(pair.state, CandidatePairState::Frozen) {
                log::debug!(
                    "prune redundant pair {}",
                    DisplayPair(&local_candidates[pair.local], &remote_candidates[pair.remote])
                );
                return false;
            }

            true
        });

        while self.pairs.len() > self.config.max_pairs {
            let pair = self.pairs.pop().unwrap();
            log::debug!("pruned pair {:?}:{:?} over check list cap", pair.local, pair.remote);
        }
    }

    /// Within each foundation group exactly one pair starts out unfrozen: the
    /// one with the lowest component id, then the highest priority
    fn mark_initial_waiting(&mut self) {
        let groups: HashSet<(String, String)> = self
            .pairs
            .iter()
            .map(|p| self.pair_foundation(p))
            .collect();

        for group in groups {
            let any_unfrozen = self.pairs.iter().any(|p| {
                self.pair_foundation(p) == group && p.state != CandidatePairState::Frozen
            });

            if any_unfrozen {
                continue;
            }

            let mut best: Option<(crate::ComponentId, std::cmp::Reverse<u64>, usize)> = None;

            for i in 0..self.pairs.len() {
                if self.pairs[i].state != CandidatePairState::Frozen
                    || self.pair_foundation(&self.pairs[i]) != group
                {
                    continue;
                }

                let key = (
                    self.pairs[i].component,
                    std::cmp::Reverse(self.pairs[i].priority),
                    i,
                );

                if best.is_none() || Some(key) < best {
                    best = Some(key);
                }
            }

            if let Some((.., i)) = best {
                self.pairs[i].state = CandidatePairState::Waiting;
            }
        }
    }

    fn pair_foundation(&self, pair: &CandidatePair) -> (String, String) {
        (
            self.local_candidates[pair.local].foundation.clone(),
            self.remote_candidates[pair.remote].foundation.clone(),
        )
    }

    /// A succeeded pair unfreezes every frozen pair of its foundation group,
    /// across components
    fn unfreeze_siblings(&mut self, pair_idx: usize) {
        let group = self.pair_foundation(&self.pairs[pair_idx]);

        for i in 0..self.pairs.len() {
            if self.pairs[i].state == CandidatePairState::Frozen
                && self.pair_foundation(&self.pairs[i]) == group
            {
                self.pairs[i].state = CandidatePairState::Waiting;
            }
        }
    }

    fn find_pair_index(
        &self,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
    ) -> Option<usize> {
        self.pairs
            .iter()
            .position(|p| p.local == local && p.remote == remote)
    }

    /// The scheduler: paced by Ta, runs exactly one action per tick, in
    /// priority order triggered check > ordinary check > retransmit >
    /// nomination.
    pub(crate) fn tick_checks(&mut self, now: Instant, on_event: &mut impl FnMut(IceEvent)) {
        // 1. Pop from the triggered check queue
        let mut not_yet_sendable = Vec::new();
        let mut triggered = None;

        while let Some((local_id, remote_id)) = self.triggered_check_queue.pop_front() {
            let Some(idx) = self.find_pair_index(local_id, remote_id) else {
                // Pair was pruned since it was queued
                continue;
            };

            if matches!(self.pairs[idx].state, CandidatePairState::InProgress { .. }) {
                continue;
            }

            if !self.stream_has_remote_credentials(self.pairs[idx].stream) {
                // Keep the entry around until the credentials arrive
                not_yet_sendable.push((local_id, remote_id));
                continue;
            }

            triggered = Some(idx);
            break;
        }

        for entry in not_yet_sendable.into_iter().rev() {
            self.triggered_check_queue.push_front(entry);
        }

        if let Some(idx) = triggered {
            self.send_check(idx, now, on_event);
            return;
        }

        // 2. Highest-priority waiting pair; the list is sorted by priority
        let waiting = self.pairs.iter().position(|p| {
            p.state == CandidatePairState::Waiting
                && self.stream_has_remote_credentials(p.stream)
        });

        if let Some(idx) = waiting {
            self.send_check(idx, now, on_event);
            return;
        }

        // 3. Retransmit an in-progress pair whose RTO elapsed
        for idx in 0..self.pairs.len() {
            let due = matches!(
                &self.pairs[idx].state,
                CandidatePairState::InProgress { retransmit_at, .. } if *retransmit_at <= now
            );

            if !due {
                continue;
            }

            if matches!(
                &self.pairs[idx].state,
                CandidatePairState::InProgress { canceled: true, .. }
            ) {
                // Superseded by an inbound check, turn the pair into a
                // triggered check instead of retransmitting
                let (local_id, remote_id) = (self.pairs[idx].local, self.pairs[idx].remote);
                self.pairs[idx].state = CandidatePairState::Waiting;
                self.triggered_check_queue.push_back((local_id, remote_id));
                continue;
            }

            let exhausted = matches!(
                &self.pairs[idx].state,
                CandidatePairState::InProgress { retransmits, .. }
                    if *retransmits >= self.stun_config.max_retransmits
            );

            if exhausted {
                log::debug!(
                    "pair {} failed, transaction timed out",
                    DisplayPair(
                        &self.local_candidates[self.pairs[idx].local],
                        &self.remote_candidates[self.pairs[idx].remote]
                    )
                );
                self.pairs[idx].nominated = false;
                self.pairs[idx].state = CandidatePairState::Failed;
                continue;
            }

            let (data, source, target) = {
                let CandidatePairState::InProgress {
                    stun_request,
                    retransmit_at,
                    retransmits,
                    source,
                    target,
                    ..
                } = &mut self.pairs[idx].state
                else {
                    unreachable!()
                };

                *retransmits += 1;
                *retransmit_at += self.stun_config.retransmit_delta(*retransmits);

                (stun_request.clone(), *source, *target)
            };

            on_event(IceEvent::SendData {
                stream: self.pairs[idx].stream,
                component: self.pairs[idx].component,
                data,
                source,
                target,
            });
            return;
        }

        // 4. Nothing else to do: a quiet tick, nominate if we are controlling
        if self.is_controlling {
            self.nominate_ready_components(now, on_event);
        }
    }

    /// Regular nomination: pick the highest-priority succeeded pair of every
    /// component that has no nomination yet, once all components of the
    /// stream have a succeeded pair. Sends at most one nomination per tick.
    fn nominate_ready_components(&mut self, now: Instant, on_event: &mut impl FnMut(IceEvent)) {
        for stream_idx in 0..self.streams.len() {
            let stream_id = self.streams[stream_idx].id;

            if self.streams[stream_idx].remote_credentials.is_none() {
                continue;
            }

            let all_components_connected = self.streams[stream_idx].components.iter().all(|c| {
                self.pairs.iter().any(|p| {
                    p.stream == stream_id
                        && p.component == c.id
                        && p.state == CandidatePairState::Succeeded
                })
            });

            if !all_components_connected {
                continue;
            }

            for component_idx in 0..self.streams[stream_idx].components.len() {
                let component_id = self.streams[stream_idx].components[component_idx].id;

                let already_nominated = self
                    .pairs
                    .iter()
                    .any(|p| p.stream == stream_id && p.component == component_id && p.nominated);

                if already_nominated {
                    continue;
                }

                let best = self
                    .pairs
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        p.stream == stream_id
                            && p.component == component_id
                            && p.state == CandidatePairState::Succeeded
                    })
                    .max_by_key(|(_, p)| p.priority)
                    .map(|(i, _)| i);

                let Some(idx) = best else {
                    continue;
                };

                log::debug!(
                    "nominating {}",
                    DisplayPair(
                        &self.local_candidates[self.pairs[idx].local],
                        &self.remote_candidates[self.pairs[idx].remote]
                    )
                );

                self.pairs[idx].nominated = true;
                self.send_check(idx, now, on_event);
                return;
            }
        }
    }

    /// Send a connectivity check for a pair and move it to InProgress. The
    /// request nominates when the pair is marked nominated.
    fn send_check(&mut self, idx: usize, now: Instant, on_event: &mut impl FnMut(IceEvent)) {
        let pair = &self.pairs[idx];
        let local_candidate = &self.local_candidates[pair.local];
        let remote_candidate = &self.remote_candidates[pair.remote];

        let stream = self
            .streams
            .iter()
            .find(|s| s.id == pair.stream)
            .expect("pairs of removed streams are pruned");

        let remote_credentials = stream
            .remote_credentials
            .as_ref()
            .expect("checks are only scheduled with remote credentials present");

        log::debug!(
            "start connectivity check for pair {}",
            DisplayPair(local_candidate, remote_candidate)
        );

        let transaction_id = TransactionId::random();

        // PRIORITY announces the priority a peer-reflexive candidate learned
        // from this check would have
        let prflx_priority = candidate_priority(
            CandidateKind::PeerReflexive,
            self.local_preference(local_candidate.base.ip()),
            pair.component,
        );

        let stun_request = stun::make_binding_request(
            transaction_id,
            &stream.local_credentials,
            remote_credentials,
            prflx_priority,
            self.is_controlling,
            self.control_tie_breaker,
            pair.nominated,
        );

        let source = local_candidate.base;
        let target = remote_candidate.addr;
        let (stream_id, component) = (pair.stream, pair.component);

        self.pairs[idx].state = CandidatePairState::InProgress {
            transaction_id,
            stun_request: stun_request.clone(),
            retransmit_at: now + self.stun_config.retransmit_delta(0),
            retransmits: 0,
            source,
            target,
            canceled: false,
        };

        on_event(IceEvent::SendData {
            stream: stream_id,
            component,
            data: stun_request,
            source,
            target,
        });
    }

    pub(crate) fn receive_stun_success(&mut self, pkt: &ReceivedPkt, stun_msg: Message) {
        // Server binding responses are matched before the integrity check
        // since plain STUN gathering is unauthenticated
        let binding = self
            .stun_bindings
            .iter()
            .position(|b| b.wants_stun_response(stun_msg.transaction_id()));

        if let Some(i) = binding {
            let (stream, component, base, server) = {
                let b = &self.stun_bindings[i];
                (b.stream(), b.component(), b.base(), b.server())
            };

            if let Some(mapped) = self.stun_bindings[i].receive_stun_response(&stun_msg) {
                self.add_server_reflexive_candidate(stream, component, base, server, mapped);
            }

            return;
        }

        let Some(idx) = self
            .pairs
            .iter()
            .position(|p| p.in_progress_with(stun_msg.transaction_id()))
        else {
            log::debug!("failed to find transaction for STUN success, discarding");
            return;
        };

        if !self.verify_for_stream(self.pairs[idx].stream, &stun_msg) {
            log::debug!("incoming STUN success failed the integrity check, discarding");
            return;
        }

        let CandidatePairState::InProgress { source, target, .. } = &self.pairs[idx].state else {
            unreachable!()
        };
        let (source, target) = (*source, *target);

        // The source and destination transport addresses of request and
        // response must be symmetric
        if pkt.source != target || pkt.destination != source {
            log::debug!(
                "got success response with asymmetric address for pair {}",
                DisplayPair(
                    &self.local_candidates[self.pairs[idx].local],
                    &self.remote_candidates[self.pairs[idx].remote]
                )
            );

            self.pairs[idx].nominated = false;
            self.pairs[idx].state = CandidatePairState::Failed;
            self.update_component_states();
            return;
        }

        // A mapped address we do not know yet is a new peer-reflexive local
        // candidate; the pair is rewritten onto it
        if let Some(Ok(XorMappedAddress(mapped))) = stun_msg.attribute::<XorMappedAddress>() {
            let (stream, component) = (self.pairs[idx].stream, self.pairs[idx].component);

            let known = self
                .local_candidates
                .iter()
                .find(|(_, c)| c.stream == stream && c.component == component && c.addr == mapped);

            if known.is_none() {
                let base = self.local_candidates[self.pairs[idx].local].base;
                let new_local =
                    self.add_peer_reflexive_local_candidate(stream, component, base, mapped);

                self.pairs[idx].local = new_local;
                self.pairs[idx].priority = pair_priority(
                    &self.local_candidates[new_local],
                    &self.remote_candidates[self.pairs[idx].remote],
                    self.is_controlling,
                );
            }
        }

        log::debug!(
            "got success response for pair {} nominated={}",
            DisplayPair(
                &self.local_candidates[self.pairs[idx].local],
                &self.remote_candidates[self.pairs[idx].remote],
            ),
            self.pairs[idx].nominated,
        );

        self.pairs[idx].state = CandidatePairState::Succeeded;

        self.unfreeze_siblings(idx);
        self.sort_pairs();
        self.update_component_states();
    }

    pub(crate) fn receive_stun_error(&mut self, stun_msg: Message) {
        let Some(idx) = self
            .pairs
            .iter()
            .position(|p| p.in_progress_with(stun_msg.transaction_id()))
        else {
            log::debug!("failed to find transaction for STUN error, discarding");
            return;
        };

        if !self.verify_for_stream(self.pairs[idx].stream, &stun_msg) {
            log::debug!("incoming STUN error failed the integrity check, discarding");
            return;
        }

        let Some(Ok(error_code)) = stun_msg.attribute::<ErrorCode>() else {
            self.pairs[idx].nominated = false;
            self.pairs[idx].state = CandidatePairState::Failed;
            self.update_component_states();
            return;
        };

        log::debug!(
            "candidate pair failed with code={}, reason={}",
            error_code.number,
            error_code.reason
        );

        if error_code.number == 487 {
            // The responder kept its role after winning the tie-breaker
            // comparison, so this agent takes the opposite one
            if stun_msg.attribute::<IceControlled>().is_some() {
                self.is_controlling = true;
            } else if stun_msg.attribute::<IceControlling>().is_some() {
                self.is_controlling = false;
            }

            let (local_id, remote_id) = (self.pairs[idx].local, self.pairs[idx].remote);

            self.pairs[idx].nominated = false;
            self.pairs[idx].state = CandidatePairState::Waiting;
            self.triggered_check_queue.push_back((local_id, remote_id));

            // Pair priorities depend on the role
            self.recompute_pair_priorities();
        } else {
            self.pairs[idx].nominated = false;
            self.pairs[idx].state = CandidatePairState::Failed;
        }

        self.update_component_states();
    }

    pub(crate) fn receive_stun_request(
        &mut self,
        pkt: &ReceivedPkt,
        stun_msg: Message,
        on_event: &mut impl FnMut(IceEvent),
    ) {
        let Some(stream_idx) = self.streams.iter().position(|s| s.id == pkt.stream) else {
            return;
        };

        // Unknown comprehension-required attributes are answered with 420
        let unknown = stun_msg.unknown_comprehension_required();
        if !unknown.is_empty() {
            let response = stun::make_unknown_attributes(stun_msg.transaction_id(), unknown);
            self.send_response(pkt, response, on_event);
            return;
        }

        // USERNAME, MESSAGE-INTEGRITY & PRIORITY are required on every
        // connectivity check
        let has_username = stun_msg.attribute::<Username>().is_some();
        let has_integrity = stun_msg.has_attribute(MessageIntegrity::TYPE);
        let priority = stun_msg.attribute::<Priority>();

        let (Some(Ok(Priority(priority))), true, true) = (priority, has_username, has_integrity)
        else {
            let response = stun::make_bad_request(stun_msg.transaction_id());
            self.send_response(pkt, response, on_event);
            return;
        };

        {
            let stream = &self.streams[stream_idx];
            if !stun::verify_integrity(
                &stream.local_credentials,
                &stream.remote_credentials,
                &stun_msg,
            ) {
                log::debug!("incoming STUN request failed the integrity check, discarding");
                return;
            }
        }

        if !self.streams[stream_idx].initial_binding_request_received {
            self.streams[stream_idx].initial_binding_request_received = true;
            self.pending_events
                .push_back(IceEvent::InitialBindingRequestReceived { stream: pkt.stream });
        }

        let use_candidate = stun_msg.attribute::<UseCandidate>().is_some();

        // Detect and handle role conflicts
        if self.is_controlling {
            if let Some(Ok(IceControlling(their_tie_breaker))) =
                stun_msg.attribute::<IceControlling>()
            {
                if self.control_tie_breaker >= their_tie_breaker {
                    let response = stun::make_role_error(
                        stun_msg.transaction_id(),
                        &self.streams[stream_idx].local_credentials,
                        true,
                        self.control_tie_breaker,
                    );
                    self.send_response(pkt, response, on_event);
                    return;
                } else {
                    self.is_controlling = false;
                    self.recompute_pair_priorities();
                }
            }
        } else if let Some(Ok(IceControlled(their_tie_breaker))) =
            stun_msg.attribute::<IceControlled>()
        {
            if self.control_tie_breaker >= their_tie_breaker {
                let response = stun::make_role_error(
                    stun_msg.transaction_id(),
                    &self.streams[stream_idx].local_credentials,
                    false,
                    self.control_tie_breaker,
                );
                self.send_response(pkt, response, on_event);
                return;
            } else {
                self.is_controlling = true;
                self.recompute_pair_priorities();
            }
        }

        // The socket the request arrived on names the local candidate
        let local_id = match self.local_candidates.iter().find(|(_, c)| {
            c.stream == pkt.stream
                && c.component == pkt.component
                && c.kind == CandidateKind::Host
                && c.addr == pkt.destination
        }) {
            Some((id, _)) => id,
            None => {
                log::warn!(
                    "failed to find matching local candidate for incoming STUN request ({})",
                    pkt.destination
                );
                return;
            }
        };

        let matching_remote_candidate = self.remote_candidates.iter().find(|(_, c)| {
            c.stream == pkt.stream && c.component == pkt.component && c.addr == pkt.source
        });

        let remote_id = match matching_remote_candidate {
            Some((remote_id, _)) => remote_id,
            None => {
                // No remote candidate with the source address: learn a new
                // peer-reflexive candidate with the priority the peer announced
                let remote_id = self.remote_candidates.insert(Candidate {
                    stream: pkt.stream,
                    component: pkt.component,
                    kind: CandidateKind::PeerReflexive,
                    addr: pkt.source,
                    base: pkt.source,
                    priority,
                    foundation: peer_reflexive_foundation(pkt.source),
                });

                log::debug!(
                    "learned remote peer-reflexive candidate {} for stream {}",
                    pkt.source,
                    pkt.stream
                );

                self.pending_events.push_back(IceEvent::NewRemoteCandidate {
                    stream: pkt.stream,
                    candidate: self.remote_candidates[remote_id].to_descriptor(),
                });

                self.add_candidate_pair(local_id, remote_id, CandidatePairState::Waiting);
                self.sort_pairs();

                remote_id
            }
        };

        let idx = match self.find_pair_index(local_id, remote_id) {
            Some(idx) => idx,
            None => {
                self.add_candidate_pair(local_id, remote_id, CandidatePairState::Waiting);
                self.sort_pairs();
                self.find_pair_index(local_id, remote_id)
                    .expect("pair was just added")
            }
        };

        log::trace!(
            "got connectivity check for pair {}",
            DisplayPair(
                &self.local_candidates[self.pairs[idx].local],
                &self.remote_candidates[self.pairs[idx].remote],
            )
        );

        let response = stun::make_success_response(
            stun_msg.transaction_id(),
            &self.streams[stream_idx].local_credentials,
            pkt.source,
        );
        self.send_response(pkt, response, on_event);

        if use_candidate {
            self.pairs[idx].received_use_candidate = true;
        }

        match &mut self.pairs[idx].state {
            CandidatePairState::Succeeded => {}
            CandidatePairState::InProgress { canceled, .. } => {
                // The peer's triggered check wins over our outstanding
                // transaction
                *canceled = true;
            }
            state @ (CandidatePairState::Frozen
            | CandidatePairState::Waiting
            | CandidatePairState::Failed) => {
                *state = CandidatePairState::Waiting;

                if !self
                    .triggered_check_queue
                    .iter()
                    .any(|&(l, r)| l == local_id && r == remote_id)
                {
                    self.triggered_check_queue.push_back((local_id, remote_id));
                }
            }
        }

        // The controlled side nominates once a use-candidate pair succeeded.
        // In passive (respond-only) mode the peer's nomination is accepted
        // as is, there are no checks of our own to wait for.
        if use_candidate && !self.is_controlling {
            let succeeded = self.pairs[idx].state == CandidatePairState::Succeeded;
            if succeeded || !self.config.full_mode {
                self.pairs[idx].nominated = true;
            }
        }

        self.update_component_states();
    }

    /// Integrity check of a response with the credentials of the stream the
    /// transaction belongs to
    fn verify_for_stream(&self, stream: crate::StreamId, stun_msg: &Message) -> bool {
        let Some(stream) = self.streams.iter().find(|s| s.id == stream) else {
            return false;
        };

        stun::verify_integrity(&stream.local_credentials, &stream.remote_credentials, stun_msg)
    }

    fn send_response(
        &self,
        pkt: &ReceivedPkt,
        response: Vec<u8>,
        on_event: &mut impl FnMut(IceEvent),
    ) {
        on_event(IceEvent::SendData {
            stream: pkt.stream,
            component: pkt.component,
            data: response,
            source: pkt.destination,
            target: pkt.source,
        });
    }
}

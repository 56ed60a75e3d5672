use crate::{ComponentId, StreamId};
use slotmap::new_key_type;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

new_key_type!(
    pub(crate) struct LocalCandidateId;
    pub(crate) struct RemoteCandidateId;
);

/// Candidate type. The discriminant doubles as the type preference of the
/// priority formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host = 126,
    PeerReflexive = 110,
    ServerReflexive = 100,
    /// Reserved; nothing in this crate allocates relayed candidates
    Relayed = 0,
}

impl CandidateKind {
    pub(crate) fn type_preference(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        };
        f.write_str(s)
    }
}

pub(crate) struct Candidate {
    pub(crate) stream: StreamId,
    pub(crate) component: ComponentId,

    pub(crate) kind: CandidateKind,
    pub(crate) addr: SocketAddr,

    // The transport address the agent sends from for this candidate. For
    // host, server-reflexive and peer-reflexive candidates this is the
    // owning host candidate's address.
    pub(crate) base: SocketAddr,

    pub(crate) priority: u32,
    pub(crate) foundation: String,
}

/// priority = (2^24) * type_pref + (2^8) * local_pref + (256 - component_id)
pub(crate) fn candidate_priority(
    kind: CandidateKind,
    local_preference: u32,
    component: ComponentId,
) -> u32 {
    (kind.type_preference() << 24) + (local_preference << 8) + (256 - u32::from(component))
}

/// Two local candidates share a foundation iff (kind, base ip, STUN server)
/// match
pub(crate) fn compute_foundation(
    kind: CandidateKind,
    base: IpAddr,
    server: Option<IpAddr>,
    proto: &str,
) -> String {
    let mut hasher = DefaultHasher::new();
    (kind, base, server, proto).hash(&mut hasher);
    hasher.finish().to_string()
}

/// Foundation for remote peer-reflexive candidates, derived from the learned
/// transport address
pub(crate) fn peer_reflexive_foundation(addr: SocketAddr) -> String {
    let mut hasher = DefaultHasher::new();
    (CandidateKind::PeerReflexive, addr).hash(&mut hasher);
    hasher.finish().to_string()
}

/// Candidate description exchanged over the signalling channel. How it is
/// serialized (SDP or otherwise) is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDescriptor {
    pub foundation: String,
    pub component: ComponentId,
    /// Only "udp" is supported
    pub transport: String,
    pub priority: u32,
    pub addr: SocketAddr,
    pub kind: CandidateKind,
    /// Base of the candidate, present for non-host candidates
    pub related_addr: Option<SocketAddr>,
}

impl Candidate {
    pub(crate) fn to_descriptor(&self) -> CandidateDescriptor {
        CandidateDescriptor {
            foundation: self.foundation.clone(),
            component: self.component,
            transport: "udp".into(),
            priority: self.priority,
            addr: self.addr,
            kind: self.kind,
            related_addr: (self.kind != CandidateKind::Host).then_some(self.base),
        }
    }
}

pub(crate) struct DisplayPair<'a>(pub(crate) &'a Candidate, pub(crate) &'a Candidate);

impl fmt::Display for DisplayPair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_candidate(f: &mut fmt::Formatter<'_>, c: &Candidate) -> fmt::Result {
            match c.kind {
                CandidateKind::Host => write!(f, "host({})", c.addr),
                _ => write!(f, "{}(base:{}, addr:{})", c.kind, c.base, c.addr),
            }
        }

        fmt_candidate(f, self.0)?;
        write!(f, " <-> ")?;
        fmt_candidate(f, self.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_formula() {
        // Server-reflexive candidate of component 1 on the only interface
        assert_eq!(
            candidate_priority(CandidateKind::ServerReflexive, 65535, 1),
            (100 << 24) | (65535 << 8) | (256 - 1)
        );

        // Host outranks everything else on the same interface & component
        assert!(
            candidate_priority(CandidateKind::Host, 65535, 1)
                > candidate_priority(CandidateKind::PeerReflexive, 65535, 1)
        );
        assert!(
            candidate_priority(CandidateKind::PeerReflexive, 65535, 1)
                > candidate_priority(CandidateKind::ServerReflexive, 65535, 1)
        );

        // Lower component id wins within a type
        assert!(
            candidate_priority(CandidateKind::Host, 65535, 1)
                > candidate_priority(CandidateKind::Host, 65535, 2)
        );
    }

    #[test]
    fn foundation_equality_classes() {
        let base_a: IpAddr = "10.0.0.1".parse().unwrap();
        let base_b: IpAddr = "10.0.0.2".parse().unwrap();
        let server: IpAddr = "192.0.2.1".parse().unwrap();

        let f = compute_foundation(CandidateKind::Host, base_a, None, "udp");

        assert_eq!(f, compute_foundation(CandidateKind::Host, base_a, None, "udp"));
        assert_ne!(f, compute_foundation(CandidateKind::Host, base_b, None, "udp"));
        assert_ne!(
            f,
            compute_foundation(CandidateKind::ServerReflexive, base_a, Some(server), "udp")
        );

        assert!(f.len() <= 32);
        assert!(f.is_ascii());
    }
}

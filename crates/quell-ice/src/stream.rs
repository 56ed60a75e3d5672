use crate::candidate::{LocalCandidateId, RemoteCandidateId};
use rand::distributions::{Alphanumeric, DistString};

/// Stream ids are handed out by the agent starting at 1; 0 is never a valid id
/// and doubles as the failure return of `add_stream`.
pub type StreamId = u32;

/// Component ids are 1-based within their stream (RTP is 1, RTCP 2, ...)
pub type ComponentId = u16;

/// Credentials of an ICE stream
///
/// These must be exchanged using some external signalling protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();

        Self {
            ufrag: Alphanumeric.sample_string(&mut rng, 8),
            pwd: Alphanumeric.sample_string(&mut rng, 32),
        }
    }
}

/// State of a single stream component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComponentState {
    /// No candidates exist yet
    Disconnected,
    /// Host candidates are being created / reflexive discovery is running
    Gathering,
    /// Connectivity checks are in progress
    Connecting,
    /// At least one candidate pair succeeded
    Connected,
    /// A nominated succeeded pair exists; the selected pair is usable
    Ready,
    /// Every pair failed and no pending discovery can produce new candidates
    Failed,
}

pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) local_credentials: IceCredentials,
    pub(crate) remote_credentials: Option<IceCredentials>,
    pub(crate) components: Vec<Component>,
    pub(crate) initial_binding_request_received: bool,
}

impl Stream {
    pub(crate) fn new(id: StreamId, n_components: ComponentId) -> Self {
        Self {
            id,
            local_credentials: IceCredentials::random(),
            remote_credentials: None,
            components: (1..=n_components).map(Component::new).collect(),
            initial_binding_request_received: false,
        }
    }

    pub(crate) fn component(&self, id: ComponentId) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }

    pub(crate) fn component_mut(&mut self, id: ComponentId) -> Option<&mut Component> {
        self.components.iter_mut().find(|c| c.id == id)
    }
}

pub(crate) struct Component {
    pub(crate) id: ComponentId,
    pub(crate) state: ComponentState,
    pub(crate) selected_pair: Option<(LocalCandidateId, RemoteCandidateId)>,

    /// Whether the caller sent media since the last keepalive tick. Reset by
    /// the keepalive timer; a set flag suppresses the Binding Indication.
    pub(crate) media_after_tick: bool,
}

impl Component {
    fn new(id: ComponentId) -> Self {
        Self {
            id,
            state: ComponentState::Disconnected,
            selected_pair: None,
            media_after_tick: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_have_expected_lengths() {
        let creds = IceCredentials::random();

        assert_eq!(creds.ufrag.len(), 8);
        assert_eq!(creds.pwd.len(), 32);
        assert!(creds.ufrag.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(creds.pwd.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn credentials_differ_between_streams() {
        let a = IceCredentials::random();
        let b = IceCredentials::random();

        assert_ne!(a.ufrag, b.ufrag);
        assert_ne!(a.pwd, b.pwd);
    }

    #[test]
    fn components_are_one_based() {
        let stream = Stream::new(1, 2);

        assert_eq!(stream.components.len(), 2);
        assert!(stream.component(1).is_some());
        assert!(stream.component(2).is_some());
        assert!(stream.component(0).is_none());
        assert!(stream.component(3).is_none());
    }
}

use crate::IceCredentials;
use quell_stun_types::attributes::{
    ErrorCode, Fingerprint, IceControlled, IceControlling, MessageIntegrity, MessageIntegrityKey,
    Priority, UnknownAttributes, UseCandidate, Username, XorMappedAddress,
};
use quell_stun_types::{Class, Message, MessageBuilder, Method, TransactionId};
use std::borrow::Cow;
use std::cmp::min;
use std::net::SocketAddr;
use std::time::Duration;

pub(crate) struct StunConfig {
    pub(crate) initial_rto: Duration,
    pub(crate) max_retransmits: u32,
    pub(crate) max_rto: Duration,
}

impl StunConfig {
    pub(crate) fn new() -> Self {
        Self {
            initial_rto: Duration::from_millis(100),
            // Rc = 7 transmissions total: the initial request + 6 retransmits
            max_retransmits: 6,
            max_rto: Duration::from_millis(1600),
        }
    }

    /// Delay before retransmit number `attempts + 1`, doubling each time up to
    /// `max_rto`
    pub(crate) fn retransmit_delta(&self, attempts: u32) -> Duration {
        let rto = self
            .initial_rto
            .checked_mul(1 << attempts.min(16))
            .unwrap_or(self.max_rto);

        min(rto, self.max_rto)
    }
}

pub(crate) fn make_binding_request(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    prflx_priority: u32,
    is_controlling: bool,
    control_tie_breaker: u64,
    nominate: bool,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);

    let username = format!("{}:{}", remote_credentials.ufrag, local_credentials.ufrag);
    stun_message.add_attr(&Username::new(&username)).unwrap();
    stun_message.add_attr(&Priority(prflx_priority)).unwrap();

    if is_controlling {
        stun_message
            .add_attr(&IceControlling(control_tie_breaker))
            .unwrap();
    } else {
        stun_message
            .add_attr(&IceControlled(control_tie_breaker))
            .unwrap();
    }

    if nominate {
        stun_message.add_attr(&UseCandidate).unwrap();
    }

    stun_message
        .add_attr_with(
            &MessageIntegrity::default(),
            &MessageIntegrityKey::new_raw(Cow::Borrowed(remote_credentials.pwd.as_bytes())),
        )
        .unwrap();

    stun_message.add_attr(&Fingerprint).unwrap();

    stun_message.finish()
}

/// Binding request towards a plain STUN server for server-reflexive discovery.
/// No credentials are involved, so only FINGERPRINT is attached.
pub(crate) fn make_server_binding_request(transaction_id: TransactionId) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);
    stun_message.add_attr(&Fingerprint).unwrap();
    stun_message.finish()
}

/// Keepalive Binding indication, sent on the selected pair. Indications are
/// fire-and-forget; no transaction state is kept.
pub(crate) fn make_binding_indication() -> Vec<u8> {
    let mut stun_message =
        MessageBuilder::new(Class::Indication, Method::Binding, TransactionId::random());
    stun_message.add_attr(&Fingerprint).unwrap();
    stun_message.finish()
}

pub(crate) fn make_success_response(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    source: SocketAddr,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Success, Method::Binding, transaction_id);

    stun_message.add_attr(&XorMappedAddress(source)).unwrap();
    stun_message
        .add_attr_with(
            &MessageIntegrity::default(),
            &MessageIntegrityKey::new_raw(Cow::Borrowed(local_credentials.pwd.as_bytes())),
        )
        .unwrap();

    stun_message.add_attr(&Fingerprint).unwrap();

    stun_message.finish()
}

/// 487 Role Conflict response carrying our role & tie-breaker
pub(crate) fn make_role_error(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    is_controlling: bool,
    control_tie_breaker: u64,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Error, Method::Binding, transaction_id);

    stun_message
        .add_attr(&ErrorCode::new(487, "Role Conflict"))
        .unwrap();

    if is_controlling {
        stun_message
            .add_attr(&IceControlling(control_tie_breaker))
            .unwrap();
    } else {
        stun_message
            .add_attr(&IceControlled(control_tie_breaker))
            .unwrap();
    }

    stun_message
        .add_attr_with(
            &MessageIntegrity::default(),
            &MessageIntegrityKey::new_raw(Cow::Borrowed(local_credentials.pwd.as_bytes())),
        )
        .unwrap();

    stun_message.add_attr(&Fingerprint).unwrap();

    stun_message.finish()
}

/// 400 Bad Request for requests missing required attributes
pub(crate) fn make_bad_request(transaction_id: TransactionId) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Error, Method::Binding, transaction_id);
    stun_message
        .add_attr(&ErrorCode::new(400, "Bad Request"))
        .unwrap();
    stun_message.add_attr(&Fingerprint).unwrap();
    stun_message.finish()
}

/// 420 Unknown Attribute listing the offending comprehension-required types
pub(crate) fn make_unknown_attributes(transaction_id: TransactionId, unknown: Vec<u16>) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Error, Method::Binding, transaction_id);
    stun_message
        .add_attr(&ErrorCode::new(420, "Unknown Attribute"))
        .unwrap();
    stun_message
        .add_attr(&UnknownAttributes(unknown))
        .unwrap();
    stun_message.add_attr(&Fingerprint).unwrap();
    stun_message.finish()
}

/// Verify MESSAGE-INTEGRITY & USERNAME of an inbound connectivity check
/// message. Requests are keyed with our password, responses with the peer's.
/// Responses carry no USERNAME; for requests the half naming us must match
/// our ufrag.
pub(crate) fn verify_integrity(
    local_credentials: &IceCredentials,
    remote_credentials: &Option<IceCredentials>,
    stun_msg: &Message,
) -> bool {
    let is_request = match stun_msg.class() {
        Class::Request | Class::Indication => true,
        Class::Success | Class::Error => false,
    };

    let key = if is_request {
        &local_credentials.pwd
    } else {
        let Some(remote_credentials) = remote_credentials else {
            return false;
        };
        &remote_credentials.pwd
    };

    let passed_integrity_check = stun_msg
        .attribute_with::<MessageIntegrity>(&MessageIntegrityKey::new_raw(Cow::Borrowed(
            key.as_bytes(),
        )))
        .is_some_and(|r| r.is_ok());

    if !passed_integrity_check {
        return false;
    }

    if is_request {
        let Some(Ok(username)) = stun_msg.attribute::<Username>() else {
            return false;
        };

        let Some((first, _)) = username.0.split_once(':') else {
            return false;
        };

        if first != local_credentials.ufrag {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_delta_doubles_up_to_cap() {
        let config = StunConfig::new();

        assert_eq!(config.retransmit_delta(0), Duration::from_millis(100));
        assert_eq!(config.retransmit_delta(1), Duration::from_millis(200));
        assert_eq!(config.retransmit_delta(2), Duration::from_millis(400));
        assert_eq!(config.retransmit_delta(3), Duration::from_millis(800));
        assert_eq!(config.retransmit_delta(4), Duration::from_millis(1600));
        assert_eq!(config.retransmit_delta(5), Duration::from_millis(1600));
        assert_eq!(config.retransmit_delta(30), Duration::from_millis(1600));
    }

    #[test]
    fn request_integrity_roundtrip() {
        let local = IceCredentials::random();
        let remote = IceCredentials::random();

        let request = make_binding_request(
            TransactionId::random(),
            &local,
            &remote,
            1234,
            true,
            42,
            false,
        );

        // As seen by the peer: its "local" credentials are our "remote" ones
        let msg = Message::parse(request).unwrap();
        assert!(verify_integrity(&remote, &Some(local.clone()), &msg));

        // Swapped credentials must not validate
        assert!(!verify_integrity(&local, &Some(remote), &msg));
    }

    #[test]
    fn response_integrity_is_keyed_by_remote_password() {
        let local = IceCredentials::random();
        let remote = IceCredentials::random();

        let response = make_success_response(
            TransactionId::random(),
            &local,
            "10.0.0.1:4242".parse().unwrap(),
        );

        let msg = Message::parse(response).unwrap();
        assert!(verify_integrity(&remote, &Some(local), &msg));
    }
}

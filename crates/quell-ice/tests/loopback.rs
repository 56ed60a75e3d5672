use quell_ice::{
    AsyncIceAgent, ComponentState, IceAgent, IceConfig, IceEvent, UdpSocketFactory,
};
use std::time::Duration;
use tokio::select;

fn agent(controlling: bool) -> AsyncIceAgent {
    let mut agent = IceAgent::new(IceConfig {
        controlling_mode: controlling,
        ..IceConfig::default()
    });
    agent.add_local_address("127.0.0.1".parse().unwrap());

    AsyncIceAgent::new(agent, UdpSocketFactory)
}

#[tokio::test]
async fn loopback_end_to_end() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut a = agent(true);
    let mut b = agent(false);

    let stream_a = a.add_stream(1).unwrap();
    let stream_b = b.add_stream(1).unwrap();
    assert_ne!(stream_a, 0);
    assert_ne!(stream_b, 0);

    let creds_a = a.agent().local_credentials(stream_a).unwrap().clone();
    let creds_b = b.agent().local_credentials(stream_b).unwrap().clone();

    a.agent_mut()
        .set_remote_credentials(stream_a, &creds_b.ufrag, &creds_b.pwd);
    b.agent_mut()
        .set_remote_credentials(stream_b, &creds_a.ufrag, &creds_a.pwd);

    for candidate in b.agent().candidates(stream_b) {
        a.agent_mut()
            .add_remote_candidate(stream_a, candidate.component, &candidate);
    }
    for candidate in a.agent().candidates(stream_a) {
        b.agent_mut()
            .add_remote_candidate(stream_b, candidate.component, &candidate);
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        while a.agent().component_state(stream_a, 1) != Some(ComponentState::Ready)
            || b.agent().component_state(stream_b, 1) != Some(ComponentState::Ready)
        {
            select! {
                result = a.step() => result.unwrap(),
                result = b.step() => result.unwrap(),
            }
        }
    })
    .await
    .expect("agents must pair up on loopback");

    assert!(a
        .agent()
        .selected_pair(stream_a, 1)
        .is_some_and(|(local, remote)| local.addr.is_ipv4() && remote.addr.is_ipv4()));

    // Media flows over the selected pair
    let payload = vec![0x80, 0x60, 0x01, 0x02, 0x03];
    let sent = a.send(stream_a, 1, &payload).await.unwrap();
    assert_eq!(sent, payload.len());

    let received = b
        .recv(stream_b, 1, Duration::from_secs(5))
        .await
        .expect("media must arrive");
    assert_eq!(received, payload);

    // The driver surfaced the gathering & state events
    let mut saw_gathering_done = false;
    let mut saw_selected = false;
    while let Some(event) = a.pop_event() {
        match event {
            IceEvent::GatheringDone => saw_gathering_done = true,
            IceEvent::NewSelectedPair { .. } => saw_selected = true,
            _ => {}
        }
    }
    assert!(saw_gathering_done);
    assert!(saw_selected);
}

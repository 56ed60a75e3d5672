use crate::{ComponentId, Events, IceAgent, IceEvent, ReceivedPkt, StreamId};
use std::collections::{HashMap, VecDeque};
use std::future::{pending, poll_fn};
use std::io;
use std::net::SocketAddr;
use std::task::Poll;
use std::time::Duration;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{sleep_until, Instant};

const RECV_BUFFER_SIZE: usize = 65535;

/// Capability producing UDP sockets bound to a local address. Injected into
/// [`AsyncIceAgent`] so applications can control binding (ports, interfaces,
/// sandboxing).
pub trait SocketFactory {
    fn bind(&self, addr: SocketAddr) -> io::Result<std::net::UdpSocket>;
}

/// The default socket factory: plain non-blocking UDP sockets
pub struct UdpSocketFactory;

impl SocketFactory for UdpSocketFactory {
    fn bind(&self, addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

/// Drives an [`IceAgent`] over real UDP sockets on a tokio runtime
///
/// One socket is bound per (stream, component, local address); the sans-io
/// agent addresses them by the source address of its
/// [`SendData`](IceEvent::SendData) events. All methods take `&mut self`, the
/// driver is single threaded by construction.
pub struct AsyncIceAgent<F = UdpSocketFactory> {
    agent: IceAgent,
    factory: F,

    sockets: HashMap<(StreamId, ComponentId, SocketAddr), UdpSocket>,

    /// Media received for each component, waiting for `recv`
    media: HashMap<(StreamId, ComponentId), VecDeque<Vec<u8>>>,

    /// User-visible events, drained with `pop_event`
    events: Events,

    buf: Vec<u8>,
}

impl<F: SocketFactory> AsyncIceAgent<F> {
    pub fn new(agent: IceAgent, factory: F) -> Self {
        Self {
            agent,
            factory,
            sockets: HashMap::new(),
            media: HashMap::new(),
            events: Events::default(),
            buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    pub fn agent(&self) -> &IceAgent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut IceAgent {
        &mut self.agent
    }

    /// Create a stream and bind one socket per component on every local
    /// address, registering the bound addresses as host candidates
    pub fn add_stream(&mut self, n_components: ComponentId) -> io::Result<StreamId> {
        let stream = self.agent.add_stream(n_components);

        if stream == 0 {
            return Ok(0);
        }

        for ip in self.agent.local_addresses().to_vec() {
            for component in 1..=n_components {
                let socket = self.factory.bind(SocketAddr::new(ip, 0))?;
                let local_addr = socket.local_addr()?;
                let socket = UdpSocket::from_std(socket)?;

                self.agent.add_host_candidate(stream, component, local_addr);
                self.sockets.insert((stream, component, local_addr), socket);
            }
        }

        Ok(stream)
    }

    pub fn remove_stream(&mut self, stream: StreamId) {
        self.agent.remove_stream(stream);
        self.sockets.retain(|&(s, ..), _| s != stream);
        self.media.retain(|&(s, _), _| s != stream);
    }

    pub fn pop_event(&mut self) -> Option<IceEvent> {
        self.events.pop()
    }

    /// Send media over the component's selected pair
    pub async fn send(
        &mut self,
        stream: StreamId,
        component: ComponentId,
        data: &[u8],
    ) -> io::Result<usize> {
        let mut outbound = Vec::new();

        let (agent, events) = (&mut self.agent, &mut self.events);
        let n = agent
            .send(stream, component, data, |ev| {
                route_event(ev, &mut outbound, events)
            })
            .map_err(io::Error::other)?;

        self.flush(outbound).await?;

        Ok(n)
    }

    /// Bounded wait for media on a component, internally stepping the agent.
    /// Times out with [`io::ErrorKind::TimedOut`].
    pub async fn recv(
        &mut self,
        stream: StreamId,
        component: ComponentId,
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;

        loop {
            let buffered = self
                .media
                .get_mut(&(stream, component))
                .and_then(|q| q.pop_front());

            if let Some(data) = buffered {
                return Ok(data);
            }

            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no media received before the deadline",
                ));
            }

            select! {
                result = self.step() => result?,
                _ = sleep_until(deadline) => {}
            }
        }
    }

    /// Run the agent forever
    pub async fn run(&mut self) -> io::Result<()> {
        loop {
            self.step().await?;
        }
    }

    /// Wait for the next unit of work (socket readiness or timer) and handle
    /// it
    pub async fn step(&mut self) -> io::Result<()> {
        let timeout = self
            .agent
            .timeout(std::time::Instant::now())
            .map(|d| Instant::now() + d);

        let mut outbound = Vec::new();

        select! {
            (key, result) = poll_sockets(&mut self.sockets, &mut self.buf) => {
                let (len, source) = result?;

                let pkt = ReceivedPkt {
                    data: self.buf[..len].to_vec(),
                    source,
                    destination: key.2,
                    stream: key.0,
                    component: key.1,
                };

                let (agent, events) = (&mut self.agent, &mut self.events);
                let media = agent.receive(pkt, |ev| route_event(ev, &mut outbound, events));

                if let Some(pkt) = media {
                    self.media
                        .entry((pkt.stream, pkt.component))
                        .or_default()
                        .push_back(pkt.data);
                }
            }
            _ = sleep_or_pending(timeout) => {
                let (agent, events) = (&mut self.agent, &mut self.events);
                agent.poll(std::time::Instant::now(), |ev| route_event(ev, &mut outbound, events));
            }
        }

        self.flush(outbound).await
    }

    async fn flush(&mut self, outbound: Vec<IceEvent>) -> io::Result<()> {
        for event in outbound {
            let IceEvent::SendData {
                stream,
                component,
                data,
                source,
                target,
            } = event
            else {
                continue;
            };

            let Some(socket) = self.sockets.get(&(stream, component, source)) else {
                log::warn!("no socket bound to {source} for stream={stream} component={component}");
                continue;
            };

            if let Err(e) = socket.send_to(&data, target).await {
                log::warn!("failed to send {} bytes to {target}, {e}", data.len());
            }
        }

        Ok(())
    }
}

fn route_event(event: IceEvent, outbound: &mut Vec<IceEvent>, events: &mut Events) {
    match event {
        event @ IceEvent::SendData { .. } => outbound.push(event),
        event => events.push(event),
    }
}

async fn sleep_or_pending(instant: Option<Instant>) {
    match instant {
        Some(instant) => sleep_until(instant).await,
        None => pending().await,
    }
}

async fn poll_sockets(
    sockets: &mut HashMap<(StreamId, ComponentId, SocketAddr), UdpSocket>,
    buf: &mut [u8],
) -> (
    (StreamId, ComponentId, SocketAddr),
    io::Result<(usize, SocketAddr)>,
) {
    poll_fn(|cx| {
        for (socket_id, socket) in sockets.iter_mut() {
            let mut read_buf = ReadBuf::new(buf);

            if let Poll::Ready(result) = socket.poll_recv_from(cx, &mut read_buf) {
                let result = result.map(|source| (read_buf.filled().len(), source));
                return Poll::Ready((*socket_id, result));
            }
        }

        Poll::Pending
    })
    .await
}

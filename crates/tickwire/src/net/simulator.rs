//! Impaired and in-memory transports for exercising loss and latency.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::stats::PacketLossSimulation;
use super::transport::Transport;

#[derive(Debug)]
struct DelayedDatagram {
    release_time: Instant,
    order: u64,
    from: SocketAddr,
    to: SocketAddr,
    bytes: Vec<u8>,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Wraps a transport and applies [`PacketLossSimulation`] to outgoing
/// datagrams. Delayed datagrams go out on a later send or receive call.
pub struct LossyTransport<T> {
    inner: T,
    simulation: PacketLossSimulation,
    delayed: BinaryHeap<DelayedDatagram>,
    next_order: u64,
    dropped: u64,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, simulation: PacketLossSimulation) -> Self {
        Self {
            inner,
            simulation,
            delayed: BinaryHeap::new(),
            next_order: 0,
            dropped: 0,
        }
    }

    pub fn simulation(&self) -> &PacketLossSimulation {
        &self.simulation
    }

    pub fn set_simulation(&mut self, simulation: PacketLossSimulation) {
        self.simulation = simulation;
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn delayed(&self) -> usize {
        self.delayed.len()
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn flush_due(&mut self) -> io::Result<()> {
        let now = Instant::now();
        while self.delayed.peek().is_some_and(|d| d.release_time <= now) {
            if let Some(datagram) = self.delayed.pop() {
                self.inner.send_datagram(datagram.to, &datagram.bytes)?;
            }
        }
        Ok(())
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send_datagram(&mut self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        self.flush_due()?;

        if self.simulation.should_drop() {
            self.dropped += 1;
            return Ok(bytes.len());
        }

        let delay = self.simulation.delay_ms();
        if delay == 0 {
            return self.inner.send_datagram(peer, bytes);
        }

        let from = self.inner.local_addr()?;
        self.delayed.push(DelayedDatagram {
            release_time: Instant::now() + Duration::from_millis(u64::from(delay)),
            order: self.next_order,
            from,
            to: peer,
            bytes: bytes.to_vec(),
        });
        self.next_order += 1;
        Ok(bytes.len())
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.flush_due()?;
        self.inner.recv_datagram(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Returns true for datagrams that should be dropped.
pub type DropFilter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> bool>;

struct SimState {
    now: Instant,
    links: HashMap<SocketAddr, PacketLossSimulation>,
    inboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    in_transit: BinaryHeap<DelayedDatagram>,
    filter: Option<DropFilter>,
    rng: u64,
    next_order: u64,
    delivered: u64,
    dropped: u64,
}

impl SimState {
    fn next_unit(&mut self) -> f32 {
        // xorshift64
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng = x;
        (x >> 40) as f32 / (1u64 << 24) as f32
    }

    fn send(&mut self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        if let Some(filter) = self.filter.as_mut()
            && filter(from, to, bytes)
        {
            self.dropped += 1;
            return;
        }

        let mut delay = Duration::ZERO;
        if let Some(link) = self.links.get(&from).cloned()
            && link.enabled
        {
            if link.loss_percent > 0.0 && self.next_unit() * 100.0 < link.loss_percent {
                self.dropped += 1;
                return;
            }
            let range = link.max_latency_ms.saturating_sub(link.min_latency_ms);
            let jitter = (self.next_unit() * link.jitter_ms as f32) as u32;
            let spread = (self.next_unit() * range as f32) as u32;
            delay = Duration::from_millis(u64::from(link.min_latency_ms + spread + jitter));
        }

        self.in_transit.push(DelayedDatagram {
            release_time: self.now + delay,
            order: self.next_order,
            from,
            to,
            bytes: bytes.to_vec(),
        });
        self.next_order += 1;
    }

    fn release_due(&mut self) {
        while self
            .in_transit
            .peek()
            .is_some_and(|d| d.release_time <= self.now)
        {
            let Some(datagram) = self.in_transit.pop() else {
                break;
            };
            match self.inboxes.get_mut(&datagram.to) {
                Some(inbox) => {
                    inbox.push_back((datagram.from, datagram.bytes));
                    self.delivered += 1;
                }
                None => self.dropped += 1,
            }
        }
    }
}

/// In-memory network shared by any number of [`SimulatedTransport`]s.
///
/// Time only moves through [`advance`](Self::advance), so tests are
/// deterministic for a given seed.
#[derive(Clone)]
pub struct NetworkSimulator {
    state: Rc<RefCell<SimState>>,
}

impl fmt::Debug for NetworkSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("NetworkSimulator")
            .field("now", &state.now)
            .field("in_transit", &state.in_transit.len())
            .field("delivered", &state.delivered)
            .field("dropped", &state.dropped)
            .finish()
    }
}

impl NetworkSimulator {
    pub fn new(now: Instant) -> Self {
        Self::with_seed(now, 0x9E37_79B9_7F4A_7C15)
    }

    pub fn with_seed(now: Instant, seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                now,
                links: HashMap::new(),
                inboxes: HashMap::new(),
                in_transit: BinaryHeap::new(),
                filter: None,
                rng: seed.max(1),
                next_order: 0,
                delivered: 0,
                dropped: 0,
            })),
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<SimulatedTransport> {
        let mut state = self.state.borrow_mut();
        if state.inboxes.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already bound"),
            ));
        }
        state.inboxes.insert(addr, VecDeque::new());
        Ok(SimulatedTransport {
            addr,
            state: Rc::clone(&self.state),
        })
    }

    /// Impairs every datagram sent from `from`.
    pub fn set_link(&self, from: SocketAddr, simulation: PacketLossSimulation) {
        let mut state = self.state.borrow_mut();
        if simulation.enabled {
            state.links.insert(from, simulation);
        } else {
            state.links.remove(&from);
        }
    }

    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + 'static,
    {
        self.state.borrow_mut().filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.state.borrow_mut().filter = None;
    }

    pub fn advance(&self, now: Instant) {
        let mut state = self.state.borrow_mut();
        if now > state.now {
            state.now = now;
        }
        state.release_due();
    }

    pub fn now(&self) -> Instant {
        self.state.borrow().now
    }

    pub fn delivered(&self) -> u64 {
        self.state.borrow().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.state.borrow().dropped
    }

    pub fn in_transit(&self) -> usize {
        self.state.borrow().in_transit.len()
    }
}

pub struct SimulatedTransport {
    addr: SocketAddr,
    state: Rc<RefCell<SimState>>,
}

impl fmt::Debug for SimulatedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedTransport")
            .field("addr", &self.addr)
            .finish()
    }
}

impl Transport for SimulatedTransport {
    fn send_datagram(&mut self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.send(self.addr, peer, bytes);
        state.release_due();
        Ok(bytes.len())
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut state = self.state.borrow_mut();
        state.release_due();
        let Some((from, bytes)) = state
            .inboxes
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(Some((len, from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.inboxes.remove(&self.addr);
        }
    }
}
